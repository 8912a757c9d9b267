//! TDS token stream definitions.
//!
//! Tokens are the units of a TDS response. Each token starts with a 1-byte
//! tag followed by a body whose size is either fixed, given by a length
//! prefix, or implied by its own nested counts.
//!
//! ## Decoding
//!
//! [`Token::decode`] reads exactly one token from a [`Buf`]. An error for
//! which [`ProtocolError::is_incomplete`] holds means the buffer ended before
//! the token did and nothing is wrong with the bytes seen so far; the caller
//! should buffer more data and decode again from the same position. Every
//! other error means the stream is malformed.
//!
//! Length-prefixed tokens are decoded from exactly their declared body.
//! Leftover bytes are a [`ProtocolError::TokenLengthMismatch`] and running
//! out of body is a [`ProtocolError::TruncatedToken`].
//!
//! ```rust,ignore
//! use tds_protocol::token::{DecodeContext, Token};
//!
//! let ctx = DecodeContext::default();
//! let mut buf = &received[..];
//! while buf.has_remaining() {
//!     match Token::decode(&mut buf, &ctx)? {
//!         Token::Error(err) => eprintln!("{}: {}", err.number, err.message),
//!         Token::Done(done) => println!("{} rows", done.row_count),
//!         _ => {}
//!     }
//! }
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{
    decode_utf16_bytes, ensure_remaining, read_b_varchar, read_us_varchar, write_b_varchar,
    write_us_varchar, write_utf16_string,
};
use crate::error::{ProtocolError, Result};
use crate::feature::{FeatureId, DATA_CLASSIFICATION_VERSION_MAX};
use crate::version::TdsVersion;

/// Lowest severity class reported as an error rather than a warning.
pub const MIN_ERROR_CLASS: u8 = 11;

/// Lowest severity class that terminates the connection.
pub const FATAL_ERROR_CLASS: u8 = 20;

/// Sentinel index meaning "no entry" in a DATACLASSIFICATION property.
pub const CLASSIFICATION_INDEX_ABSENT: u16 = u16::MAX;

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Stored procedure return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Data classification (DATACLASSIFICATION).
    DataClassification = 0xA3,
    /// Table name (TABNAME).
    TabName = 0xA4,
    /// Column info (COLINFO).
    ColInfo = 0xA5,
    /// Order (ORDER).
    Order = 0xA9,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Output parameter (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Feature extension acknowledgment (FEATUREEXTACK).
    FeatureExtAck = 0xAE,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Session state (SESSIONSTATE).
    SessionState = 0xE4,
    /// SSPI authentication (SSPI).
    Sspi = 0xED,
    /// Federated authentication info (FEDAUTHINFO).
    FedAuthInfo = 0xEE,
    /// Done (DONE).
    Done = 0xFD,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Create from raw byte value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x79 => Some(Self::ReturnStatus),
            0x81 => Some(Self::ColMetaData),
            0xA3 => Some(Self::DataClassification),
            0xA4 => Some(Self::TabName),
            0xA5 => Some(Self::ColInfo),
            0xA9 => Some(Self::Order),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAC => Some(Self::ReturnValue),
            0xAD => Some(Self::LoginAck),
            0xAE => Some(Self::FeatureExtAck),
            0xD1 => Some(Self::Row),
            0xD2 => Some(Self::NbcRow),
            0xE3 => Some(Self::EnvChange),
            0xE4 => Some(Self::SessionState),
            0xED => Some(Self::Sspi),
            0xEE => Some(Self::FedAuthInfo),
            0xFD => Some(Self::Done),
            0xFE => Some(Self::DoneProc),
            0xFF => Some(Self::DoneInProc),
            _ => None,
        }
    }

    /// Whether the token carries result set data this crate does not model.
    #[must_use]
    pub const fn is_row_data(self) -> bool {
        matches!(
            self,
            Self::ColMetaData
                | Self::Row
                | Self::NbcRow
                | Self::ReturnValue
                | Self::ColInfo
                | Self::TabName
        )
    }
}

/// Session values that change how tokens are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    /// Negotiated TDS version.
    pub tds_version: TdsVersion,
    /// Data classification version acknowledged by the server, 0 if none.
    pub data_classification_version: u8,
}

impl Default for DecodeContext {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            data_classification_version: 0,
        }
    }
}

impl DecodeContext {
    /// Context for a given TDS version.
    #[must_use]
    pub fn new(tds_version: TdsVersion) -> Self {
        Self {
            tds_version,
            data_classification_version: 0,
        }
    }

    fn has_classification_rank(&self) -> bool {
        self.data_classification_version >= DATA_CLASSIFICATION_VERSION_MAX
    }
}

/// A decoded token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// ERROR.
    Error(ServerMessage),
    /// INFO.
    Info(ServerMessage),
    /// LOGINACK.
    LoginAck(LoginAck),
    /// FEATUREEXTACK.
    FeatureExtAck(FeatureExtAck),
    /// FEDAUTHINFO.
    FedAuthInfo(FedAuthInfo),
    /// DATACLASSIFICATION.
    DataClassification(DataClassification),
    /// ENVCHANGE.
    EnvChange(EnvChange),
    /// DONE.
    Done(Done),
    /// DONEPROC.
    DoneProc(Done),
    /// DONEINPROC.
    DoneInProc(Done),
    /// RETURNSTATUS.
    ReturnStatus(i32),
    /// ORDER.
    Order(Order),
    /// SESSIONSTATE.
    SessionState(Bytes),
    /// SSPI.
    Sspi(Bytes),
}

impl Token {
    /// The wire tag of this token.
    #[must_use]
    pub const fn token_type(&self) -> TokenType {
        match self {
            Self::Error(_) => TokenType::Error,
            Self::Info(_) => TokenType::Info,
            Self::LoginAck(_) => TokenType::LoginAck,
            Self::FeatureExtAck(_) => TokenType::FeatureExtAck,
            Self::FedAuthInfo(_) => TokenType::FedAuthInfo,
            Self::DataClassification(_) => TokenType::DataClassification,
            Self::EnvChange(_) => TokenType::EnvChange,
            Self::Done(_) => TokenType::Done,
            Self::DoneProc(_) => TokenType::DoneProc,
            Self::DoneInProc(_) => TokenType::DoneInProc,
            Self::ReturnStatus(_) => TokenType::ReturnStatus,
            Self::Order(_) => TokenType::Order,
            Self::SessionState(_) => TokenType::SessionState,
            Self::Sspi(_) => TokenType::Sspi,
        }
    }

    /// Decode one token, tag included.
    pub fn decode(src: &mut impl Buf, ctx: &DecodeContext) -> Result<Self> {
        ensure_remaining(src, 1)?;
        let tag = src.get_u8();
        let token_type = TokenType::from_u8(tag).ok_or(ProtocolError::InvalidTokenType(tag))?;

        match token_type {
            TokenType::Error => ServerMessage::decode(src, token_type, ctx).map(Self::Error),
            TokenType::Info => ServerMessage::decode(src, token_type, ctx).map(Self::Info),
            TokenType::LoginAck => LoginAck::decode(src).map(Self::LoginAck),
            TokenType::FeatureExtAck => FeatureExtAck::decode(src).map(Self::FeatureExtAck),
            TokenType::FedAuthInfo => FedAuthInfo::decode(src).map(Self::FedAuthInfo),
            TokenType::DataClassification => {
                DataClassification::decode(src, ctx).map(Self::DataClassification)
            }
            TokenType::EnvChange => EnvChange::decode(src).map(Self::EnvChange),
            TokenType::Done => Done::decode(src, ctx).map(Self::Done),
            TokenType::DoneProc => Done::decode(src, ctx).map(Self::DoneProc),
            TokenType::DoneInProc => Done::decode(src, ctx).map(Self::DoneInProc),
            TokenType::ReturnStatus => {
                ensure_remaining(src, 4)?;
                Ok(Self::ReturnStatus(src.get_i32_le()))
            }
            TokenType::Order => Order::decode(src).map(Self::Order),
            TokenType::SessionState => {
                ensure_remaining(src, 4)?;
                let declared = src.get_u32_le() as usize;
                take_body(src, declared).map(Self::SessionState)
            }
            TokenType::Sspi => {
                ensure_remaining(src, 2)?;
                let declared = src.get_u16_le() as usize;
                take_body(src, declared).map(Self::Sspi)
            }
            other => {
                debug_assert!(other.is_row_data());
                Err(ProtocolError::UnsupportedToken(tag))
            }
        }
    }

    /// Encode the token, tag included.
    pub fn encode(&self, dst: &mut impl BufMut, ctx: &DecodeContext) -> Result<()> {
        match self {
            Self::Error(msg) | Self::Info(msg) => msg.encode(dst, self.token_type(), ctx),
            Self::LoginAck(ack) => ack.encode(dst),
            Self::FeatureExtAck(ack) => {
                ack.encode(dst);
                Ok(())
            }
            Self::FedAuthInfo(info) => {
                info.encode(dst);
                Ok(())
            }
            Self::DataClassification(dc) => dc.encode(dst, ctx),
            Self::EnvChange(env) => env.encode(dst),
            Self::Done(done) | Self::DoneProc(done) | Self::DoneInProc(done) => {
                done.encode(dst, self.token_type(), ctx);
                Ok(())
            }
            Self::ReturnStatus(status) => {
                dst.put_u8(TokenType::ReturnStatus as u8);
                dst.put_i32_le(*status);
                Ok(())
            }
            Self::Order(order) => order.encode(dst),
            Self::SessionState(data) => {
                dst.put_u8(TokenType::SessionState as u8);
                dst.put_u32_le(data.len() as u32);
                dst.put_slice(data);
                Ok(())
            }
            Self::Sspi(data) => put_u16_body(dst, TokenType::Sspi, data),
        }
    }
}

/// Take a declared body off the front of `src`.
fn take_body(src: &mut impl Buf, declared: usize) -> Result<Bytes> {
    ensure_remaining(src, declared)?;
    Ok(src.copy_to_bytes(declared))
}

/// Decode a whole length-prefixed body, requiring every byte to be consumed.
fn decode_body<T>(
    token: TokenType,
    mut body: Bytes,
    decode: impl FnOnce(&mut Bytes) -> Result<T>,
) -> Result<T> {
    let declared = body.len();
    let value = decode(&mut body).map_err(|e| {
        if e.is_incomplete() {
            ProtocolError::TruncatedToken {
                token: token as u8,
                declared,
            }
        } else {
            e
        }
    })?;
    if body.has_remaining() {
        return Err(ProtocolError::TokenLengthMismatch {
            token: token as u8,
            declared,
            consumed: declared - body.remaining(),
        });
    }
    Ok(value)
}

fn put_u16_body(dst: &mut impl BufMut, token: TokenType, body: &[u8]) -> Result<()> {
    let len = u16::try_from(body.len()).map_err(|_| ProtocolError::PayloadTooLarge(body.len()))?;
    dst.put_u8(token as u8);
    dst.put_u16_le(len);
    dst.put_slice(body);
    Ok(())
}

/// Server ERROR or INFO message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Message state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: u32,
}

impl ServerMessage {
    /// Create a message with empty server and procedure names.
    #[must_use]
    pub fn new(number: i32, class: u8, message: impl Into<String>) -> Self {
        Self {
            number,
            state: 0,
            class,
            message: message.into(),
            server: String::new(),
            procedure: String::new(),
            line: 0,
        }
    }

    /// Whether the severity is high enough to count as an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.class >= MIN_ERROR_CLASS
    }

    /// Whether the severity terminates the connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= FATAL_ERROR_CLASS
    }

    fn decode(src: &mut impl Buf, token: TokenType, ctx: &DecodeContext) -> Result<Self> {
        ensure_remaining(src, 2)?;
        let declared = src.get_u16_le() as usize;
        let body = take_body(src, declared)?;
        let wide_line = ctx.tds_version.is_at_least_7_2();

        decode_body(token, body, |b| {
            ensure_remaining(b, 6)?;
            let number = b.get_i32_le();
            let state = b.get_u8();
            let class = b.get_u8();
            let message = read_us_varchar(b)?;
            let server = read_b_varchar(b)?;
            let procedure = read_b_varchar(b)?;
            let line = if wide_line {
                ensure_remaining(b, 4)?;
                b.get_u32_le()
            } else {
                ensure_remaining(b, 2)?;
                u32::from(b.get_u16_le())
            };
            Ok(Self {
                number,
                state,
                class,
                message,
                server,
                procedure,
                line,
            })
        })
    }

    fn encode(&self, dst: &mut impl BufMut, token: TokenType, ctx: &DecodeContext) -> Result<()> {
        let mut body = BytesMut::new();
        body.put_i32_le(self.number);
        body.put_u8(self.state);
        body.put_u8(self.class);
        write_us_varchar(&mut body, &self.message)?;
        write_b_varchar(&mut body, &self.server)?;
        write_b_varchar(&mut body, &self.procedure)?;
        if ctx.tds_version.is_at_least_7_2() {
            body.put_u32_le(self.line);
        } else {
            body.put_u16_le(self.line as u16);
        }
        put_u16_body(dst, token, &body)
    }
}

/// Login acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface type (1 = T-SQL).
    pub interface: u8,
    /// TDS version the server accepted.
    pub tds_version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Program major version.
    pub major: u8,
    /// Program minor version.
    pub minor: u8,
    /// Program build number.
    pub build: u16,
}

impl LoginAck {
    fn decode(src: &mut impl Buf) -> Result<Self> {
        ensure_remaining(src, 2)?;
        let declared = src.get_u16_le() as usize;
        let body = take_body(src, declared)?;

        decode_body(TokenType::LoginAck, body, |b| {
            ensure_remaining(b, 5)?;
            let interface = b.get_u8();
            // The only big-endian field in the token stream.
            let tds_version = TdsVersion::new(b.get_u32());
            let prog_name = read_b_varchar(b)?;
            ensure_remaining(b, 4)?;
            let major = b.get_u8();
            let minor = b.get_u8();
            let build = b.get_u16();
            Ok(Self {
                interface,
                tds_version,
                prog_name,
                major,
                minor,
                build,
            })
        })
    }

    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut body = BytesMut::new();
        body.put_u8(self.interface);
        body.put_u32(self.tds_version.raw());
        write_b_varchar(&mut body, &self.prog_name)?;
        body.put_u8(self.major);
        body.put_u8(self.minor);
        body.put_u16(self.build);
        put_u16_body(dst, TokenType::LoginAck, &body)
    }
}

/// One acknowledged feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureAck {
    /// Feature ID.
    pub id: FeatureId,
    /// Feature data.
    pub data: Bytes,
}

/// Feature extension acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureExtAck {
    /// Acknowledged features, in wire order.
    pub features: Vec<FeatureAck>,
}

impl FeatureExtAck {
    /// Look up an acknowledged feature.
    #[must_use]
    pub fn get(&self, id: FeatureId) -> Option<&FeatureAck> {
        self.features.iter().find(|f| f.id == id)
    }

    fn decode(src: &mut impl Buf) -> Result<Self> {
        let mut features = Vec::new();
        loop {
            ensure_remaining(src, 1)?;
            let raw = src.get_u8();
            if raw == FeatureId::Terminator as u8 {
                break;
            }
            let id = FeatureId::from_u8(raw)?;
            ensure_remaining(src, 4)?;
            let len = src.get_u32_le() as usize;
            let data = take_body(src, len)?;
            features.push(FeatureAck { id, data });
        }
        Ok(Self { features })
    }

    fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::FeatureExtAck as u8);
        for feature in &self.features {
            dst.put_u8(feature.id as u8);
            dst.put_u32_le(feature.data.len() as u32);
            dst.put_slice(&feature.data);
        }
        dst.put_u8(FeatureId::Terminator as u8);
    }
}

/// Federated authentication info.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FedAuthInfo {
    /// Token endpoint URL.
    pub sts_url: String,
    /// Service principal name.
    pub spn: String,
}

impl FedAuthInfo {
    const STS_URL: u8 = 0x01;
    const SPN: u8 = 0x02;
    const OPTION_HEADER_SIZE: usize = 9;

    fn decode(src: &mut impl Buf) -> Result<Self> {
        ensure_remaining(src, 4)?;
        let declared = src.get_u32_le() as usize;
        let body = take_body(src, declared)?;

        if body.len() < 4 {
            return Err(ProtocolError::InvalidFedAuthInfo("missing option count"));
        }
        let count = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let table_end = count
            .checked_mul(Self::OPTION_HEADER_SIZE)
            .and_then(|n| n.checked_add(4))
            .filter(|&end| end <= body.len())
            .ok_or(ProtocolError::InvalidFedAuthInfo("option table exceeds token length"))?;

        let mut info = Self::default();
        let mut table = &body[4..table_end];
        for _ in 0..count {
            let id = table.get_u8();
            let len = table.get_u32_le() as usize;
            let offset = table.get_u32_le() as usize;
            let end = offset
                .checked_add(len)
                .filter(|&end| end <= body.len())
                .ok_or(ProtocolError::InvalidFedAuthInfo("option data out of bounds"))?;

            match id {
                Self::STS_URL => info.sts_url = decode_utf16_bytes(&body[offset..end])?,
                Self::SPN => info.spn = decode_utf16_bytes(&body[offset..end])?,
                _ => {}
            }
        }
        Ok(info)
    }

    fn encode(&self, dst: &mut impl BufMut) {
        let options = [(Self::STS_URL, &self.sts_url), (Self::SPN, &self.spn)];
        let mut table = BytesMut::new();
        let mut data = BytesMut::new();
        let data_start = 4 + options.len() * Self::OPTION_HEADER_SIZE;

        table.put_u32_le(options.len() as u32);
        for (id, value) in options {
            let offset = data_start + data.len();
            write_utf16_string(&mut data, value);
            table.put_u8(id);
            table.put_u32_le((data_start + data.len() - offset) as u32);
            table.put_u32_le(offset as u32);
        }

        dst.put_u8(TokenType::FedAuthInfo as u8);
        dst.put_u32_le((table.len() + data.len()) as u32);
        dst.put_slice(&table);
        dst.put_slice(&data);
    }
}

/// A named entry in a DATACLASSIFICATION token (label or information type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationName {
    /// Display name.
    pub name: String,
    /// Identifier.
    pub id: String,
}

/// Classification of one column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnSensitivity {
    /// Properties attached to the column.
    pub properties: Vec<SensitivityProperty>,
}

/// One label/information type pair attached to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensitivityProperty {
    /// Index into [`DataClassification::labels`].
    pub label: Option<u16>,
    /// Index into [`DataClassification::information_types`].
    pub information_type: Option<u16>,
    /// Sensitivity rank, from classification version 2.
    pub rank: Option<i32>,
}

/// Sensitivity classification of a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataClassification {
    /// Sensitivity labels.
    pub labels: Vec<ClassificationName>,
    /// Information types.
    pub information_types: Vec<ClassificationName>,
    /// Overall sensitivity rank, from classification version 2.
    pub rank: Option<i32>,
    /// Per-column classification, in column order.
    pub columns: Vec<ColumnSensitivity>,
}

impl DataClassification {
    /// Label of a property, if present.
    #[must_use]
    pub fn label(&self, property: &SensitivityProperty) -> Option<&ClassificationName> {
        property.label.and_then(|i| self.labels.get(i as usize))
    }

    /// Information type of a property, if present.
    #[must_use]
    pub fn information_type(&self, property: &SensitivityProperty) -> Option<&ClassificationName> {
        property
            .information_type
            .and_then(|i| self.information_types.get(i as usize))
    }

    fn decode(src: &mut impl Buf, ctx: &DecodeContext) -> Result<Self> {
        let with_rank = ctx.has_classification_rank();
        let labels = read_names(src)?;
        let information_types = read_names(src)?;
        let rank = if with_rank {
            ensure_remaining(src, 4)?;
            Some(src.get_i32_le())
        } else {
            None
        };

        ensure_remaining(src, 2)?;
        let column_count = src.get_u16_le() as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            ensure_remaining(src, 2)?;
            let property_count = src.get_u16_le() as usize;
            let mut properties = Vec::with_capacity(property_count);
            for _ in 0..property_count {
                ensure_remaining(src, if with_rank { 8 } else { 4 })?;
                let label = resolve_index(src.get_u16_le(), labels.len(), "sensitivity label")?;
                let information_type = resolve_index(
                    src.get_u16_le(),
                    information_types.len(),
                    "information type",
                )?;
                let rank = with_rank.then(|| src.get_i32_le());
                properties.push(SensitivityProperty {
                    label,
                    information_type,
                    rank,
                });
            }
            columns.push(ColumnSensitivity { properties });
        }

        Ok(Self {
            labels,
            information_types,
            rank,
            columns,
        })
    }

    fn encode(&self, dst: &mut impl BufMut, ctx: &DecodeContext) -> Result<()> {
        let with_rank = ctx.has_classification_rank();
        dst.put_u8(TokenType::DataClassification as u8);
        write_names(dst, &self.labels)?;
        write_names(dst, &self.information_types)?;
        if with_rank {
            dst.put_i32_le(self.rank.unwrap_or(-1));
        }
        dst.put_u16_le(self.columns.len() as u16);
        for column in &self.columns {
            dst.put_u16_le(column.properties.len() as u16);
            for property in &column.properties {
                dst.put_u16_le(property.label.unwrap_or(CLASSIFICATION_INDEX_ABSENT));
                dst.put_u16_le(
                    property
                        .information_type
                        .unwrap_or(CLASSIFICATION_INDEX_ABSENT),
                );
                if with_rank {
                    dst.put_i32_le(property.rank.unwrap_or(-1));
                }
            }
        }
        Ok(())
    }
}

fn read_names(src: &mut impl Buf) -> Result<Vec<ClassificationName>> {
    ensure_remaining(src, 2)?;
    let count = src.get_u16_le() as usize;
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_us_varchar(src)?;
        let id = read_us_varchar(src)?;
        names.push(ClassificationName { name, id });
    }
    Ok(names)
}

fn write_names(dst: &mut impl BufMut, names: &[ClassificationName]) -> Result<()> {
    dst.put_u16_le(names.len() as u16);
    for entry in names {
        write_us_varchar(dst, &entry.name)?;
        write_us_varchar(dst, &entry.id)?;
    }
    Ok(())
}

fn resolve_index(raw: u16, count: usize, kind: &'static str) -> Result<Option<u16>> {
    if raw == CLASSIFICATION_INDEX_ABSENT {
        Ok(None)
    } else if (raw as usize) < count {
        Ok(Some(raw))
    } else {
        Err(ProtocolError::IndexOutOfRange {
            kind,
            index: raw,
            count,
        })
    }
}

/// Environment change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvChangeType {
    /// Database changed.
    Database,
    /// Language changed.
    Language,
    /// Character set changed.
    CharacterSet,
    /// Packet size changed.
    PacketSize,
    /// Unicode sorting locale id.
    UnicodeSortingLocalId,
    /// Unicode comparison flags.
    UnicodeComparisonFlags,
    /// SQL collation.
    SqlCollation,
    /// Begin transaction.
    BeginTransaction,
    /// Commit transaction.
    CommitTransaction,
    /// Rollback transaction.
    RollbackTransaction,
    /// Enlist DTC transaction.
    EnlistDtcTransaction,
    /// Defect transaction.
    DefectTransaction,
    /// Real-time log shipping.
    RealTimeLogShipping,
    /// Promote transaction.
    PromoteTransaction,
    /// Transaction manager address.
    TransactionManagerAddress,
    /// Transaction ended.
    TransactionEnded,
    /// Reset connection acknowledgment.
    ResetConnectionAck,
    /// User instance started.
    UserInstanceStarted,
    /// Routing information.
    Routing,
    /// A type this crate does not interpret.
    Other(u8),
}

impl EnvChangeType {
    /// Create from raw byte value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::CharacterSet,
            4 => Self::PacketSize,
            5 => Self::UnicodeSortingLocalId,
            6 => Self::UnicodeComparisonFlags,
            7 => Self::SqlCollation,
            8 => Self::BeginTransaction,
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            11 => Self::EnlistDtcTransaction,
            12 => Self::DefectTransaction,
            13 => Self::RealTimeLogShipping,
            15 => Self::PromoteTransaction,
            16 => Self::TransactionManagerAddress,
            17 => Self::TransactionEnded,
            18 => Self::ResetConnectionAck,
            19 => Self::UserInstanceStarted,
            20 => Self::Routing,
            other => Self::Other(other),
        }
    }

    /// Raw byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Database => 1,
            Self::Language => 2,
            Self::CharacterSet => 3,
            Self::PacketSize => 4,
            Self::UnicodeSortingLocalId => 5,
            Self::UnicodeComparisonFlags => 6,
            Self::SqlCollation => 7,
            Self::BeginTransaction => 8,
            Self::CommitTransaction => 9,
            Self::RollbackTransaction => 10,
            Self::EnlistDtcTransaction => 11,
            Self::DefectTransaction => 12,
            Self::RealTimeLogShipping => 13,
            Self::PromoteTransaction => 15,
            Self::TransactionManagerAddress => 16,
            Self::TransactionEnded => 17,
            Self::ResetConnectionAck => 18,
            Self::UserInstanceStarted => 19,
            Self::Routing => 20,
            Self::Other(value) => value,
        }
    }

    const fn is_string(self) -> bool {
        matches!(
            self,
            Self::Database
                | Self::Language
                | Self::CharacterSet
                | Self::PacketSize
                | Self::UnicodeSortingLocalId
                | Self::UnicodeComparisonFlags
                | Self::UserInstanceStarted
        )
    }
}

/// Environment change value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// `B_VARCHAR` value.
    String(String),
    /// Binary value.
    Binary(Bytes),
    /// Routing target.
    Routing {
        /// Protocol (0 = TCP).
        protocol: u8,
        /// Port.
        port: u16,
        /// Server host name.
        server: String,
    },
}

/// Environment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// Change type.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Old value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    /// New value as a string, for string-valued changes.
    #[must_use]
    pub fn new_string(&self) -> Option<&str> {
        match &self.new_value {
            EnvChangeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// New packet size, if this is a valid packet size change.
    #[must_use]
    pub fn packet_size(&self) -> Option<u32> {
        (self.env_type == EnvChangeType::PacketSize)
            .then(|| self.new_string())
            .flatten()
            .and_then(|s| s.parse().ok())
    }

    fn decode(src: &mut impl Buf) -> Result<Self> {
        ensure_remaining(src, 2)?;
        let declared = src.get_u16_le() as usize;
        let body = take_body(src, declared)?;

        decode_body(TokenType::EnvChange, body, |b| {
            ensure_remaining(b, 1)?;
            let env_type = EnvChangeType::from_u8(b.get_u8());
            let (new_value, old_value) = match env_type {
                t if t.is_string() => (
                    EnvChangeValue::String(read_b_varchar(b)?),
                    EnvChangeValue::String(read_b_varchar(b)?),
                ),
                EnvChangeType::Routing => {
                    ensure_remaining(b, 5)?;
                    let _routing_len = b.get_u16_le();
                    let protocol = b.get_u8();
                    let port = b.get_u16_le();
                    let server = read_us_varchar(b)?;
                    ensure_remaining(b, 2)?;
                    let old_len = b.get_u16_le() as usize;
                    let old = take_body(b, old_len)?;
                    (
                        EnvChangeValue::Routing {
                            protocol,
                            port,
                            server,
                        },
                        EnvChangeValue::Binary(old),
                    )
                }
                EnvChangeType::PromoteTransaction => {
                    ensure_remaining(b, 4)?;
                    let new_len = b.get_u32_le() as usize;
                    let new = take_body(b, new_len)?;
                    (EnvChangeValue::Binary(new), read_b_varbyte(b)?)
                }
                EnvChangeType::Other(_) => {
                    let rest = b.copy_to_bytes(b.remaining());
                    (EnvChangeValue::Binary(rest), EnvChangeValue::Binary(Bytes::new()))
                }
                _ => (read_b_varbyte(b)?, read_b_varbyte(b)?),
            };
            Ok(Self {
                env_type,
                new_value,
                old_value,
            })
        })
    }

    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut body = BytesMut::new();
        body.put_u8(self.env_type.as_u8());
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::Routing, EnvChangeValue::Routing { protocol, port, server }) => {
                let mut routing = BytesMut::new();
                routing.put_u8(*protocol);
                routing.put_u16_le(*port);
                write_us_varchar(&mut routing, server)?;
                body.put_u16_le(routing.len() as u16);
                body.put_slice(&routing);
                body.put_u16_le(0);
                return put_u16_body(dst, TokenType::EnvChange, &body);
            }
            (EnvChangeType::PromoteTransaction, EnvChangeValue::Binary(data)) => {
                body.put_u32_le(data.len() as u32);
                body.put_slice(data);
            }
            (_, value) => write_env_value(&mut body, value)?,
        }
        if !matches!(self.env_type, EnvChangeType::Other(_)) {
            write_env_value(&mut body, &self.old_value)?;
        }
        put_u16_body(dst, TokenType::EnvChange, &body)
    }
}

fn read_b_varbyte(src: &mut impl Buf) -> Result<EnvChangeValue> {
    ensure_remaining(src, 1)?;
    let len = src.get_u8() as usize;
    take_body(src, len).map(EnvChangeValue::Binary)
}

fn write_env_value(dst: &mut impl BufMut, value: &EnvChangeValue) -> Result<()> {
    match value {
        EnvChangeValue::String(s) => write_b_varchar(dst, s),
        EnvChangeValue::Binary(data) => {
            let len =
                u8::try_from(data.len()).map_err(|_| ProtocolError::PayloadTooLarge(data.len()))?;
            dst.put_u8(len);
            dst.put_slice(data);
            Ok(())
        }
        EnvChangeValue::Routing { .. } => Err(ProtocolError::InvalidTokenType(
            TokenType::EnvChange as u8,
        )),
    }
}

bitflags! {
    /// DONE, DONEPROC and DONEINPROC status bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is in progress.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention signal.
        const ATTN = 0x0020;
        /// A server error terminated the statement.
        const SRVERROR = 0x0100;
    }
}

/// Completion of a statement, procedure or statement within a procedure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Done {
    /// Status bits.
    pub status: DoneStatus,
    /// Current command token.
    pub cur_cmd: u16,
    /// Row count, valid when [`DoneStatus::COUNT`] is set.
    pub row_count: u64,
}

impl Done {
    /// Token body size for a given version.
    #[must_use]
    pub const fn size(version: TdsVersion) -> usize {
        if version.is_at_least_7_2() { 12 } else { 8 }
    }

    /// Whether more results follow.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Whether this acknowledges an attention signal.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }

    /// Row count, if the server marked it valid.
    #[must_use]
    pub const fn count(&self) -> Option<u64> {
        if self.status.contains(DoneStatus::COUNT) {
            Some(self.row_count)
        } else {
            None
        }
    }

    fn decode(src: &mut impl Buf, ctx: &DecodeContext) -> Result<Self> {
        ensure_remaining(src, Self::size(ctx.tds_version))?;
        let status = DoneStatus::from_bits_retain(src.get_u16_le());
        let cur_cmd = src.get_u16_le();
        let row_count = if ctx.tds_version.is_at_least_7_2() {
            src.get_u64_le()
        } else {
            u64::from(src.get_u32_le())
        };
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    fn encode(&self, dst: &mut impl BufMut, token: TokenType, ctx: &DecodeContext) {
        dst.put_u8(token as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        if ctx.tds_version.is_at_least_7_2() {
            dst.put_u64_le(self.row_count);
        } else {
            dst.put_u32_le(self.row_count as u32);
        }
    }
}

/// Column ordering of a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    /// Ordered column numbers.
    pub columns: Vec<u16>,
}

impl Order {
    fn decode(src: &mut impl Buf) -> Result<Self> {
        ensure_remaining(src, 2)?;
        let declared = src.get_u16_le() as usize;
        let body = take_body(src, declared)?;

        decode_body(TokenType::Order, body, |b| {
            let mut columns = Vec::with_capacity(b.remaining() / 2);
            while b.remaining() >= 2 {
                columns.push(b.get_u16_le());
            }
            Ok(Self { columns })
        })
    }

    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut body = BytesMut::with_capacity(self.columns.len() * 2);
        self.columns.iter().for_each(|&c| body.put_u16_le(c));
        put_u16_body(dst, TokenType::Order, &body)
    }
}
