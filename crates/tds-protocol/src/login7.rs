//! TDS LOGIN7 message construction.
//!
//! ## Layout
//!
//! - Fixed 94-byte header: lengths, version, flags and an (offset, length)
//!   pair for every variable field
//! - Variable data section (UTF-16LE strings, obfuscated password)
//! - Optional FeatureExt block, reached through a 4-byte offset stored in
//!   the variable section and closed by 0xFF
//!
//! The password is obfuscated, not encrypted. It must only travel inside TLS.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16_string;
use crate::feature::{FeatureId, FeatureRequest};
use crate::version::TdsVersion;

/// LOGIN7 fixed header size.
pub const LOGIN7_HEADER_SIZE: usize = 94;

bitflags! {
    /// LOGIN7 OptionFlags1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags1: u8 {
        /// Big-endian byte order.
        const BYTE_ORDER_BE = 0x01;
        /// EBCDIC character set.
        const CHAR_EBCDIC = 0x02;
        /// Dump/load off.
        const DUMP_LOAD_OFF = 0x10;
        /// Warn on USE database.
        const USE_DB_NOTIFY = 0x20;
        /// Initial database change failure is fatal.
        const DATABASE_FATAL = 0x40;
        /// Warn on language change.
        const SET_LANG_WARN = 0x80;
    }
}

bitflags! {
    /// LOGIN7 OptionFlags2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags2: u8 {
        /// Initial language change failure is fatal.
        const LANGUAGE_FATAL = 0x01;
        /// ODBC client.
        const ODBC = 0x02;
        /// Integrated security.
        const INTEGRATED_SECURITY = 0x80;
    }
}

bitflags! {
    /// LOGIN7 OptionFlags3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags3: u8 {
        /// Password change request.
        const CHANGE_PASSWORD = 0x01;
        /// User instance.
        const USER_INSTANCE = 0x02;
        /// Unknown collations are accepted.
        const UNKNOWN_COLLATION_HANDLING = 0x08;
        /// A FeatureExt block is present.
        const EXTENSION = 0x10;
    }
}

/// LOGIN7 message builder.
#[derive(Debug, Clone)]
pub struct Login7 {
    /// TDS version requested.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client program version.
    pub client_prog_version: u32,
    /// Client process ID.
    pub client_pid: u32,
    /// Option flags 1.
    pub option_flags1: OptionFlags1,
    /// Option flags 2.
    pub option_flags2: OptionFlags2,
    /// Option flags 3.
    pub option_flags3: OptionFlags3,
    /// Read-only application intent.
    pub read_only_intent: bool,
    /// Client LCID.
    pub client_lcid: u32,
    /// Client machine name.
    pub hostname: String,
    /// SQL authentication user.
    pub username: String,
    /// SQL authentication password.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as typed by the user.
    pub server_name: String,
    /// Client interface library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
    /// Requested features.
    pub features: Vec<FeatureRequest>,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: 4096,
            client_prog_version: 0,
            client_pid: std::process::id(),
            option_flags1: OptionFlags1::USE_DB_NOTIFY | OptionFlags1::DATABASE_FATAL,
            option_flags2: OptionFlags2::LANGUAGE_FATAL | OptionFlags2::ODBC,
            option_flags3: OptionFlags3::UNKNOWN_COLLATION_HANDLING,
            read_only_intent: false,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: String::from("mssql-engine"),
            language: String::new(),
            database: String::new(),
            features: Vec::new(),
        }
    }
}

impl Login7 {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TDS version.
    #[must_use]
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn with_sql_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self.option_flags2.remove(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the client machine name.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Request a feature extension.
    #[must_use]
    pub fn with_feature(mut self, feature: FeatureRequest) -> Self {
        self.option_flags3.insert(OptionFlags3::EXTENSION);
        self.features.push(feature);
        self
    }

    /// Encode the LOGIN7 payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let has_extension = self.option_flags3.contains(OptionFlags3::EXTENSION);
        let mut var_data = BytesMut::with_capacity(256);
        let mut fields: Vec<(u16, u16)> = Vec::with_capacity(12);

        // (offset, length in characters) for each string field, in header order.
        let push_str = |var_data: &mut BytesMut, s: &str, obfuscate: bool| {
            let offset = (LOGIN7_HEADER_SIZE + var_data.len()) as u16;
            if obfuscate {
                write_obfuscated_password(var_data, s);
            } else {
                write_utf16_string(var_data, s);
            }
            (offset, s.encode_utf16().count() as u16)
        };

        fields.push(push_str(&mut var_data, &self.hostname, false));
        fields.push(push_str(&mut var_data, &self.username, false));
        fields.push(push_str(&mut var_data, &self.password, true));
        fields.push(push_str(&mut var_data, &self.app_name, false));
        fields.push(push_str(&mut var_data, &self.server_name, false));

        let extension_pointer_at = var_data.len();
        if has_extension {
            fields.push(((LOGIN7_HEADER_SIZE + var_data.len()) as u16, 4));
            var_data.put_u32_le(0);
        } else {
            fields.push(((LOGIN7_HEADER_SIZE + var_data.len()) as u16, 0));
        }

        fields.push(push_str(&mut var_data, &self.library_name, false));
        fields.push(push_str(&mut var_data, &self.language, false));
        fields.push(push_str(&mut var_data, &self.database, false));

        // SSPI, attach db file and change password are always empty.
        let tail_offset = (LOGIN7_HEADER_SIZE + var_data.len()) as u16;

        if has_extension {
            let feature_ext_offset = (LOGIN7_HEADER_SIZE + var_data.len()) as u32;
            var_data[extension_pointer_at..extension_pointer_at + 4]
                .copy_from_slice(&feature_ext_offset.to_le_bytes());
            for feature in &self.features {
                feature.encode(&mut var_data);
            }
            var_data.put_u8(FeatureId::Terminator as u8);
        }

        let total_length = LOGIN7_HEADER_SIZE + var_data.len();
        let mut buf = BytesMut::with_capacity(total_length);
        buf.put_u32_le(total_length as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(self.client_prog_version);
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(0); // connection id
        buf.put_u8(self.option_flags1.bits());
        buf.put_u8(self.option_flags2.bits());
        buf.put_u8(if self.read_only_intent { 0x20 } else { 0x00 });
        buf.put_u8(self.option_flags3.bits());
        buf.put_i32_le(0); // client time zone
        buf.put_u32_le(self.client_lcid);

        for (offset, len) in &fields {
            buf.put_u16_le(*offset);
            buf.put_u16_le(*len);
        }

        buf.put_slice(&[0u8; 6]); // client id
        for _ in 0..3 {
            buf.put_u16_le(tail_offset);
            buf.put_u16_le(0);
        }
        buf.put_u32_le(0); // long SSPI length

        buf.put_slice(&var_data);
        buf.freeze()
    }
}

/// Obfuscate a password: swap the nibbles of every byte, then XOR 0xA5.
fn write_obfuscated_password(dst: &mut impl BufMut, password: &str) {
    for unit in password.encode_utf16() {
        for byte in unit.to_le_bytes() {
            dst.put_u8(byte.rotate_right(4) ^ 0xA5);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::feature::DATA_CLASSIFICATION_VERSION_MAX;

    fn u16_at(buf: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([buf[at], buf[at + 1]])
    }

    fn u32_at(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    #[test]
    fn test_password_obfuscation() {
        let mut buf = BytesMut::new();
        write_obfuscated_password(&mut buf, "a");
        // 0x61 -> 0x16 -> 0xB3; 0x00 -> 0x00 -> 0xA5
        assert_eq!(&buf[..], &[0xB3, 0xA5]);
    }

    #[test]
    fn test_header_fields() {
        let encoded = Login7::new()
            .with_hostname("HOST")
            .with_sql_auth("sa", "pw")
            .with_database("db")
            .encode();

        assert_eq!(u32_at(&encoded, 0) as usize, encoded.len());
        assert_eq!(u32_at(&encoded, 4), TdsVersion::V7_4.raw());

        // Hostname is the first variable field.
        assert_eq!(u16_at(&encoded, 36) as usize, LOGIN7_HEADER_SIZE);
        assert_eq!(u16_at(&encoded, 38), 4);
        // Username follows immediately.
        assert_eq!(u16_at(&encoded, 40) as usize, LOGIN7_HEADER_SIZE + 8);
        assert_eq!(u16_at(&encoded, 42), 2);
    }

    #[test]
    fn test_feature_ext_pointer() {
        let login = Login7::new().with_feature(FeatureRequest::versioned(
            FeatureId::DataClassification,
            DATA_CLASSIFICATION_VERSION_MAX,
        ));
        let encoded = login.encode();
        assert_ne!(encoded[27] & OptionFlags3::EXTENSION.bits(), 0);

        // ibExtension/cbExtension is the sixth (offset, length) pair.
        let pointer_at = u16_at(&encoded, 56) as usize;
        assert_eq!(u16_at(&encoded, 58), 4);
        let block = u32_at(&encoded, pointer_at) as usize;
        assert_eq!(&encoded[block..], &[0x09, 1, 0, 0, 0, 2, 0xFF]);
    }
}
