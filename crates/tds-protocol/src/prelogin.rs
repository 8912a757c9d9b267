//! TDS pre-login message.
//!
//! The pre-login message is the first message exchanged on a TDS 7.x
//! connection. It negotiates encryption, MARS and federated authentication
//! before any TLS is established. Under TDS 8.0 the same message is sent
//! inside the already-established TLS session and its ENCRYPTION option is
//! ignored.
//!
//! ## Layout
//!
//! A table of option headers (`type(1) | offset(2, BE) | length(2, BE)`)
//! closed by a 0xFF terminator, followed by the option data. Offsets are
//! absolute from the start of the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::ensure_remaining;
use crate::error::{ProtocolError, Result};

/// Pre-login option types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version information.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name validation.
    Instance = 0x02,
    /// Client thread ID.
    ThreadId = 0x03,
    /// MARS (Multiple Active Result Sets) support.
    Mars = 0x04,
    /// Trace ID for distributed tracing.
    TraceId = 0x05,
    /// Federated authentication required.
    FedAuthRequired = 0x06,
    /// Nonce for federated authentication.
    Nonce = 0x07,
    /// Terminator (end of options).
    Terminator = 0xFF,
}

impl PreLoginOption {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Version),
            0x01 => Ok(Self::Encryption),
            0x02 => Ok(Self::Instance),
            0x03 => Ok(Self::ThreadId),
            0x04 => Ok(Self::Mars),
            0x05 => Ok(Self::TraceId),
            0x06 => Ok(Self::FedAuthRequired),
            0x07 => Ok(Self::Nonce),
            0xFF => Ok(Self::Terminator),
            _ => Err(ProtocolError::InvalidPreloginOption(value)),
        }
    }
}

/// Value of the ENCRYPTION pre-login option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login packet only.
    #[default]
    Off = 0x00,
    /// Encrypt the whole connection.
    On = 0x01,
    /// No TLS available on this side.
    NotSupported = 0x02,
    /// Encryption is required.
    Required = 0x03,
    /// Client certificate authentication.
    ClientCertAuth = 0x80,
}

impl EncryptionLevel {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Off),
            0x01 => Ok(Self::On),
            0x02 => Ok(Self::NotSupported),
            0x03 => Ok(Self::Required),
            0x80..=0x83 => Ok(Self::ClientCertAuth),
            _ => Err(ProtocolError::InvalidPreloginValue {
                option: "ENCRYPTION",
                value,
            }),
        }
    }
}

/// Pre-login message.
///
/// The same struct carries the client request and the server response.
/// `version` is the client driver version on the way out and the server
/// product version on the way back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreLogin {
    /// Version word (big-endian on the wire).
    pub version: u32,
    /// Sub-build number (little-endian on the wire).
    pub sub_build: u16,
    /// Encryption level.
    pub encryption: EncryptionLevel,
    /// Instance name. The client always sends the empty name.
    pub instance: String,
    /// Server reported an instance-name mismatch.
    pub instance_mismatch: bool,
    /// Client thread ID.
    pub thread_id: Option<u32>,
    /// MARS enabled.
    pub mars: bool,
    /// Federated authentication required.
    pub fed_auth_required: bool,
    /// Nonce sent back by the server.
    pub nonce: Option<[u8; 32]>,
}

impl Default for PreLogin {
    fn default() -> Self {
        Self::new()
    }
}

impl PreLogin {
    /// Create a client pre-login request.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: 0,
            sub_build: 0,
            encryption: EncryptionLevel::Off,
            instance: String::new(),
            instance_mismatch: false,
            thread_id: None,
            mars: false,
            fed_auth_required: false,
            nonce: None,
        }
    }

    /// Set the client driver version.
    #[must_use]
    pub fn with_version(mut self, version: u32, sub_build: u16) -> Self {
        self.version = version;
        self.sub_build = sub_build;
        self
    }

    /// Set the encryption level.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Enable MARS.
    #[must_use]
    pub fn with_mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Set the client thread ID.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Request federated authentication.
    #[must_use]
    pub fn with_fed_auth_required(mut self, required: bool) -> Self {
        self.fed_auth_required = required;
        self
    }

    /// Encode the message payload (without packet header).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut options: Vec<(PreLoginOption, BytesMut)> = Vec::with_capacity(6);

        let mut version = BytesMut::with_capacity(6);
        version.put_u32(self.version);
        version.put_u16_le(self.sub_build);
        options.push((PreLoginOption::Version, version));

        options.push((
            PreLoginOption::Encryption,
            BytesMut::from(&[self.encryption as u8][..]),
        ));

        let mut instance = BytesMut::with_capacity(self.instance.len() + 1);
        instance.put_slice(self.instance.as_bytes());
        instance.put_u8(0);
        options.push((PreLoginOption::Instance, instance));

        if let Some(thread_id) = self.thread_id {
            let mut data = BytesMut::with_capacity(4);
            data.put_u32(thread_id);
            options.push((PreLoginOption::ThreadId, data));
        }

        options.push((PreLoginOption::Mars, BytesMut::from(&[u8::from(self.mars)][..])));

        if self.fed_auth_required {
            options.push((PreLoginOption::FedAuthRequired, BytesMut::from(&[0x01][..])));
        }

        let header_size = options.len() * 5 + 1;
        let data_size: usize = options.iter().map(|(_, data)| data.len()).sum();
        let mut buf = BytesMut::with_capacity(header_size + data_size);

        let mut offset = header_size;
        for (option, data) in &options {
            buf.put_u8(*option as u8);
            buf.put_u16(offset as u16);
            buf.put_u16(data.len() as u16);
            offset += data.len();
        }
        buf.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in options {
            buf.put_slice(&data);
        }

        buf.freeze()
    }

    /// Decode a pre-login message.
    ///
    /// FEDAUTHREQUIRED must be 0 or 1. An INSTOPT value of 1 is reported
    /// through [`PreLogin::instance_mismatch`].
    pub fn decode(mut src: impl Buf) -> Result<Self> {
        let total = src.remaining();
        let mut headers = Vec::new();
        loop {
            ensure_remaining(&src, 1)?;
            let option_type = src.get_u8();
            if option_type == PreLoginOption::Terminator as u8 {
                break;
            }
            ensure_remaining(&src, 4)?;
            let offset = src.get_u16() as usize;
            let length = src.get_u16() as usize;
            match PreLoginOption::from_u8(option_type) {
                Ok(option) => headers.push((option, offset, length)),
                Err(_) => {
                    tracing::debug!(option_type, length, "skipping unknown pre-login option");
                }
            }
        }

        let header_size = total - src.remaining();
        let data = src.copy_to_bytes(src.remaining());

        let mut prelogin = Self::new();
        for (option, offset, length) in headers {
            let start = offset
                .checked_sub(header_size)
                .ok_or(ProtocolError::InvalidPreloginOption(option as u8))?;
            if start + length > data.len() {
                return Err(ProtocolError::IncompletePacket {
                    expected: start + length,
                    actual: data.len(),
                });
            }
            let value = &data[start..start + length];

            match option {
                PreLoginOption::Version if length >= 4 => {
                    prelogin.version = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                    if length >= 6 {
                        prelogin.sub_build = u16::from_le_bytes([value[4], value[5]]);
                    }
                }
                PreLoginOption::Encryption if length >= 1 => {
                    prelogin.encryption = EncryptionLevel::from_u8(value[0])?;
                }
                PreLoginOption::Instance if length >= 1 => {
                    if length == 1 && value[0] == 0x01 {
                        prelogin.instance_mismatch = true;
                    } else {
                        let name_end = value.iter().position(|&b| b == 0).unwrap_or(length);
                        prelogin.instance = String::from_utf8_lossy(&value[..name_end]).into_owned();
                    }
                }
                PreLoginOption::ThreadId if length >= 4 => {
                    prelogin.thread_id =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                PreLoginOption::Mars if length >= 1 => {
                    prelogin.mars = value[0] != 0;
                }
                PreLoginOption::FedAuthRequired if length >= 1 => {
                    prelogin.fed_auth_required = match value[0] {
                        0 => false,
                        1 => true,
                        other => {
                            return Err(ProtocolError::InvalidPreloginValue {
                                option: "FEDAUTHREQUIRED",
                                value: other,
                            });
                        }
                    };
                }
                PreLoginOption::Nonce if length >= 32 => {
                    let mut nonce = [0u8; 32];
                    nonce.copy_from_slice(&value[..32]);
                    prelogin.nonce = Some(nonce);
                }
                _ => {}
            }
        }

        Ok(prelogin)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_request_layout() {
        let encoded = PreLogin::new()
            .with_version(0x0100_0000, 0)
            .with_encryption(EncryptionLevel::On)
            .encode();

        // VERSION, ENCRYPTION, INSTOPT, MARS headers then terminator.
        assert_eq!(encoded[0], PreLoginOption::Version as u8);
        assert_eq!(&encoded[1..5], &[0x00, 21, 0x00, 6]);
        assert_eq!(encoded[5], PreLoginOption::Encryption as u8);
        assert_eq!(encoded[10], PreLoginOption::Instance as u8);
        assert_eq!(&encoded[13..15], &[0x00, 1]);
        assert_eq!(encoded[15], PreLoginOption::Mars as u8);
        assert_eq!(encoded[20], PreLoginOption::Terminator as u8);
        // ENCRYPTION value follows the 6 version bytes.
        assert_eq!(encoded[27], EncryptionLevel::On as u8);
        // Empty instance name is a single NUL.
        assert_eq!(encoded[28], 0);
        assert_eq!(encoded.len(), 30);
    }

    #[test]
    fn test_decode_reads_from_offsets() {
        use bytes::BufMut;

        let mut buf = BytesMut::new();
        let header_size: u16 = 11;
        buf.put_u8(PreLoginOption::Encryption as u8);
        buf.put_u16(header_size);
        buf.put_u16(1);
        buf.put_u8(PreLoginOption::Version as u8);
        buf.put_u16(header_size + 1);
        buf.put_u16(6);
        buf.put_u8(PreLoginOption::Terminator as u8);
        buf.put_u8(0x03);
        buf.put_slice(&[0x10, 0x00, 0x11, 0x94]);
        buf.put_u16_le(0x0002);

        let decoded = PreLogin::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.encryption, EncryptionLevel::Required);
        assert_eq!(decoded.version, 0x1000_1194);
        assert_eq!(decoded.sub_build, 2);
    }

    #[test]
    fn test_decode_skips_unknown_options() {
        use bytes::BufMut;

        let mut buf = BytesMut::new();
        let header_size: u16 = 11;
        buf.put_u8(PreLoginOption::Encryption as u8);
        buf.put_u16(header_size);
        buf.put_u16(1);
        buf.put_u8(0x08);
        buf.put_u16(header_size + 1);
        buf.put_u16(1);
        buf.put_u8(PreLoginOption::Terminator as u8);
        buf.put_u8(EncryptionLevel::On as u8);
        buf.put_u8(0xAB);

        let decoded = PreLogin::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.encryption, EncryptionLevel::On);
    }

    #[test]
    fn test_decode_rejects_bad_fed_auth_flag() {
        let mut response = PreLogin::new().with_fed_auth_required(true).encode().to_vec();
        let last = response.len() - 1;
        response[last] = 0x02;
        assert_eq!(
            PreLogin::decode(&response[..]),
            Err(ProtocolError::InvalidPreloginValue {
                option: "FEDAUTHREQUIRED",
                value: 0x02
            })
        );
    }

    #[test]
    fn test_decode_instance_mismatch() {
        let mut response = PreLogin::new().encode().to_vec();
        // INSTOPT data is the byte just before the MARS value.
        let instance_at = response.len() - 2;
        response[instance_at] = 0x01;
        let decoded = PreLogin::decode(&response[..]).unwrap();
        assert!(decoded.instance_mismatch);
    }

    #[test]
    fn test_decode_truncated() {
        let response = PreLogin::new().encode();
        let err = PreLogin::decode(&response[..response.len() - 1]).unwrap_err();
        assert!(err.is_incomplete());
    }
}
