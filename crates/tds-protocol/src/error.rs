//! Protocol-level error type.

use thiserror::Error;

/// Errors raised while decoding or encoding TDS wire structures.
///
/// Two error kinds mean "the buffer ended before the structure did":
/// [`ProtocolError::UnexpectedEof`] and [`ProtocolError::IncompletePacket`].
/// Callers that feed decoders from a network stream treat those as a request
/// for more bytes (see [`ProtocolError::is_incomplete`]); every other variant
/// is a malformed or desynchronized stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The buffer ended in the middle of a structure.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// A fixed or declared length is larger than what is buffered.
    #[error("incomplete data: expected {expected} bytes, have {actual}")]
    IncompletePacket {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown packet type byte.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Unknown packet status bits.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Packet header length smaller than the header itself.
    #[error("invalid packet length: {0}")]
    InvalidPacketLength(u16),

    /// Payload that does not fit in a single packet.
    #[error("payload of {0} bytes does not fit in one packet")]
    PayloadTooLarge(usize),

    /// Unknown token tag.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// Known token tag this engine does not decode.
    #[error("unsupported token type: 0x{0:02X}")]
    UnsupportedToken(u8),

    /// A length-prefixed token whose body did not match its declared length.
    #[error("token 0x{token:02X} declared {declared} bytes but its body consumed {consumed}")]
    TokenLengthMismatch {
        /// Token tag.
        token: u8,
        /// Declared body length.
        declared: usize,
        /// Bytes the decoder actually consumed.
        consumed: usize,
    },

    /// A length-prefixed token body ended before its fields did.
    #[error("token 0x{token:02X} body of {declared} bytes ended before its fields")]
    TruncatedToken {
        /// Token tag.
        token: u8,
        /// Declared body length.
        declared: usize,
    },

    /// Feature id in a FEATUREEXTACK token that is not recognized.
    #[error("unknown feature id in FEATUREEXTACK: 0x{0:02X}")]
    UnknownFeatureId(u8),

    /// An index inside a token points outside its collection.
    #[error("{kind} index {index} out of range (count {count})")]
    IndexOutOfRange {
        /// Which collection the index refers to.
        kind: &'static str,
        /// Index found on the wire.
        index: u16,
        /// Collection size.
        count: usize,
    },

    /// FEDAUTHINFO option points outside its buffer.
    #[error("invalid FEDAUTHINFO: {0}")]
    InvalidFedAuthInfo(&'static str),

    /// Unknown pre-login option tag.
    #[error("invalid pre-login option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// Pre-login option with an out-of-range value.
    #[error("invalid pre-login {option} value: 0x{value:02X}")]
    InvalidPreloginValue {
        /// Option name.
        option: &'static str,
        /// Offending value.
        value: u8,
    },

    /// UTF-16 payload that does not decode.
    #[error("invalid UTF-16 string")]
    InvalidUtf16,

    /// A string does not fit its length prefix.
    #[error("string of {len} characters exceeds the {max} character limit")]
    StringTooLong {
        /// Characters in the string.
        len: usize,
        /// Maximum the prefix can describe.
        max: usize,
    },
}

impl ProtocolError {
    /// Whether the error only means more bytes are needed.
    #[must_use]
    pub const fn is_incomplete(&self) -> bool {
        matches!(self, Self::UnexpectedEof | Self::IncompletePacket { .. })
    }
}

/// Result type for protocol operations.
pub type Result<T> = core::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_classification() {
        assert!(ProtocolError::UnexpectedEof.is_incomplete());
        assert!(
            ProtocolError::IncompletePacket {
                expected: 8,
                actual: 3
            }
            .is_incomplete()
        );
        assert!(!ProtocolError::UnknownFeatureId(0x42).is_incomplete());
        assert!(!ProtocolError::InvalidUtf16.is_incomplete());
    }
}
