//! Feature extension identifiers.
//!
//! The client requests features in the LOGIN7 FeatureExt block and the
//! server acknowledges them in a FEATUREEXTACK token. Both use
//! `id(1) | length(4, LE) | data` entries closed by a 0xFF terminator.

use bytes::{BufMut, Bytes};

use crate::error::{ProtocolError, Result};

/// Highest data classification version this crate decodes.
pub const DATA_CLASSIFICATION_VERSION_MAX: u8 = 2;

/// Feature extension identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FeatureId {
    /// Session recovery (connection resiliency).
    SessionRecovery = 0x01,
    /// Federated authentication.
    FedAuth = 0x02,
    /// Column encryption (Always Encrypted).
    ColumnEncryption = 0x04,
    /// Global transactions.
    GlobalTransactions = 0x05,
    /// Azure SQL support.
    AzureSqlSupport = 0x08,
    /// Data classification.
    DataClassification = 0x09,
    /// UTF-8 collation support.
    Utf8Support = 0x0A,
    /// Azure SQL DNS caching.
    SqlDnsCaching = 0x0B,
    /// Terminator.
    Terminator = 0xFF,
}

impl FeatureId {
    /// Create from raw byte value.
    ///
    /// Unknown ids are an error: a FEATUREEXTACK entry that cannot be
    /// identified means the stream is no longer trustworthy.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::SessionRecovery),
            0x02 => Ok(Self::FedAuth),
            0x04 => Ok(Self::ColumnEncryption),
            0x05 => Ok(Self::GlobalTransactions),
            0x08 => Ok(Self::AzureSqlSupport),
            0x09 => Ok(Self::DataClassification),
            0x0A => Ok(Self::Utf8Support),
            0x0B => Ok(Self::SqlDnsCaching),
            0xFF => Ok(Self::Terminator),
            _ => Err(ProtocolError::UnknownFeatureId(value)),
        }
    }
}

/// A feature requested in LOGIN7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureRequest {
    /// Feature ID.
    pub id: FeatureId,
    /// Feature data.
    pub data: Bytes,
}

impl FeatureRequest {
    /// Request a feature that carries no data.
    #[must_use]
    pub fn flag(id: FeatureId) -> Self {
        Self {
            id,
            data: Bytes::new(),
        }
    }

    /// Request a feature by its highest supported version.
    #[must_use]
    pub fn versioned(id: FeatureId, max_version: u8) -> Self {
        Self {
            id,
            data: Bytes::copy_from_slice(&[max_version]),
        }
    }

    /// Encoded size including id and length.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        5 + self.data.len()
    }

    /// Encode the entry.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.id as u8);
        dst.put_u32_le(self.data.len() as u32);
        dst.put_slice(&self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_unknown_feature_id_is_error() {
        assert_eq!(FeatureId::from_u8(0x03), Err(ProtocolError::UnknownFeatureId(0x03)));
        assert_eq!(FeatureId::from_u8(0xFF), Ok(FeatureId::Terminator));
    }

    #[test]
    fn test_versioned_request_layout() {
        let mut buf = BytesMut::new();
        let request = FeatureRequest::versioned(
            FeatureId::DataClassification,
            DATA_CLASSIFICATION_VERSION_MAX,
        );
        request.encode(&mut buf);
        assert_eq!(&buf[..], &[0x09, 1, 0, 0, 0, 2]);
        assert_eq!(request.encoded_len(), buf.len());
    }
}
