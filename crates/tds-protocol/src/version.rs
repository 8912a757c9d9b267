//! TDS protocol version definitions.

use core::fmt;

/// TDS protocol version.
///
/// The raw value is the one carried big-endian in the LOGINACK token.
/// TDS 8.0 uses a different encoding (0x08000000) that is numerically
/// lower than every 7.x version, so feature checks below never compare
/// raw values across that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.0 (SQL Server 7.0)
    pub const V7_0: Self = Self(0x70000000);

    /// TDS 7.1 (SQL Server 2000)
    pub const V7_1: Self = Self(0x71000000);

    /// TDS 7.1 Revision 1 (SQL Server 2000 SP1)
    pub const V7_1_REV1: Self = Self(0x71000001);

    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x72090002);

    /// TDS 7.3A (SQL Server 2008)
    pub const V7_3A: Self = Self(0x730A0003);

    /// TDS 7.3B (SQL Server 2008 R2)
    pub const V7_3B: Self = Self(0x730B0003);

    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x74000004);

    /// TDS 8.0 (TLS-first, SQL Server 2022+)
    pub const V8_0: Self = Self(0x08000000);

    /// Create a version from its raw value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Raw version value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this is TDS 8.0.
    #[must_use]
    pub const fn is_tds_8(self) -> bool {
        self.0 == Self::V8_0.0
    }

    /// Whether this version is at least TDS 7.2.
    ///
    /// From 7.2 on, ERROR/INFO line numbers are 32-bit and DONE row
    /// counts are 64-bit.
    #[must_use]
    pub const fn is_at_least_7_2(self) -> bool {
        self.is_tds_8() || self.0 >= Self::V7_2.0
    }

    /// Major version number.
    #[must_use]
    pub const fn major(self) -> u8 {
        if self.is_tds_8() {
            8
        } else {
            ((self.0 >> 28) & 0x0F) as u8
        }
    }

    /// Minor version number.
    #[must_use]
    pub const fn minor(self) -> u8 {
        if self.is_tds_8() {
            0
        } else {
            ((self.0 >> 24) & 0x0F) as u8
        }
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0x730A0003 => write!(f, "TDS 7.3A"),
            0x730B0003 => write!(f, "TDS 7.3B"),
            _ => write!(f, "TDS {}.{}", self.major(), self.minor()),
        }
    }
}

impl From<u32> for TdsVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<TdsVersion> for u32 {
    fn from(version: TdsVersion) -> Self {
        version.0
    }
}
