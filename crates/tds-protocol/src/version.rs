//! TDS protocol and driver version definitions.

use core::fmt;

/// TDS protocol version as carried in LOGIN7 and LOGINACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.1 (SQL Server 2000)
    pub const V7_1: Self = Self(0x7100_0000);

    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x7209_0002);

    /// TDS 7.3A (SQL Server 2008)
    pub const V7_3A: Self = Self(0x730A_0003);

    /// TDS 7.3B (SQL Server 2008 R2)
    pub const V7_3B: Self = Self(0x730B_0003);

    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x7400_0004);

    /// TDS 8.0 (strict encryption)
    pub const V8_0: Self = Self(0x0800_0000);

    /// Create a version from its raw value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Get the raw version value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if this is TDS 8.0.
    #[must_use]
    pub const fn is_tds_8(self) -> bool {
        self.0 == Self::V8_0.0
    }

    /// Check if this version supports DATE, TIME, DATETIME2, and DATETIMEOFFSET.
    #[must_use]
    pub const fn supports_date_time_types(self) -> bool {
        // TDS 8.0's raw value is numerically lower than every 7.x value
        self.is_tds_8() || self.0 >= Self::V7_3A.0
    }

    /// Check if this version can negotiate feature extensions.
    #[must_use]
    pub const fn supports_feature_extensions(self) -> bool {
        self.is_tds_8() || self.0 >= Self::V7_4.0
    }

    /// Get the major version number.
    #[must_use]
    pub const fn major(self) -> u8 {
        if self.is_tds_8() { 8 } else { 7 }
    }

    /// Get the minor version number.
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
            0x730A_0003 => write!(f, "TDS 7.3A"),
            0x730B_0003 => write!(f, "TDS 7.3B"),
            _ => write!(f, "TDS {}.{}", self.major(), self.minor()),
        }
    }
}

impl From<u32> for TdsVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Version of this driver as announced in PRELOGIN and LOGIN7.
///
/// Packed as `(major << 24) | (minor << 16) | patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Patch level.
    pub patch: u16,
}

impl DriverVersion {
    /// Version of the running crate.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(env!("CARGO_PKG_VERSION")).unwrap_or(Self {
            major: 0,
            minor: 0,
            patch: 0,
        })
    }

    /// Parse `major.minor.patch`, with an optional leading `v`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('v');
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts
            .next()?
            .split(|c: char| !c.is_ascii_digit())
            .next()?
            .parse()
            .ok()?;
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// Packed 32-bit representation.
    #[must_use]
    pub const fn packed(self) -> u32 {
        ((self.major as u32) << 24) | ((self.minor as u32) << 16) | self.patch as u32
    }

    /// Six-byte PRELOGIN VERSION payload: packed little-endian, zero sub-build.
    #[must_use]
    pub fn prelogin_bytes(self) -> [u8; 6] {
        let [a, b, c, d] = self.packed().to_le_bytes();
        [a, b, c, d, 0, 0]
    }
}

/// SQL Server product version reported in the server's PRELOGIN response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SqlServerVersion {
    /// Major version (e.g. 16 for SQL Server 2022).
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
    /// Sub-build number.
    pub sub_build: u16,
}

impl SqlServerVersion {
    /// Decode from the six-byte VERSION payload (big-endian build, little-endian sub-build).
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let head: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        let sub_build = bytes
            .get(4..6)
            .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]));
        Some(Self {
            major: head[0],
            minor: head[1],
            build: u16::from_be_bytes([head[2], head[3]]),
            sub_build,
        })
    }

    /// Encode as the six-byte VERSION payload.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 6] {
        let [b0, b1] = self.build.to_be_bytes();
        let [s0, s1] = self.sub_build.to_le_bytes();
        [self.major, self.minor, b0, b1, s0, s1]
    }
}

impl fmt::Display for SqlServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}
