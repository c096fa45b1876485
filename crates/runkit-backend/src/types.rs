use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A concrete runtime release, for example `8.3.12` or `22.11.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FullVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FullVersion {
    #[must_use]
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Ord for FullVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
    }
}

impl PartialOrd for FullVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FullVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionComponent {
    Major,
    Minor,
    Patch,
}

impl fmt::Display for VersionComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Major => write!(f, "major"),
            Self::Minor => write!(f, "minor"),
            Self::Patch => write!(f, "patch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    #[error("Expected X.Y.Z format, got: {input}")]
    InvalidFormat { input: String },
    #[error("Invalid {component} version: {value}")]
    InvalidComponent {
        component: VersionComponent,
        value: String,
    },
}

fn parse_component(component: VersionComponent, value: &str) -> Result<u32, VersionParseError> {
    value
        .parse()
        .map_err(|_| VersionParseError::InvalidComponent {
            component,
            value: value.to_string(),
        })
}

impl FromStr for FullVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().strip_prefix('v').unwrap_or(s.trim());
        let invalid = || VersionParseError::InvalidFormat {
            input: s.to_string(),
        };

        let mut parts = s.split('.');
        let major_str = parts.next().ok_or_else(invalid)?;
        let minor_str = parts.next().ok_or_else(invalid)?;
        let patch_str = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(FullVersion::new(
            parse_component(VersionComponent::Major, major_str)?,
            parse_component(VersionComponent::Minor, minor_str)?,
            parse_component(VersionComponent::Patch, patch_str)?,
        ))
    }
}

impl TryFrom<String> for FullVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FullVersion> for String {
    fn from(value: FullVersion) -> Self {
        value.to_string()
    }
}

/// Version family key used for binary naming and lookup.
///
/// PHP families carry a minor component (`8.3`), Node families do not (`22`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MajorVersion {
    pub major: u32,
    pub minor: Option<u32>,
}

impl MajorVersion {
    #[must_use]
    pub fn new(major: u32, minor: Option<u32>) -> Self {
        Self { major, minor }
    }

    /// Digits used in binary names: `8.3` becomes `83`, `22` stays `22`.
    #[must_use]
    pub fn name_digits(&self) -> String {
        match self.minor {
            Some(minor) => format!("{}{minor}", self.major),
            None => self.major.to_string(),
        }
    }

    #[must_use]
    pub fn contains(&self, version: &FullVersion) -> bool {
        self.major == version.major && self.minor.is_none_or(|minor| minor == version.minor)
    }
}

impl fmt::Display for MajorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}.{minor}", self.major),
            None => write!(f, "{}", self.major),
        }
    }
}

impl FromStr for MajorVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().strip_prefix('v').unwrap_or(s.trim());
        let mut parts = s.split('.');
        let major_str = parts
            .next()
            .filter(|part| !part.is_empty())
            .ok_or_else(|| VersionParseError::InvalidFormat {
                input: s.to_string(),
            })?;
        let minor = parts
            .next()
            .map(|part| parse_component(VersionComponent::Minor, part))
            .transpose()?;
        if parts.next().is_some() {
            return Err(VersionParseError::InvalidFormat {
                input: s.to_string(),
            });
        }

        Ok(MajorVersion::new(
            parse_component(VersionComponent::Major, major_str)?,
            minor,
        ))
    }
}

impl TryFrom<String> for MajorVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MajorVersion> for String {
    fn from(value: MajorVersion) -> Self {
        value.to_string()
    }
}

/// Where and how to fetch a runtime archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDescriptor {
    pub url: String,
    /// Leading path components dropped during extraction.
    #[serde(default)]
    pub strip_components: usize,
    /// Path of the runtime binary inside the archive, after stripping.
    pub binary_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadataEntry {
    pub latest_version: FullVersion,
    pub download: DownloadDescriptor,
    pub checksum: String,
    pub is_lts: bool,
    pub is_eol: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
}

impl DownloadProgress {
    /// Completed fraction in `[0.0, 1.0]`; zero when the total is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64).clamp(0.0, 1.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Install,
    Update,
    Remove,
    SetDefault,
    Reconcile,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Update => write!(f, "update"),
            Self::Remove => write!(f, "remove"),
            Self::SetDefault => write!(f, "set default"),
            Self::Reconcile => write!(f, "reconcile"),
        }
    }
}
