use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{FullVersion, MajorVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Php,
    Node,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 2] = [RuntimeKind::Php, RuntimeKind::Node];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Php => "php",
            Self::Node => "node",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "php" => Some(Self::Php),
            "node" | "nodejs" => Some(Self::Node),
            _ => None,
        }
    }

    /// Arguments that make the runtime print its version and exit.
    #[must_use]
    pub fn version_args(self) -> &'static [&'static str] {
        match self {
            Self::Php => &["-v"],
            Self::Node => &["--version"],
        }
    }

    /// Kinds that must always have at least one installed version.
    #[must_use]
    pub fn requires_installation(self) -> bool {
        matches!(self, Self::Php)
    }

    #[must_use]
    pub fn config_files(self) -> &'static [&'static str] {
        match self {
            Self::Php => &["php.ini", "php-fpm.conf"],
            Self::Node => &["npmrc"],
        }
    }

    #[must_use]
    pub fn wrapper_names(self) -> &'static [&'static str] {
        match self {
            Self::Php => &["php"],
            Self::Node => &["node"],
        }
    }

    #[must_use]
    pub fn binary_name(self, major: &MajorVersion) -> String {
        format!("{}{}", self.as_str(), major.name_digits())
    }

    #[must_use]
    pub fn default_link_name(self) -> String {
        format!("{}.default", self.as_str())
    }

    /// Whether `major` has the shape this kind uses for its family keys.
    #[must_use]
    pub fn accepts(self, major: &MajorVersion) -> bool {
        match self {
            Self::Php => major.minor.is_some(),
            Self::Node => major.minor.is_none(),
        }
    }

    /// Family key a concrete release belongs to.
    #[must_use]
    pub fn major_of(self, version: &FullVersion) -> MajorVersion {
        match self {
            Self::Php => MajorVersion::new(version.major, Some(version.minor)),
            Self::Node => MajorVersion::new(version.major, None),
        }
    }

    /// Inverse of [`MajorVersion::name_digits`] for this kind.
    ///
    /// PHP names carry a single-digit major followed by the minor (`83`).
    #[must_use]
    pub fn parse_name_digits(self, digits: &str) -> Option<MajorVersion> {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        match self {
            Self::Php => {
                if digits.len() < 2 {
                    return None;
                }
                let (major, minor) = digits.split_at(1);
                Some(MajorVersion::new(major.parse().ok()?, Some(minor.parse().ok()?)))
            }
            Self::Node => Some(MajorVersion::new(digits.parse().ok()?, None)),
        }
    }

    /// Map a binary file name such as `php83` back to its family key.
    #[must_use]
    pub fn parse_binary_name(self, name: &str) -> Option<MajorVersion> {
        let major = self.parse_name_digits(name.strip_prefix(self.as_str())?)?;
        (self.binary_name(&major) == name).then_some(major)
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown runtime kind: {s}"))
    }
}
