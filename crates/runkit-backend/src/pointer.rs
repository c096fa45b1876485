use std::fmt;

use thiserror::Error;

use crate::kind::RuntimeKind;
use crate::types::MajorVersion;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PointerParseError {
    #[error("pointer target '{target}' does not name a {kind} binary")]
    ForeignTarget { kind: RuntimeKind, target: String },
    #[error("pointer target '{target}' is not canonical (expected '{expected}')")]
    NotCanonical { target: String, expected: String },
}

/// The `{kind}.default` indirection, resolved to the major it points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DefaultPointer {
    pub kind: RuntimeKind,
    pub major: MajorVersion,
}

impl DefaultPointer {
    #[must_use]
    pub fn new(kind: RuntimeKind, major: MajorVersion) -> Self {
        Self { kind, major }
    }

    /// Binary name the indirection resolves to.
    #[must_use]
    pub fn format(&self) -> String {
        self.kind.binary_name(&self.major)
    }

    /// Parse a link target (file name or path) back into a pointer.
    ///
    /// Only targets that format back to the exact same name are accepted.
    pub fn parse(kind: RuntimeKind, target: &str) -> Result<Self, PointerParseError> {
        let name = target
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(target)
            .trim();

        let major = name
            .strip_prefix(kind.as_str())
            .and_then(|digits| kind.parse_name_digits(digits))
            .ok_or_else(|| PointerParseError::ForeignTarget {
                kind,
                target: target.to_string(),
            })?;

        let pointer = Self::new(kind, major);
        let expected = pointer.format();
        if expected != name {
            return Err(PointerParseError::NotCanonical {
                target: target.to_string(),
                expected,
            });
        }

        Ok(pointer)
    }
}

impl fmt::Display for DefaultPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.kind.default_link_name(), self.format())
    }
}
