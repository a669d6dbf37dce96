//! Resource identity and counter types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{define_counter, KeyError};

// =============================================================================
// Counters
// =============================================================================

define_counter!(Generation, "generation");
define_counter!(ResourceVersion, "resource version");

// =============================================================================
// Kinds
// =============================================================================

/// The kind of a managed resource.
///
/// Well-known kinds get their own variant so per-kind behavior can be matched
/// exhaustively; anything else is carried as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Deployment,
    Service,
    ConfigMap,
    Custom(String),
}

impl ResourceKind {
    /// Returns the canonical name of the kind.
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Custom(name) => name,
        }
    }

    /// Parses a kind name. Unknown names become `Custom`.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        validate_segment("kind", s)?;
        Ok(match s {
            "Deployment" => ResourceKind::Deployment,
            "Service" => ResourceKind::Service,
            "ConfigMap" => ResourceKind::ConfigMap,
            other => ResourceKind::Custom(other.to_string()),
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ResourceKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Unique identity of a managed resource: `(kind, namespace, name)`.
///
/// Keys order by kind, then namespace, then name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    /// Builds a key, validating the namespace and name segments.
    pub fn new(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_segment("namespace", &namespace)?;
        validate_segment("name", &name)?;
        Ok(Self {
            kind,
            namespace,
            name,
        })
    }

    /// Parses a key from its canonical `kind/namespace/name` form.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }

        let segments: Vec<&str> = s.split('/').collect();
        let [kind, namespace, name] = segments.as_slice() else {
            return Err(KeyError::WrongSegmentCount {
                segments: segments.len(),
            });
        };

        Self::new(ResourceKind::parse(kind)?, *namespace, *name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ResourceKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            kind: ResourceKind,
            namespace: String,
            name: String,
        }

        let raw = Raw::deserialize(deserializer)?;
        ResourceKey::new(raw.kind, raw.namespace, raw.name).map_err(serde::de::Error::custom)
    }
}

fn validate_segment(segment: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::EmptySegment { segment });
    }

    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')))
    {
        return Err(KeyError::InvalidCharacter { segment, ch });
    }

    Ok(())
}
