//! Typed identifiers.
//!
//! Generated identifiers are prefixed ULIDs (`svc_01HV...`): the prefix keeps
//! different resource kinds from being mixed up, and the ULID keeps ids
//! time-ordered. Pool and host ids are operator- or fingerprint-supplied
//! strings and stay untyped.

use ulid::Ulid;

/// Errors from parsing a typed id.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("empty id")]
    Empty,

    #[error("id is missing the '_' prefix separator")]
    MissingSeparator,

    #[error("invalid id prefix: expected {expected}, got {actual}")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid ulid: {0}")]
    InvalidUlid(String),
}

macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// Typed id in the `{prefix}_{ulid}` format.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh id.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            pub fn parse(s: &str) -> Result<Self, IdError> {
                if s.is_empty() {
                    return Err(IdError::Empty);
                }
                let Some((prefix, ulid)) = s.split_once('_') else {
                    return Err(IdError::MissingSeparator);
                };
                if prefix != Self::PREFIX {
                    return Err(IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }
                let ulid = ulid
                    .parse::<Ulid>()
                    .map_err(|e| IdError::InvalidUlid(e.to_string()))?;
                Ok(Self(ulid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_id!(ServiceId, "svc");
define_id!(StateId, "ss");
define_id!(SnapshotId, "snap");
define_id!(ActionId, "act");
define_id!(AssignmentId, "addr");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let id = ServiceId::new();
        let parsed: ServiceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_prefix() {
        let id = StateId::new().to_string();
        assert!(matches!(
            ServiceId::parse(&id),
            Err(IdError::InvalidPrefix { .. })
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(ServiceId::parse(""), Err(IdError::Empty)));
        assert!(matches!(
            ServiceId::parse("svc01H"),
            Err(IdError::MissingSeparator)
        ));
        assert!(matches!(
            ServiceId::parse("svc_not-a-ulid"),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn serde_as_string() {
        let id = SnapshotId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: SnapshotId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
