//! Entity identifiers: 22-character base64url-unpadded encodings of 128-bit
//! UUIDs, as required by spec.md §3 ("Identifiers").
//!
//! Both the legacy 36-character hyphenated UUID form and the compact form
//! are accepted on input; [`EntityId`] always emits the compact form.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// An opaque 128-bit identifier for a note, folder, instance, profile,
/// storage directory, tag, or comment.
///
/// Comparisons are always byte-wise; only filename parsing (see `log`,
/// `snapshot`, `activity`) interprets the string form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generate a new random identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The reserved sentinel ID used by a Storage Directory's folder tree
    /// document, which (per spec.md §3) has no separately-allocated UUID.
    pub fn folder_tree_sentinel() -> Self {
        Self(Uuid::nil())
    }

    /// Compact base64url-unpadded form: always 22 characters.
    pub fn to_compact(self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.as_bytes())
    }

    /// Raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.to_compact())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_compact())
    }
}

impl FromStr for EntityId {
    type Err = EngineError;

    /// Accepts both the 36-character hyphenated form and the 22-character
    /// compact base64url form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 36 && s.contains('-') {
            return Uuid::parse_str(s).map(Self).map_err(|e| EngineError::Validation {
                field: "id".to_string(),
                message: format!("invalid hyphenated UUID '{s}': {e}"),
            });
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| EngineError::Validation {
                field: "id".to_string(),
                message: format!("invalid compact id '{s}': {e}"),
            })?;
        let arr: [u8; 16] = bytes.as_slice().try_into().map_err(|_| EngineError::Validation {
            field: "id".to_string(),
            message: format!("compact id '{s}' did not decode to 16 bytes"),
        })?;
        Ok(Self(Uuid::from_bytes(arr)))
    }
}

impl Serialize for EntityId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_compact())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_round_trip() {
        let id = EntityId::new_random();
        let compact = id.to_compact();
        assert_eq!(compact.len(), 22);
        let parsed: EntityId = compact.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn accepts_legacy_hyphenated_form() {
        let hyphenated = "550e8400-e29b-41d4-a716-446655440000";
        let id: EntityId = hyphenated.parse().unwrap();
        // Always re-emitted in compact form.
        assert_eq!(id.to_compact().len(), 22);
        assert!(!id.to_compact().contains('-'));
    }

    #[test]
    fn folder_tree_sentinel_is_stable() {
        assert_eq!(
            EntityId::folder_tree_sentinel(),
            EntityId::folder_tree_sentinel()
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!("not an id".parse::<EntityId>().is_err());
    }
}
