//! Document Identifier Abstraction
//!
//! A document id is either a MongoDB ObjectId (24-character hex) or a
//! relational UUID, behind one tagged type so repositories never branch on
//! the active backend. The zero identifier carries neither payload and
//! serializes as JSON `null` to stay distinguishable from an empty string.

use crate::config::BackendKind;
use crate::error::{Result, StoreError};
use mongodb::bson::oid::ObjectId;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Backend-portable document identifier
///
/// Equality requires equal tags and equal underlying values; a freshly
/// defaulted id is the zero id. Identifiers are created on insert (either
/// generated by this layer or accepted from the caller) and never mutated.
///
/// # Examples
///
/// ```
/// use dualstore::{BackendKind, DocumentId};
///
/// let id = DocumentId::new(BackendKind::Postgres);
/// let parsed = DocumentId::parse(&id.to_string(), None).unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DocumentId {
    /// The zero identifier; renders as an empty string and JSON null
    #[default]
    Zero,
    /// Native document-store identifier
    ObjectId(ObjectId),
    /// Relational identifier
    Uuid(Uuid),
}

impl DocumentId {
    /// Generate a fresh identifier for the given backend.
    pub fn new(backend: BackendKind) -> Self {
        match backend {
            BackendKind::Mongo => Self::ObjectId(ObjectId::new()),
            BackendKind::Postgres => Self::Uuid(Uuid::new_v4()),
        }
    }

    /// Parse an identifier from its canonical text form.
    ///
    /// With a known backend the text must match that backend's shape. With
    /// `None`, UUID parsing is attempted first, then the 24-hex ObjectId
    /// form; anything else is an [`StoreError::InvalidId`].
    pub fn parse(text: &str, backend: Option<BackendKind>) -> Result<Self> {
        match backend {
            Some(BackendKind::Mongo) => ObjectId::parse_str(text)
                .map(Self::ObjectId)
                .map_err(|_| StoreError::InvalidId(text.to_string())),
            Some(BackendKind::Postgres) => Uuid::parse_str(text)
                .map(Self::Uuid)
                .map_err(|_| StoreError::InvalidId(text.to_string())),
            None => {
                if let Ok(uuid) = Uuid::parse_str(text) {
                    return Ok(Self::Uuid(uuid));
                }
                if let Ok(oid) = ObjectId::parse_str(text) {
                    return Ok(Self::ObjectId(oid));
                }
                Err(StoreError::InvalidId(text.to_string()))
            }
        }
    }

    /// True for the zero identifier.
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Zero)
    }

    /// Raw identifier bytes: 12 for an ObjectId, 16 for a UUID, empty for zero.
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            Self::Zero => Vec::new(),
            Self::ObjectId(oid) => oid.bytes().to_vec(),
            Self::Uuid(uuid) => uuid.as_bytes().to_vec(),
        }
    }

    /// The backend this identifier belongs to, if non-zero.
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            Self::Zero => None,
            Self::ObjectId(_) => Some(BackendKind::Mongo),
            Self::Uuid(_) => Some(BackendKind::Postgres),
        }
    }
}

impl From<ObjectId> for DocumentId {
    fn from(oid: ObjectId) -> Self {
        Self::ObjectId(oid)
    }
}

impl From<Uuid> for DocumentId {
    fn from(uuid: Uuid) -> Self {
        Self::Uuid(uuid)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zero => Ok(()),
            Self::ObjectId(oid) => write!(f, "{}", oid.to_hex()),
            Self::Uuid(uuid) => write!(f, "{}", uuid),
        }
    }
}

impl Serialize for DocumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Zero => serializer.serialize_none(),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text.as_deref() {
            None | Some("") => Ok(Self::Zero),
            Some(s) => Self::parse(s, None).map_err(|e| D::Error::custom(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_both_backends() {
        for backend in [BackendKind::Mongo, BackendKind::Postgres] {
            let id = DocumentId::new(backend);
            let parsed = DocumentId::parse(&id.to_string(), None).unwrap();
            assert_eq!(id, parsed);
            assert_eq!(id.backend(), Some(backend));
        }
    }

    #[test]
    fn zero_id_is_empty_and_zero() {
        let id = DocumentId::default();
        assert!(id.is_zero());
        assert_eq!(id.to_string(), "");
        assert!(id.bytes().is_empty());
    }

    #[test]
    fn parse_infers_shape_when_backend_unknown() {
        let oid = DocumentId::parse("507f1f77bcf86cd799439011", None).unwrap();
        assert!(matches!(oid, DocumentId::ObjectId(_)));

        let uuid = DocumentId::parse("550e8400-e29b-41d4-a716-446655440000", None).unwrap();
        assert!(matches!(uuid, DocumentId::Uuid(_)));

        assert!(matches!(
            DocumentId::parse("not-an-id", None),
            Err(StoreError::InvalidId(_))
        ));
    }

    #[test]
    fn parse_enforces_backend_shape_when_known() {
        // A UUID is not a valid document-store id and vice versa.
        assert!(DocumentId::parse(
            "550e8400-e29b-41d4-a716-446655440000",
            Some(BackendKind::Mongo)
        )
        .is_err());
        assert!(
            DocumentId::parse("507f1f77bcf86cd799439011", Some(BackendKind::Postgres)).is_err()
        );
    }

    #[test]
    fn zero_serializes_as_null() {
        assert_eq!(serde_json::to_string(&DocumentId::Zero).unwrap(), "null");

        let id = DocumentId::new(BackendKind::Mongo);
        let text = serde_json::to_string(&id).unwrap();
        let back: DocumentId = serde_json::from_str(&text).unwrap();
        assert_eq!(id, back);

        let zero: DocumentId = serde_json::from_str("null").unwrap();
        assert!(zero.is_zero());
    }

    #[test]
    fn bytes_have_backend_specific_width() {
        assert_eq!(DocumentId::new(BackendKind::Mongo).bytes().len(), 12);
        assert_eq!(DocumentId::new(BackendKind::Postgres).bytes().len(), 16);
    }

    #[test]
    fn equality_requires_matching_tag() {
        let oid = ObjectId::new();
        let a = DocumentId::from(oid);
        let b = DocumentId::from(oid);
        assert_eq!(a, b);
        assert_ne!(a, DocumentId::new(BackendKind::Postgres));
        assert_ne!(a, DocumentId::Zero);
    }
}
