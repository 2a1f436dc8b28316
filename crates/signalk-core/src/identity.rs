//! Self vessel identity.
//!
//! The server represents one vessel. Its identity comes from the MMSI or
//! UUID in the defaults document; MMSI wins when both exist. With neither,
//! a fresh UUID is generated and announced through a root `{uuid}` delta.

use serde_json::Value;

use crate::model::{Delta, PathValue, Update};

const MMSI_PREFIX: &str = "urn:mrn:imo:mmsi:";
const UUID_PREFIX: &str = "urn:mrn:signalk:uuid:";

/// Errors that make the configured identity unusable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid mmsi: {0}")]
    InvalidMmsi(String),

    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

/// How the self vessel is identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Mmsi,
    Uuid,
}

/// The identity of the vessel this server represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdentity {
    kind: IdentityKind,
    /// Full URN, e.g. "urn:mrn:imo:mmsi:230099999".
    id: String,
}

impl SelfIdentity {
    pub fn mmsi(mmsi: &str) -> Result<Self, IdentityError> {
        let bare = mmsi.strip_prefix(MMSI_PREFIX).unwrap_or(mmsi);
        if bare.is_empty() {
            return Err(IdentityError::InvalidMmsi(mmsi.to_string()));
        }
        Ok(Self {
            kind: IdentityKind::Mmsi,
            id: format!("{MMSI_PREFIX}{bare}"),
        })
    }

    pub fn uuid(uuid: &str) -> Result<Self, IdentityError> {
        let bare = uuid.strip_prefix(UUID_PREFIX).unwrap_or(uuid);
        if bare.is_empty() {
            return Err(IdentityError::InvalidUuid(uuid.to_string()));
        }
        Ok(Self {
            kind: IdentityKind::Uuid,
            id: format!("{UUID_PREFIX}{bare}"),
        })
    }

    /// A new random UUID identity.
    pub fn generate() -> Self {
        Self {
            kind: IdentityKind::Uuid,
            id: format!("{UUID_PREFIX}{}", uuid::Uuid::new_v4()),
        }
    }

    /// Identity from raw configuration values.
    ///
    /// Missing and null values are ignored; any other non-string value is
    /// an error. Returns `None` when neither value is set.
    pub fn from_values(
        mmsi: Option<&Value>,
        uuid: Option<&Value>,
    ) -> Result<Option<Self>, IdentityError> {
        let mmsi = match mmsi {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(other) => return Err(IdentityError::InvalidMmsi(other.to_string())),
        };
        let uuid = match uuid {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(other) => return Err(IdentityError::InvalidUuid(other.to_string())),
        };

        match (mmsi, uuid) {
            (Some(mmsi), _) => Self::mmsi(mmsi).map(Some),
            (None, Some(uuid)) => Self::uuid(uuid).map(Some),
            (None, None) => Ok(None),
        }
    }

    /// Identity from the `vessels.self` section of a defaults document.
    pub fn from_defaults(defaults: &Value) -> Result<Option<Self>, IdentityError> {
        let own = defaults.get("vessels").and_then(|v| v.get("self"));
        Self::from_values(
            own.and_then(|v| v.get("mmsi")),
            own.and_then(|v| v.get("uuid")),
        )
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The self context, `vessels.<id>`.
    pub fn context(&self) -> String {
        format!("vessels.{}", self.id)
    }

    /// The root delta that announces a UUID identity.
    pub fn announcement(&self) -> Delta {
        let field = match self.kind {
            IdentityKind::Mmsi => "mmsi",
            IdentityKind::Uuid => "uuid",
        };
        let value = match self.kind {
            IdentityKind::Mmsi => self.id.trim_start_matches(MMSI_PREFIX).to_string(),
            IdentityKind::Uuid => self.id.clone(),
        };
        Delta::new(
            self.context(),
            vec![Update::from_values(vec![PathValue::new(
                "",
                serde_json::json!({ field: value }),
            )])],
        )
    }
}

/// Resolve the self identity from a defaults document.
///
/// Returns the identity and, when one had to be generated, the delta that
/// seeds its UUID into the snapshot.
pub fn resolve_self_identity(
    defaults: &Value,
) -> Result<(SelfIdentity, Option<Delta>), IdentityError> {
    match SelfIdentity::from_defaults(defaults)? {
        Some(identity) => Ok((identity, None)),
        None => {
            let identity = SelfIdentity::generate();
            let announcement = identity.announcement();
            Ok((identity, Some(announcement)))
        }
    }
}
