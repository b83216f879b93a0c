//! Event types known to every Meridian service

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventPayload;
use crate::schema::{FieldKind, Schema};

/// Known event type tags. Tags from newer producers parse as [`EventType::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    UserCreated,
    UserUpdated,
    UserDeleted,
    Ping,
    Unknown(String),
}

impl EventType {
    pub const KNOWN: [EventType; 4] = [
        EventType::UserCreated,
        EventType::UserUpdated,
        EventType::UserDeleted,
        EventType::Ping,
    ];

    pub fn parse(tag: &str) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|known| known.as_str() == tag)
            .unwrap_or_else(|| Self::Unknown(tag.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::UserCreated => UserCreated::EVENT_TYPE,
            Self::UserUpdated => UserUpdated::EVENT_TYPE,
            Self::UserDeleted => UserDeleted::EVENT_TYPE,
            Self::Ping => Ping::EVENT_TYPE,
            Self::Unknown(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    /// Schema and schema version of a known type.
    pub fn schema(&self) -> Option<(Schema, &'static str)> {
        match self {
            Self::UserCreated => Some((UserCreated::schema(), UserCreated::SCHEMA_VERSION)),
            Self::UserUpdated => Some((UserUpdated::schema(), UserUpdated::SCHEMA_VERSION)),
            Self::UserDeleted => Some((UserDeleted::schema(), UserDeleted::SCHEMA_VERSION)),
            Self::Ping => Some((Ping::schema(), Ping::SCHEMA_VERSION)),
            Self::Unknown(_) => None,
        }
    }
}

impl FromStr for EventType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        Self::parse(tag)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `USER_CREATED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreated {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl EventPayload for UserCreated {
    const EVENT_TYPE: &'static str = "USER_CREATED";

    fn schema() -> Schema {
        Schema::new()
            .required("userId", FieldKind::Uuid)
            .required("email", FieldKind::Email)
            .required("name", FieldKind::String)
            .optional("role", FieldKind::String)
    }
}

/// `USER_UPDATED`, carrying only the changed fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdated {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl EventPayload for UserUpdated {
    const EVENT_TYPE: &'static str = "USER_UPDATED";

    fn schema() -> Schema {
        Schema::new()
            .required("userId", FieldKind::Uuid)
            .optional("email", FieldKind::Email)
            .optional("name", FieldKind::String)
            .optional("role", FieldKind::String)
    }
}

/// `USER_DELETED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDeleted {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EventPayload for UserDeleted {
    const EVENT_TYPE: &'static str = "USER_DELETED";

    fn schema() -> Schema {
        Schema::new()
            .required("userId", FieldKind::Uuid)
            .optional("reason", FieldKind::String)
    }
}

/// `PING`, used for liveness checks across services
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EventPayload for Ping {
    const EVENT_TYPE: &'static str = "PING";

    fn schema() -> Schema {
        Schema::new().optional("message", FieldKind::String)
    }
}
