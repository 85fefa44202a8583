use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod access;
pub mod assign;
pub mod links;

pub use access::{authenticate, authorize, can_access_event, Actor, Operation, Role};
pub use assign::{
    assign, assignment_overview, display_name, get_assignment_for, receiver_display_name, reveal,
    AssignmentView, DrawStrategy, RevealOutcome, UNKNOWN_NAME,
};
pub use links::{
    disable_link, ensure_links_for_event, find_token, generate_token, get_link_for,
    get_or_create_link, invite_url, refresh_link, TOKEN_PREFIX,
};

pub type UserId = String;
pub type EventId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    /// Shared secret compared verbatim on login.
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub password_changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub giver_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub revealed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessLink {
    pub token: String,
    pub user_id: UserId,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub title: String,
    pub created_by: UserId,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(default)]
    pub access_links: Vec<AccessLink>,
    #[serde(default)]
    pub is_started: bool,
    #[serde(default)]
    pub gift_value: Option<String>,
    /// Bumped by the store on every successful write; a stale revision is rejected.
    #[serde(default)]
    pub revision: u64,
}

impl Event {
    pub fn new(
        id: impl Into<EventId>,
        title: impl Into<String>,
        created_by: impl Into<UserId>,
        participant_ids: Vec<UserId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            created_by: created_by.into(),
            created_at,
            participant_ids,
            assignments: Vec::new(),
            access_links: Vec::new(),
            is_started: false,
            gift_value: None,
            revision: 0,
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|p| p == user_id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SantaError {
    #[error("at least two participants required, got {0}")]
    NotEnoughParticipants(usize),
    #[error("participant listed more than once: {0}")]
    DuplicateParticipant(UserId),
    #[error("user is not a participant of this event: {0}")]
    NotParticipant(UserId),
    #[error("not allowed")]
    Forbidden,
    #[error("unknown draw strategy: {0}")]
    UnknownStrategy(String),
}

/// Timestamps are written as RFC 3339. Older records carry naive ISO-8601
/// strings without an offset; those are read as UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, ParseError, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, ParseError> {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Ok(ts.with_timezone(&Utc)),
            Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|n| n.and_utc()),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
