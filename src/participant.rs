//! Participant identity and session roles

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Endpoint role in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Receives media from every participant
    Host,
    /// Sends media to the host
    Participant,
}

impl Role {
    /// Identifier prefix for ids minted under this role
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Participant => "participant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Globally-unique, role-prefixed participant identifier.
///
/// Minted once per logical participant and stable across reconnection
/// attempts for that participant. Never empty, never reused for a different
/// logical participant within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Mint a fresh identifier for the given role
    pub fn mint(role: Role) -> Self {
        Self(format!("{}-{}", role.prefix(), Uuid::new_v4()))
    }

    /// Parse and validate an identifier received over the wire
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidData("empty participant id".to_string()));
        }
        if Self::role_of(raw).is_none() {
            return Err(Error::InvalidData(format!(
                "participant id missing role prefix: {}",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Role encoded in the identifier prefix
    pub fn role(&self) -> Role {
        // Constructors guarantee a valid prefix.
        Self::role_of(&self.0).unwrap_or(Role::Participant)
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn role_of(raw: &str) -> Option<Role> {
        if raw.strip_prefix("host-").is_some_and(|rest| !rest.is_empty()) {
            Some(Role::Host)
        } else if raw
            .strip_prefix("participant-")
            .is_some_and(|rest| !rest.is_empty())
        {
            Some(Role::Participant)
        } else {
            None
        }
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> String {
        id.0
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
