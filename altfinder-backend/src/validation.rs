/// Input validation for everything that reaches the engine from outside
use altfinder_db::validation::{is_valid_uuid, normalize_ip};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Longest server label the store accepts
pub const MAX_SERVER_NAME_LEN: usize = 255;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid IP address: {0:?}")]
    InvalidIp(String),

    #[error("Invalid player UUID: {0:?}")]
    InvalidPlayerId(String),

    #[error("Search key must be an IP address or a player UUID, got {0:?}")]
    InvalidKey(String),

    #[error("Server name cannot be empty")]
    ServerNameEmpty,

    #[error("Server name too long (max 255 characters, got {0})")]
    ServerNameTooLong(usize),
}

/// A classified search key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Lookup {
    /// Normalized IP literal
    Ip(String),
    Player(Uuid),
}

impl Lookup {
    /// Classify a user-supplied key: IP literals first, then UUIDs.
    pub fn parse(key: &str) -> Result<Self, ValidationError> {
        let key = key.trim();
        if let Some(ip) = normalize_ip(key) {
            return Ok(Lookup::Ip(ip));
        }
        if is_valid_uuid(key) {
            if let Ok(id) = Uuid::parse_str(key) {
                return Ok(Lookup::Player(id));
            }
        }
        Err(ValidationError::InvalidKey(key.to_string()))
    }

    /// The string the store and the sync channels use for this key.
    pub fn key(&self) -> String {
        match self {
            Lookup::Ip(ip) => ip.clone(),
            Lookup::Player(id) => id.to_string(),
        }
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Ip(ip) => f.write_str(ip),
            Lookup::Player(id) => write!(f, "{id}"),
        }
    }
}

/// Validates an IP literal and returns its canonical form
pub fn parse_ip(ip: &str) -> Result<String, ValidationError> {
    normalize_ip(ip).ok_or_else(|| ValidationError::InvalidIp(ip.to_string()))
}

/// Validates a hyphenated player UUID
pub fn parse_player_id(id: &str) -> Result<Uuid, ValidationError> {
    let id = id.trim();
    if !is_valid_uuid(id) {
        return Err(ValidationError::InvalidPlayerId(id.to_string()));
    }
    Uuid::parse_str(id).map_err(|_| ValidationError::InvalidPlayerId(id.to_string()))
}

/// Validates a server label
///
/// Rules:
/// - Cannot be empty or whitespace
/// - Max 255 characters
pub fn validate_server(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::ServerNameEmpty);
    }

    let len = name.chars().count();
    if len > MAX_SERVER_NAME_LEN {
        return Err(ValidationError::ServerNameTooLong(len));
    }

    Ok(())
}
