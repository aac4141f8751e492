use super::SyncError;
use altfinder_db::Sighting;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel carrying new or refreshed sightings
pub const INFO_CHANNEL: &str = "altfndr-info";
/// Channel carrying raw keys to evict
pub const DELETE_CHANNEL: &str = "altfndr-delete";

/// A decoded message from either channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    Info { sighting: Sighting, origin: Uuid },
    Delete { key: String },
}

/// Wire form of an info message.
#[derive(Debug, Serialize, Deserialize)]
struct InfoPayload {
    uuid: Uuid,
    ip: String,
    count: i64,
    server: String,
    created: i64,
    updated: i64,
    /// Node that published the message
    id: Uuid,
}

impl SyncMessage {
    pub fn channel(&self) -> &'static str {
        match self {
            SyncMessage::Info { .. } => INFO_CHANNEL,
            SyncMessage::Delete { .. } => DELETE_CHANNEL,
        }
    }

    /// Serialize to the payload published on [`Self::channel`].
    pub fn encode(&self) -> Result<String, SyncError> {
        match self {
            SyncMessage::Info { sighting, origin } => {
                let payload = InfoPayload {
                    uuid: sighting.player_id,
                    ip: sighting.ip.clone(),
                    count: sighting.count,
                    server: sighting.server.clone(),
                    created: sighting.created,
                    updated: sighting.updated,
                    id: *origin,
                };
                Ok(serde_json::to_string(&payload)?)
            }
            SyncMessage::Delete { key } => Ok(key.clone()),
        }
    }

    pub fn decode(channel: &str, payload: &str) -> Result<Self, SyncError> {
        match channel {
            INFO_CHANNEL => {
                let info: InfoPayload = serde_json::from_str(payload)?;
                Ok(SyncMessage::Info {
                    sighting: Sighting {
                        player_id: info.uuid,
                        ip: info.ip,
                        count: info.count,
                        server: info.server,
                        created: info.created,
                        updated: info.updated,
                    },
                    origin: info.id,
                })
            }
            DELETE_CHANNEL => Ok(SyncMessage::Delete {
                key: payload.to_string(),
            }),
            other => Err(SyncError::UnknownChannel(other.to_string())),
        }
    }
}
