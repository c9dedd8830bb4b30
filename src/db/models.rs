use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Forward link from a source channel to the room mirroring it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMapping {
    pub source_channel_id: String,
    pub room_id: String,
    pub last_metadata_sync: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Reverse link from a bridged room back to where its traffic belongs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMapping {
    pub room_id: String,
    pub source_adapter_id: String,
    pub source_channel_id: String,
    pub source_guild_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PuppetMapping {
    pub source_user_id: String,
    pub puppet_id: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub last_metadata_sync: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMember {
    pub source_channel_id: String,
    pub source_user_id: String,
    pub joined_at: DateTime<Utc>,
}
