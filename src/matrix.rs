use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub mod client;
pub mod event_handler;

pub use self::client::{MatrixApiError, MatrixClient};
pub use self::event_handler::{MatrixEvent, MatrixEventHandler, MatrixEventProcessor};

/// Credentials of an identity other than the bridge bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisteredIdentity {
    pub user_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub state_key: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateRoomRequest {
    pub name: String,
    pub preset: String,
    pub visibility: String,
    pub creation_content: Value,
    pub power_level_content_override: Value,
    pub invite: Vec<String>,
}

impl CreateRoomRequest {
    /// A private, non-federated room administered by the bot and one human.
    pub fn private_portal(name: &str, bot_user_id: &str, human_user_id: &str) -> Self {
        let mut users = serde_json::Map::new();
        users.insert(bot_user_id.to_string(), json!(100));
        users.insert(human_user_id.to_string(), json!(100));

        Self {
            name: name.to_string(),
            preset: "private_chat".to_string(),
            visibility: "private".to_string(),
            creation_content: json!({ "m.federate": false }),
            power_level_content_override: json!({ "users": users }),
            invite: vec![human_user_id.to_string()],
        }
    }
}

/// Operations the bridge needs from the target homeserver.
///
/// Calls without an [`Identity`] act as the bridge bot.
#[async_trait]
pub trait TargetClient: Send + Sync {
    async fn whoami(&self) -> Result<String>;
    async fn create_room(&self, request: &CreateRoomRequest) -> Result<String>;
    async fn get_room_state(&self, room_id: &str) -> Result<Vec<StateEvent>>;
    async fn set_room_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String>;
    async fn upload_media(&self, data: Vec<u8>, content_type: &str, filename: &str)
    -> Result<String>;
    async fn register_identity(&self, localpart: &str) -> Result<RegisteredIdentity>;
    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()>;
    async fn join_room(&self, identity: &Identity, room_id: &str) -> Result<()>;
    async fn set_display_name(&self, identity: &Identity, display_name: &str) -> Result<()>;
    async fn set_avatar_url(&self, identity: &Identity, avatar_url: &str) -> Result<()>;
    async fn list_joined_rooms(&self) -> Result<Vec<String>>;
    async fn send_message(
        &self,
        identity: &Identity,
        room_id: &str,
        content: &Value,
    ) -> Result<String>;
}

/// True when the homeserver refused an invite because the user is already in the room.
pub fn is_already_joined(err: &anyhow::Error) -> bool {
    err.downcast_ref::<MatrixApiError>().is_some_and(|api| {
        api.errcode == "M_FORBIDDEN" && api.error.contains("already in the room")
    })
}

/// Returns the `content` of a state event with the given type and empty state key.
pub fn find_state<'a>(events: &'a [StateEvent], event_type: &str) -> Option<&'a Value> {
    events
        .iter()
        .find(|event| event.event_type == event_type && event.state_key.is_empty())
        .map(|event| &event.content)
}
