use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One piece of message content, independent of either platform's wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageElement {
    Text { content: String },
    Mention { user_id: String, name: Option<String> },
    Image { url: String },
    File { url: String, name: Option<String> },
}

impl MessageElement {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }
}

/// A message delivered to the bridge, from either side.
///
/// For events coming from the target protocol `origin_bot_id` is the bridge
/// identity and `channel_id` is the room id; for source events it is the id of
/// the adapter that produced the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub origin_bot_id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub user_id: String,
    pub author_nickname: Option<String>,
    pub author_avatar: Option<String>,
    pub elements: Vec<MessageElement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMetadata {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserMetadata {
    pub nickname: Option<String>,
    pub avatar_url: Option<String>,
}

/// Optional lookup capability of a source adapter.
#[async_trait]
pub trait SourceMetadata: Send + Sync {
    async fn get_channel_metadata(
        &self,
        channel_id: &str,
        guild_id: Option<&str>,
    ) -> Result<ChannelMetadata>;

    async fn get_user_metadata(&self, user_id: &str, guild_id: Option<&str>)
    -> Result<UserMetadata>;
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Delivers content to a source channel and returns the platform message id.
    async fn send(
        &self,
        channel_id: &str,
        elements: &[MessageElement],
        guild_id: Option<&str>,
    ) -> Result<String>;

    fn metadata(&self) -> Option<&dyn SourceMetadata> {
        None
    }
}

#[derive(Default)]
pub struct SourceRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn SourceAdapter>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters
            .write()
            .insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, adapter_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.read().get(adapter_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
