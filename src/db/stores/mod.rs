use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::DatabaseError;
use super::models::{ChannelMapping, PuppetMapping, RoomMapping, RoomMember};

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn get_channel_mapping(
        &self,
        source_channel_id: &str,
    ) -> Result<Option<ChannelMapping>, DatabaseError>;
    async fn get_room_mapping(&self, room_id: &str) -> Result<Option<RoomMapping>, DatabaseError>;
    /// Inserts the forward and reverse mapping of a new room in one transaction.
    async fn create_room_link(
        &self,
        channel: &ChannelMapping,
        room: &RoomMapping,
    ) -> Result<(), DatabaseError>;
    async fn touch_channel_sync(
        &self,
        source_channel_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
    async fn count_rooms(&self) -> Result<i64, DatabaseError>;
    async fn list_room_mappings(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RoomMapping>, DatabaseError>;
}

#[async_trait]
pub trait PuppetStore: Send + Sync {
    async fn get_puppet(
        &self,
        source_user_id: &str,
    ) -> Result<Option<PuppetMapping>, DatabaseError>;
    async fn create_puppet(&self, mapping: &PuppetMapping) -> Result<(), DatabaseError>;
    async fn touch_puppet_sync(
        &self,
        source_user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn is_member(
        &self,
        source_channel_id: &str,
        source_user_id: &str,
    ) -> Result<bool, DatabaseError>;
    /// Adding an existing member is a no-op.
    async fn add_member(&self, member: &RoomMember) -> Result<(), DatabaseError>;
    async fn list_members(&self, source_channel_id: &str) -> Result<Vec<RoomMember>, DatabaseError>;
}
