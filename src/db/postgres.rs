use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;

use crate::db::manager::Pool;
use crate::db::schema::{channel_mappings, puppet_mappings, room_mappings, room_members};

use super::{
    DatabaseError,
    models::{ChannelMapping, PuppetMapping, RoomMapping, RoomMember},
};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = channel_mappings)]
struct DbChannelMapping {
    source_channel_id: String,
    room_id: String,
    last_metadata_sync: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<DbChannelMapping> for ChannelMapping {
    fn from(value: DbChannelMapping) -> Self {
        Self {
            source_channel_id: value.source_channel_id,
            room_id: value.room_id,
            last_metadata_sync: value.last_metadata_sync,
            created_at: value.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = channel_mappings)]
struct NewChannelMapping<'a> {
    source_channel_id: &'a str,
    room_id: &'a str,
    last_metadata_sync: &'a DateTime<Utc>,
    created_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = room_mappings)]
struct DbRoomMapping {
    room_id: String,
    source_adapter_id: String,
    source_channel_id: String,
    source_guild_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<DbRoomMapping> for RoomMapping {
    fn from(value: DbRoomMapping) -> Self {
        Self {
            room_id: value.room_id,
            source_adapter_id: value.source_adapter_id,
            source_channel_id: value.source_channel_id,
            source_guild_id: value.source_guild_id,
            created_at: value.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = room_mappings)]
struct NewRoomMapping<'a> {
    room_id: &'a str,
    source_adapter_id: &'a str,
    source_channel_id: &'a str,
    source_guild_id: Option<&'a str>,
    created_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = puppet_mappings)]
struct DbPuppetMapping {
    source_user_id: String,
    puppet_id: String,
    auth_token: String,
    last_metadata_sync: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<DbPuppetMapping> for PuppetMapping {
    fn from(value: DbPuppetMapping) -> Self {
        Self {
            source_user_id: value.source_user_id,
            puppet_id: value.puppet_id,
            auth_token: value.auth_token,
            last_metadata_sync: value.last_metadata_sync,
            created_at: value.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = puppet_mappings)]
struct NewPuppetMapping<'a> {
    source_user_id: &'a str,
    puppet_id: &'a str,
    auth_token: &'a str,
    last_metadata_sync: &'a DateTime<Utc>,
    created_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = room_members)]
struct DbRoomMember {
    source_channel_id: String,
    source_user_id: String,
    joined_at: DateTime<Utc>,
}

impl From<DbRoomMember> for RoomMember {
    fn from(value: DbRoomMember) -> Self {
        Self {
            source_channel_id: value.source_channel_id,
            source_user_id: value.source_user_id,
            joined_at: value.joined_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = room_members)]
struct NewRoomMember<'a> {
    source_channel_id: &'a str,
    source_user_id: &'a str,
    joined_at: &'a DateTime<Utc>,
}

async fn with_connection<T, F>(pool: Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub struct PostgresChannelStore {
    pool: Pool,
}

impl PostgresChannelStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::ChannelStore for PostgresChannelStore {
    async fn get_channel_mapping(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelMapping>, DatabaseError> {
        let channel_id = channel_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::channel_mappings::dsl::*;
            channel_mappings
                .filter(source_channel_id.eq(channel_id))
                .select(DbChannelMapping::as_select())
                .first::<DbChannelMapping>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn get_room_mapping(&self, room: &str) -> Result<Option<RoomMapping>, DatabaseError> {
        let room = room.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::room_mappings::dsl::*;
            room_mappings
                .filter(room_id.eq(room))
                .select(DbRoomMapping::as_select())
                .first::<DbRoomMapping>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn create_room_link(
        &self,
        channel: &ChannelMapping,
        room: &RoomMapping,
    ) -> Result<(), DatabaseError> {
        let channel = channel.clone();
        let room = room.clone();
        with_connection(self.pool.clone(), move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::insert_into(channel_mappings::table)
                    .values(NewChannelMapping {
                        source_channel_id: &channel.source_channel_id,
                        room_id: &channel.room_id,
                        last_metadata_sync: &channel.last_metadata_sync,
                        created_at: &channel.created_at,
                    })
                    .execute(conn)?;
                diesel::insert_into(room_mappings::table)
                    .values(NewRoomMapping {
                        room_id: &room.room_id,
                        source_adapter_id: &room.source_adapter_id,
                        source_channel_id: &room.source_channel_id,
                        source_guild_id: room.source_guild_id.as_deref(),
                        created_at: &room.created_at,
                    })
                    .execute(conn)?;
                Ok(())
            })
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn touch_channel_sync(
        &self,
        channel_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let channel_id = channel_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::channel_mappings::dsl::*;
            diesel::update(channel_mappings.filter(source_channel_id.eq(channel_id)))
                .set(last_metadata_sync.eq(at))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn count_rooms(&self) -> Result<i64, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::room_mappings::dsl::*;
            room_mappings
                .count()
                .get_result(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn list_room_mappings(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RoomMapping>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::room_mappings::dsl::*;
            room_mappings
                .order(created_at.desc())
                .limit(limit)
                .offset(offset)
                .select(DbRoomMapping::as_select())
                .load::<DbRoomMapping>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct PostgresPuppetStore {
    pool: Pool,
}

impl PostgresPuppetStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::PuppetStore for PostgresPuppetStore {
    async fn get_puppet(&self, user_id: &str) -> Result<Option<PuppetMapping>, DatabaseError> {
        let user_id = user_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::puppet_mappings::dsl::*;
            puppet_mappings
                .filter(source_user_id.eq(user_id))
                .select(DbPuppetMapping::as_select())
                .first::<DbPuppetMapping>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn create_puppet(&self, mapping: &PuppetMapping) -> Result<(), DatabaseError> {
        let mapping = mapping.clone();
        with_connection(self.pool.clone(), move |conn| {
            diesel::insert_into(puppet_mappings::table)
                .values(NewPuppetMapping {
                    source_user_id: &mapping.source_user_id,
                    puppet_id: &mapping.puppet_id,
                    auth_token: &mapping.auth_token,
                    last_metadata_sync: &mapping.last_metadata_sync,
                    created_at: &mapping.created_at,
                })
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn touch_puppet_sync(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let user_id = user_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::puppet_mappings::dsl::*;
            diesel::update(puppet_mappings.filter(source_user_id.eq(user_id)))
                .set(last_metadata_sync.eq(at))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct PostgresMembershipStore {
    pool: Pool,
}

impl PostgresMembershipStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::MembershipStore for PostgresMembershipStore {
    async fn is_member(&self, channel_id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        let channel_id = channel_id.to_string();
        let user_id = user_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::room_members::dsl::*;
            diesel::select(diesel::dsl::exists(
                room_members
                    .filter(source_channel_id.eq(channel_id))
                    .filter(source_user_id.eq(user_id)),
            ))
            .get_result::<bool>(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn add_member(&self, member: &RoomMember) -> Result<(), DatabaseError> {
        let member = member.clone();
        with_connection(self.pool.clone(), move |conn| {
            diesel::insert_into(room_members::table)
                .values(NewRoomMember {
                    source_channel_id: &member.source_channel_id,
                    source_user_id: &member.source_user_id,
                    joined_at: &member.joined_at,
                })
                .on_conflict_do_nothing()
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn list_members(&self, channel_id: &str) -> Result<Vec<RoomMember>, DatabaseError> {
        let channel_id = channel_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::room_members::dsl::*;
            room_members
                .filter(source_channel_id.eq(channel_id))
                .order(joined_at.asc())
                .select(DbRoomMember::as_select())
                .load::<DbRoomMember>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}
