use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use crate::db::schema_sqlite::{channel_mappings, puppet_mappings, room_mappings, room_members};

use super::{
    DatabaseError,
    models::{ChannelMapping, PuppetMapping, RoomMapping, RoomMember},
};

// Helper function to convert DateTime to ISO string for SQLite
fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// Helper function to parse ISO string to DateTime
fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = channel_mappings)]
struct DbChannelMapping {
    source_channel_id: String,
    room_id: String,
    last_metadata_sync: String,
    created_at: String,
}

impl DbChannelMapping {
    fn to_channel_mapping(&self) -> Result<ChannelMapping, DatabaseError> {
        Ok(ChannelMapping {
            source_channel_id: self.source_channel_id.clone(),
            room_id: self.room_id.clone(),
            last_metadata_sync: string_to_datetime(&self.last_metadata_sync)?,
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = channel_mappings)]
struct NewChannelMapping<'a> {
    source_channel_id: &'a str,
    room_id: &'a str,
    last_metadata_sync: String,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = room_mappings)]
struct DbRoomMapping {
    room_id: String,
    source_adapter_id: String,
    source_channel_id: String,
    source_guild_id: Option<String>,
    created_at: String,
}

impl DbRoomMapping {
    fn to_room_mapping(&self) -> Result<RoomMapping, DatabaseError> {
        Ok(RoomMapping {
            room_id: self.room_id.clone(),
            source_adapter_id: self.source_adapter_id.clone(),
            source_channel_id: self.source_channel_id.clone(),
            source_guild_id: self.source_guild_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = room_mappings)]
struct NewRoomMapping<'a> {
    room_id: &'a str,
    source_adapter_id: &'a str,
    source_channel_id: &'a str,
    source_guild_id: Option<&'a str>,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = puppet_mappings)]
struct DbPuppetMapping {
    source_user_id: String,
    puppet_id: String,
    auth_token: String,
    last_metadata_sync: String,
    created_at: String,
}

impl DbPuppetMapping {
    fn to_puppet_mapping(&self) -> Result<PuppetMapping, DatabaseError> {
        Ok(PuppetMapping {
            source_user_id: self.source_user_id.clone(),
            puppet_id: self.puppet_id.clone(),
            auth_token: self.auth_token.clone(),
            last_metadata_sync: string_to_datetime(&self.last_metadata_sync)?,
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = puppet_mappings)]
struct NewPuppetMapping<'a> {
    source_user_id: &'a str,
    puppet_id: &'a str,
    auth_token: &'a str,
    last_metadata_sync: String,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = room_members)]
struct DbRoomMember {
    source_channel_id: String,
    source_user_id: String,
    joined_at: String,
}

impl DbRoomMember {
    fn to_room_member(&self) -> Result<RoomMember, DatabaseError> {
        Ok(RoomMember {
            source_channel_id: self.source_channel_id.clone(),
            source_user_id: self.source_user_id.clone(),
            joined_at: string_to_datetime(&self.joined_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = room_members)]
struct NewRoomMember<'a> {
    source_channel_id: &'a str,
    source_user_id: &'a str,
    joined_at: String,
}

pub(crate) fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))
}

async fn with_connection<T, F>(db_path: Arc<String>, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = establish_connection(&db_path)?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub struct SqliteChannelStore {
    db_path: Arc<String>,
}

impl SqliteChannelStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::ChannelStore for SqliteChannelStore {
    async fn get_channel_mapping(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelMapping>, DatabaseError> {
        let channel_id = channel_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::channel_mappings::dsl::*;
            channel_mappings
                .filter(source_channel_id.eq(channel_id))
                .select(DbChannelMapping::as_select())
                .first::<DbChannelMapping>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|m| m.to_channel_mapping())
                .transpose()
        })
        .await
    }

    async fn get_room_mapping(&self, room: &str) -> Result<Option<RoomMapping>, DatabaseError> {
        let room = room.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::room_mappings::dsl::*;
            room_mappings
                .filter(room_id.eq(room))
                .select(DbRoomMapping::as_select())
                .first::<DbRoomMapping>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|m| m.to_room_mapping())
                .transpose()
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
        with_connection(self.db_path.clone(), move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::insert_into(channel_mappings::table)
                    .values(NewChannelMapping {
                        source_channel_id: &channel.source_channel_id,
                        room_id: &channel.room_id,
                        last_metadata_sync: datetime_to_string(&channel.last_metadata_sync),
                        created_at: datetime_to_string(&channel.created_at),
                    })
                    .execute(conn)?;
                diesel::insert_into(room_mappings::table)
                    .values(NewRoomMapping {
                        room_id: &room.room_id,
                        source_adapter_id: &room.source_adapter_id,
                        source_channel_id: &room.source_channel_id,
                        source_guild_id: room.source_guild_id.as_deref(),
                        created_at: datetime_to_string(&room.created_at),
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
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::channel_mappings::dsl::*;
            diesel::update(channel_mappings.filter(source_channel_id.eq(channel_id)))
                .set(last_metadata_sync.eq(datetime_to_string(&at)))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn count_rooms(&self) -> Result<i64, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::room_mappings::dsl::*;
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
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::room_mappings::dsl::*;
            let results = room_mappings
                .order(created_at.desc())
                .limit(limit)
                .offset(offset)
                .select(DbRoomMapping::as_select())
                .load::<DbRoomMapping>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;

            results.into_iter().map(|m| m.to_room_mapping()).collect()
        })
        .await
    }
}

pub struct SqlitePuppetStore {
    db_path: Arc<String>,
}

impl SqlitePuppetStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::PuppetStore for SqlitePuppetStore {
    async fn get_puppet(&self, user_id: &str) -> Result<Option<PuppetMapping>, DatabaseError> {
        let user_id = user_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::puppet_mappings::dsl::*;
            puppet_mappings
                .filter(source_user_id.eq(user_id))
                .select(DbPuppetMapping::as_select())
                .first::<DbPuppetMapping>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|m| m.to_puppet_mapping())
                .transpose()
        })
        .await
    }

    async fn create_puppet(&self, mapping: &PuppetMapping) -> Result<(), DatabaseError> {
        let mapping = mapping.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let new_mapping = NewPuppetMapping {
                source_user_id: &mapping.source_user_id,
                puppet_id: &mapping.puppet_id,
                auth_token: &mapping.auth_token,
                last_metadata_sync: datetime_to_string(&mapping.last_metadata_sync),
                created_at: datetime_to_string(&mapping.created_at),
            };

            diesel::insert_into(puppet_mappings::table)
                .values(new_mapping)
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
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::puppet_mappings::dsl::*;
            diesel::update(puppet_mappings.filter(source_user_id.eq(user_id)))
                .set(last_metadata_sync.eq(datetime_to_string(&at)))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct SqliteMembershipStore {
    db_path: Arc<String>,
}

impl SqliteMembershipStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::MembershipStore for SqliteMembershipStore {
    async fn is_member(&self, channel_id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        let channel_id = channel_id.to_string();
        let user_id = user_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::room_members::dsl::*;
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
        with_connection(self.db_path.clone(), move |conn| {
            diesel::insert_or_ignore_into(room_members::table)
                .values(NewRoomMember {
                    source_channel_id: &member.source_channel_id,
                    source_user_id: &member.source_user_id,
                    joined_at: datetime_to_string(&member.joined_at),
                })
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn list_members(&self, channel_id: &str) -> Result<Vec<RoomMember>, DatabaseError> {
        let channel_id = channel_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::room_members::dsl::*;
            let results = room_members
                .filter(source_channel_id.eq(channel_id))
                .order(joined_at.asc())
                .select(DbRoomMember::as_select())
                .load::<DbRoomMember>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            results.into_iter().map(|m| m.to_room_member()).collect()
        })
        .await
    }
}
