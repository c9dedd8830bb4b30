use std::sync::Arc;

use crate::config::{DatabaseConfig, DbType};
use crate::db::{ChannelStore, DatabaseError, MembershipStore, PuppetStore};

#[cfg(feature = "postgres")]
use crate::db::postgres::{PostgresChannelStore, PostgresMembershipStore, PostgresPuppetStore};
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

#[cfg(any(feature = "postgres", feature = "sqlite"))]
use diesel::RunQueryDsl;

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{
    SqliteChannelStore, SqliteMembershipStore, SqlitePuppetStore, establish_connection,
};

#[cfg(feature = "postgres")]
const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS channel_mappings (
        source_channel_id TEXT PRIMARY KEY,
        room_id TEXT NOT NULL,
        last_metadata_sync TIMESTAMP WITH TIME ZONE NOT NULL,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS room_mappings (
        room_id TEXT PRIMARY KEY,
        source_adapter_id TEXT NOT NULL,
        source_channel_id TEXT NOT NULL,
        source_guild_id TEXT,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS puppet_mappings (
        source_user_id TEXT PRIMARY KEY,
        puppet_id TEXT NOT NULL UNIQUE,
        auth_token TEXT NOT NULL,
        last_metadata_sync TIMESTAMP WITH TIME ZONE NOT NULL,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS room_members (
        source_channel_id TEXT NOT NULL,
        source_user_id TEXT NOT NULL,
        joined_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        PRIMARY KEY (source_channel_id, source_user_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_room_mappings_channel ON room_mappings(source_channel_id)",
];

#[cfg(feature = "sqlite")]
const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS channel_mappings (
        source_channel_id TEXT PRIMARY KEY NOT NULL,
        room_id TEXT NOT NULL,
        last_metadata_sync TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS room_mappings (
        room_id TEXT PRIMARY KEY NOT NULL,
        source_adapter_id TEXT NOT NULL,
        source_channel_id TEXT NOT NULL,
        source_guild_id TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS puppet_mappings (
        source_user_id TEXT PRIMARY KEY NOT NULL,
        puppet_id TEXT NOT NULL UNIQUE,
        auth_token TEXT NOT NULL,
        last_metadata_sync TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS room_members (
        source_channel_id TEXT NOT NULL,
        source_user_id TEXT NOT NULL,
        joined_at TEXT NOT NULL,
        PRIMARY KEY (source_channel_id, source_user_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_room_mappings_channel ON room_mappings(source_channel_id)",
];

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    channel_store: Arc<dyn ChannelStore>,
    puppet_store: Arc<dyn PuppetStore>,
    membership_store: Arc<dyn MembershipStore>,
    db_type: DbType,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = config.db_type();

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let manager = ConnectionManager::<PgConnection>::new(config.connection_string());
                let pool = r2d2::Pool::builder()
                    .max_size(config.max_connections().unwrap_or(10))
                    .min_idle(Some(config.min_connections().unwrap_or(1)))
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                Ok(Self {
                    channel_store: Arc::new(PostgresChannelStore::new(pool.clone())),
                    puppet_store: Arc::new(PostgresPuppetStore::new(pool.clone())),
                    membership_store: Arc::new(PostgresMembershipStore::new(pool.clone())),
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite database path is not configured".to_string())
                })?;
                let shared = Arc::new(path.clone());

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    channel_store: Arc::new(SqliteChannelStore::new(shared.clone())),
                    puppet_store: Arc::new(SqlitePuppetStore::new(shared.clone())),
                    membership_store: Arc::new(SqliteMembershipStore::new(shared)),
                    sqlite_path: Some(path),
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    /// Creates the mapping tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.clone().ok_or_else(|| {
                    DatabaseError::Migration("postgres pool is not initialized".to_string())
                })?;
                tokio::task::spawn_blocking(move || {
                    let mut conn = pool
                        .get()
                        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
                    for statement in POSTGRES_SCHEMA {
                        diesel::sql_query(*statement)
                            .execute(&mut conn)
                            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
                    }
                    Ok(())
                })
                .await
                .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.clone().ok_or_else(|| {
                    DatabaseError::Migration("sqlite path is not initialized".to_string())
                })?;
                tokio::task::spawn_blocking(move || {
                    let mut conn = establish_connection(&path)?;
                    for statement in SQLITE_SCHEMA {
                        diesel::sql_query(*statement)
                            .execute(&mut conn)
                            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
                    }
                    Ok(())
                })
                .await
                .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub fn channel_store(&self) -> Arc<dyn ChannelStore> {
        self.channel_store.clone()
    }

    pub fn puppet_store(&self) -> Arc<dyn PuppetStore> {
        self.puppet_store.clone()
    }

    pub fn membership_store(&self) -> Arc<dyn MembershipStore> {
        self.membership_store.clone()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}
