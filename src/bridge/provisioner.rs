use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::db::{ChannelMapping, DatabaseManager, PuppetMapping, RoomMapping, RoomMember};
use crate::matrix::{CreateRoomRequest, Identity, TargetClient, find_state, is_already_joined};
use crate::media::{ImageInfo, MediaFetcher, MediaInfo};
use crate::source::{ChannelMetadata, InboundEvent, SourceMetadata};
use crate::web::metrics::Metrics;

use super::PortalSettings;
use super::gate::GateGuard;
use super::logic::{puppet_display_name, puppet_localpart, room_display_name};

/// Creates and refreshes rooms, puppets and memberships.
///
/// Every mutating operation takes a [`GateGuard`] and re-reads the mapping store
/// before acting on it.
pub struct Provisioner {
    settings: Arc<PortalSettings>,
    target: Arc<dyn TargetClient>,
    db: Arc<DatabaseManager>,
    media: Arc<dyn MediaFetcher>,
    joined_rooms: RwLock<HashSet<String>>,
}

pub(crate) fn puppet_identity(puppet: &PuppetMapping) -> Identity {
    Identity {
        user_id: puppet.puppet_id.clone(),
        access_token: puppet.auth_token.clone(),
    }
}

impl Provisioner {
    pub fn new(
        settings: Arc<PortalSettings>,
        target: Arc<dyn TargetClient>,
        db: Arc<DatabaseManager>,
        media: Arc<dyn MediaFetcher>,
    ) -> Self {
        Self {
            settings,
            target,
            db,
            media,
            joined_rooms: RwLock::new(HashSet::new()),
        }
    }

    /// Reloads the rooms the bridge identity has joined.
    pub async fn sync_joined_rooms(&self) -> Result<usize> {
        let rooms = self.target.list_joined_rooms().await?;
        let count = rooms.len();
        *self.joined_rooms.write() = rooms.into_iter().collect();
        debug!("bridge identity joined rooms synced count={}", count);
        Ok(count)
    }

    pub fn is_joined(&self, room_id: &str) -> bool {
        self.joined_rooms.read().contains(room_id)
    }

    async fn channel_metadata(
        &self,
        event: &InboundEvent,
        metadata: Option<&dyn SourceMetadata>,
    ) -> ChannelMetadata {
        let Some(metadata) = metadata else {
            return ChannelMetadata::default();
        };
        match metadata
            .get_channel_metadata(&event.channel_id, event.guild_id.as_deref())
            .await
        {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    "channel metadata lookup failed channel_id={}: {:#}",
                    event.channel_id, err
                );
                ChannelMetadata::default()
            }
        }
    }

    pub(crate) async fn upload_remote(&self, url: &str) -> Result<(String, MediaInfo)> {
        let media = self.media.fetch(url).await?;
        let mxc = self
            .target
            .upload_media(media.data.clone(), &media.content_type, &media.filename)
            .await
            .with_context(|| format!("failed to upload media from {url}"))?;
        Ok((mxc, media))
    }

    pub(crate) async fn upload_image(&self, url: &str) -> Result<(String, MediaInfo, ImageInfo)> {
        let media = self.media.fetch(url).await?;
        let info = media.image_info()?;
        let mxc = self
            .target
            .upload_media(media.data.clone(), &info.mimetype, &media.filename)
            .await
            .with_context(|| format!("failed to upload image from {url}"))?;
        Ok((mxc, media, info))
    }

    async fn set_room_avatar(&self, room_id: &str, url: &str) -> Result<()> {
        let (mxc, _, info) = self.upload_image(url).await?;
        self.target
            .set_room_state(
                room_id,
                "m.room.avatar",
                "",
                &json!({ "url": mxc, "info": info.to_json() }),
            )
            .await?;
        Ok(())
    }

    async fn attach_to_space(&self, room_id: &str) -> Result<()> {
        let via = json!([self.settings.server_name]);
        self.target
            .set_room_state(
                &self.settings.space,
                "m.space.child",
                room_id,
                &json!({ "via": via, "suggested": false }),
            )
            .await?;
        self.target
            .set_room_state(
                room_id,
                "m.space.parent",
                &self.settings.space,
                &json!({ "via": via, "canonical": true }),
            )
            .await?;
        Ok(())
    }

    /// Returns the room of the event's channel, creating it on first use.
    ///
    /// A failure after the room was created leaves it orphaned: nothing is persisted.
    pub async fn ensure_room(
        &self,
        _gate: &GateGuard,
        event: &InboundEvent,
        metadata: Option<&dyn SourceMetadata>,
    ) -> Result<ChannelMapping> {
        let channels = self.db.channel_store();
        if let Some(mapping) = channels.get_channel_mapping(&event.channel_id).await? {
            return Ok(mapping);
        }

        let channel = self.channel_metadata(event, metadata).await;
        let name = room_display_name(channel.name.as_deref(), &event.channel_id);
        let request = CreateRoomRequest::private_portal(
            &name,
            &self.settings.bot_user_id,
            &self.settings.human_user,
        );
        let room_id = self
            .target
            .create_room(&request)
            .await
            .with_context(|| format!("failed to create room for channel {}", event.channel_id))?;
        info!(
            "created room room_id={} channel_id={} name={}",
            room_id, event.channel_id, name
        );

        if let Some(avatar) = channel.avatar_url.as_deref() {
            self.set_room_avatar(&room_id, avatar).await?;
        }
        self.attach_to_space(&room_id).await?;

        let now = Utc::now();
        let mapping = ChannelMapping {
            source_channel_id: event.channel_id.clone(),
            room_id: room_id.clone(),
            last_metadata_sync: now,
            created_at: now,
        };
        let reverse = RoomMapping {
            room_id: room_id.clone(),
            source_adapter_id: event.origin_bot_id.clone(),
            source_channel_id: event.channel_id.clone(),
            source_guild_id: event.guild_id.clone(),
            created_at: now,
        };
        channels.create_room_link(&mapping, &reverse).await?;
        Metrics::room_provisioned();

        if let Err(err) = self.sync_joined_rooms().await {
            warn!("failed to resync joined rooms after creating {}: {:#}", room_id, err);
        }

        Ok(mapping)
    }

    /// Re-applies the channel's name and avatar to its room and stamps the sync time.
    pub async fn refresh_room(
        &self,
        _gate: &GateGuard,
        mapping: &ChannelMapping,
        event: &InboundEvent,
        metadata: Option<&dyn SourceMetadata>,
    ) -> Result<()> {
        let channel = self.channel_metadata(event, metadata).await;

        if let Some(avatar) = channel.avatar_url.as_deref() {
            self.set_room_avatar(&mapping.room_id, avatar).await?;
        }

        let desired = room_display_name(channel.name.as_deref(), &mapping.source_channel_id);
        let state = self.target.get_room_state(&mapping.room_id).await?;
        let current = find_state(&state, "m.room.name")
            .and_then(|content| content.get("name"))
            .and_then(Value::as_str);
        if current != Some(desired.as_str()) {
            debug!(
                "updating room name room_id={} from={:?} to={}",
                mapping.room_id, current, desired
            );
            self.target
                .set_room_state(&mapping.room_id, "m.room.name", "", &json!({ "name": desired }))
                .await?;
        }

        self.db
            .channel_store()
            .touch_channel_sync(&mapping.source_channel_id, Utc::now())
            .await?;
        Ok(())
    }

    /// Returns the puppet of the event's author, registering it on first use.
    pub async fn ensure_puppet(
        &self,
        gate: &GateGuard,
        event: &InboundEvent,
        metadata: Option<&dyn SourceMetadata>,
    ) -> Result<PuppetMapping> {
        let puppets = self.db.puppet_store();
        if let Some(puppet) = puppets.get_puppet(&event.user_id).await? {
            return Ok(puppet);
        }

        let localpart = puppet_localpart(&self.settings.puppet_prefix);
        let registered = self
            .target
            .register_identity(&localpart)
            .await
            .with_context(|| format!("failed to register puppet for user {}", event.user_id))?;
        info!(
            "registered puppet puppet_id={} user_id={}",
            registered.user_id, event.user_id
        );

        // stays due until the first profile sync succeeds
        let mut puppet = PuppetMapping {
            source_user_id: event.user_id.clone(),
            puppet_id: registered.user_id,
            auth_token: registered.access_token,
            last_metadata_sync: DateTime::<Utc>::UNIX_EPOCH,
            created_at: Utc::now(),
        };
        puppets.create_puppet(&puppet).await?;
        Metrics::puppet_provisioned();

        puppet.last_metadata_sync = self.refresh_puppet(gate, &puppet, event, metadata).await?;
        Ok(puppet)
    }

    /// Mirrors the author's nickname and avatar onto the puppet profile.
    ///
    /// Returns the sync time stamped on the puppet.
    pub async fn refresh_puppet(
        &self,
        _gate: &GateGuard,
        puppet: &PuppetMapping,
        event: &InboundEvent,
        metadata: Option<&dyn SourceMetadata>,
    ) -> Result<DateTime<Utc>> {
        let mut nickname = event.author_nickname.clone();
        let mut avatar = event.author_avatar.clone();

        if (nickname.is_none() || avatar.is_none())
            && let Some(metadata) = metadata
        {
            match metadata
                .get_user_metadata(&event.user_id, event.guild_id.as_deref())
                .await
            {
                Ok(found) => {
                    nickname = nickname.or(found.nickname);
                    avatar = avatar.or(found.avatar_url);
                }
                Err(err) => {
                    warn!(
                        "user metadata lookup failed user_id={}: {:#}",
                        event.user_id, err
                    );
                }
            }
        }

        let identity = puppet_identity(puppet);
        if let Some(url) = avatar.as_deref() {
            let (mxc, _) = self.upload_remote(url).await?;
            self.target.set_avatar_url(&identity, &mxc).await?;
        }

        let display_name = puppet_display_name(nickname.as_deref(), &event.user_id);
        self.target
            .set_display_name(&identity, &display_name)
            .await?;

        let synced_at = Utc::now();
        self.db
            .puppet_store()
            .touch_puppet_sync(&puppet.source_user_id, synced_at)
            .await?;
        Ok(synced_at)
    }

    /// Invites and joins the puppet into the room once per (channel, user).
    pub async fn ensure_membership(
        &self,
        _gate: &GateGuard,
        mapping: &ChannelMapping,
        source_user_id: &str,
        puppet: &PuppetMapping,
    ) -> Result<()> {
        let members = self.db.membership_store();
        if members
            .is_member(&mapping.source_channel_id, source_user_id)
            .await?
        {
            return Ok(());
        }

        match self.target.invite(&mapping.room_id, &puppet.puppet_id).await {
            Ok(()) => {}
            // joined by an earlier attempt whose membership record was lost
            Err(err) if is_already_joined(&err) => {
                debug!(
                    "puppet already in room puppet_id={} room_id={}",
                    puppet.puppet_id, mapping.room_id
                );
            }
            Err(err) => {
                return Err(err.context(format!(
                    "failed to invite {} to {}",
                    puppet.puppet_id, mapping.room_id
                )));
            }
        }
        self.target
            .join_room(&puppet_identity(puppet), &mapping.room_id)
            .await
            .with_context(|| format!("{} failed to join {}", puppet.puppet_id, mapping.room_id))?;

        members
            .add_member(&RoomMember {
                source_channel_id: mapping.source_channel_id.clone(),
                source_user_id: source_user_id.to_string(),
                joined_at: Utc::now(),
            })
            .await?;
        debug!(
            "puppet joined room puppet_id={} room_id={}",
            puppet.puppet_id, mapping.room_id
        );
        Ok(())
    }
}
