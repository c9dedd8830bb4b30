use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{ChannelMapping, DatabaseManager, PuppetMapping};
use crate::matrix::{MatrixEventHandler, TargetClient};
use crate::media::MediaFetcher;
use crate::parsers::MessageUtils;
use crate::parsers::matrix_parser::{build_file_content, build_image_content, build_text_content};
use crate::source::{InboundEvent, MessageElement, SourceMetadata, SourceRegistry};
use crate::web::metrics::Metrics;

pub mod gate;
pub mod logic;
pub mod provisioner;

use self::gate::{GateGuard, SerializationGate};
use self::logic::{EventDirection, classify_event, metadata_due};
use self::provisioner::{Provisioner, puppet_identity};

/// Provisioning settings resolved from the `portal` and `bridge` config sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalSettings {
    pub space: String,
    pub human_user: String,
    pub bot_user_id: String,
    pub puppet_prefix: String,
    pub update_interval_ms: u64,
    pub server_name: String,
}

impl PortalSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            space: config.portal.space.clone(),
            human_user: config.portal.user.clone(),
            bot_user_id: config.bot_user_id(),
            puppet_prefix: config.portal.puppet_prefix.clone(),
            update_interval_ms: config.portal.update_time,
            server_name: config.bridge.domain.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("bridge identity is offline: {0}")]
    Offline(String),
    #[error("homeserver identifies the bridge as {actual}, expected {expected}")]
    IdentityMismatch { expected: String, actual: String },
    #[error("bridge identity has not joined the parent space {0}")]
    SpaceNotJoined(String),
}

pub struct BridgeCore {
    settings: Arc<PortalSettings>,
    target: Arc<dyn TargetClient>,
    db: Arc<DatabaseManager>,
    sources: Arc<SourceRegistry>,
    gate: SerializationGate,
    provisioner: Provisioner,
}

impl BridgeCore {
    pub fn new(
        settings: PortalSettings,
        target: Arc<dyn TargetClient>,
        db: Arc<DatabaseManager>,
        sources: Arc<SourceRegistry>,
        media: Arc<dyn MediaFetcher>,
    ) -> Self {
        let settings = Arc::new(settings);
        Self {
            provisioner: Provisioner::new(settings.clone(), target.clone(), db.clone(), media),
            gate: SerializationGate::new(),
            settings,
            target,
            db,
            sources,
        }
    }

    /// Verifies the bridge identity is online and inside the parent space.
    pub async fn start(&self) -> Result<(), StartupError> {
        let actual = self
            .target
            .whoami()
            .await
            .map_err(|err| StartupError::Offline(format!("{err:#}")))?;
        if actual != self.settings.bot_user_id {
            return Err(StartupError::IdentityMismatch {
                expected: self.settings.bot_user_id.clone(),
                actual,
            });
        }

        let joined = self
            .provisioner
            .sync_joined_rooms()
            .await
            .map_err(|err| StartupError::Offline(format!("{err:#}")))?;
        if !self.provisioner.is_joined(&self.settings.space) {
            return Err(StartupError::SpaceNotJoined(self.settings.space.clone()));
        }

        info!(
            "bridge core started bot={} joined_rooms={} sources={:?}",
            self.settings.bot_user_id,
            joined,
            self.sources.ids()
        );
        Ok(())
    }

    pub fn settings(&self) -> &PortalSettings {
        &self.settings
    }

    pub fn db(&self) -> Arc<DatabaseManager> {
        self.db.clone()
    }

    pub fn sources(&self) -> Arc<SourceRegistry> {
        self.sources.clone()
    }

    pub fn provisioning_in_progress(&self) -> bool {
        self.gate.is_held()
    }

    /// Entry point for every inbound message, from either side.
    ///
    /// Failures are logged and returned to the caller.
    pub async fn handle_event(&self, event: &InboundEvent) -> Result<()> {
        match classify_event(event, &self.settings.bot_user_id) {
            EventDirection::FromTarget => {
                let result = self.forward_to_source(event).await;
                if let Err(err) = &result {
                    Metrics::target_failed();
                    error!(
                        "failed to forward room_id={} sender={} to source: {:#}",
                        event.channel_id, event.user_id, err
                    );
                }
                result
            }
            EventDirection::FromSource => {
                let result = self.relay_to_target(event).await;
                if let Err(err) = &result {
                    Metrics::source_failed();
                    error!(
                        "failed to relay channel_id={} user_id={} from {}: {:#}",
                        event.channel_id, event.user_id, event.origin_bot_id, err
                    );
                }
                result
            }
        }
    }

    async fn forward_to_source(&self, event: &InboundEvent) -> Result<()> {
        if event.user_id != self.settings.human_user {
            debug!(
                "matrix inbound dropped room_id={} sender={} reason=not_portal_user",
                event.channel_id, event.user_id
            );
            Metrics::event_ignored();
            return Ok(());
        }

        let Some(mapping) = self
            .db
            .channel_store()
            .get_room_mapping(&event.channel_id)
            .await?
        else {
            debug!(
                "matrix inbound dropped room_id={} reason=no_source_mapping",
                event.channel_id
            );
            Metrics::event_ignored();
            return Ok(());
        };

        let adapter = self
            .sources
            .get(&mapping.source_adapter_id)
            .ok_or_else(|| anyhow!("no source adapter registered as {}", mapping.source_adapter_id))?;

        let message_id = adapter
            .send(
                &mapping.source_channel_id,
                &event.elements,
                mapping.source_guild_id.as_deref(),
            )
            .await?;
        Metrics::target_relayed();
        debug!(
            "matrix->source relayed room_id={} adapter={} channel_id={} message_id={}",
            event.channel_id, mapping.source_adapter_id, mapping.source_channel_id, message_id
        );
        Ok(())
    }

    async fn relay_to_target(&self, event: &InboundEvent) -> Result<()> {
        if event.elements.is_empty() {
            debug!(
                "source inbound dropped channel_id={} reason=empty_message",
                event.channel_id
            );
            Metrics::event_ignored();
            return Ok(());
        }

        let adapter = self.sources.get(&event.origin_bot_id);
        let metadata = adapter.as_deref().and_then(|adapter| adapter.metadata());

        self.gate.barrier().await;
        let (mapping, puppet) = match self.provisioned_route(event).await? {
            Some(route) => route,
            None => {
                let guard = self.gate.acquire().await;
                let provisioned = self.provision(&guard, event, metadata).await;
                guard.release();
                provisioned?
            }
        };

        let identity = puppet_identity(&puppet);
        for content in self.outgoing_contents(&event.elements).await {
            self.target
                .send_message(&identity, &mapping.room_id, &content)
                .await?;
        }
        Metrics::source_relayed();
        debug!(
            "source->matrix relayed channel_id={} room_id={} puppet={} preview={}",
            event.channel_id,
            mapping.room_id,
            puppet.puppet_id,
            MessageUtils::preview_text(&MessageUtils::render_plain(&event.elements))
        );
        Ok(())
    }

    /// Mapping and puppet of an event that needs no provisioning work.
    async fn provisioned_route(
        &self,
        event: &InboundEvent,
    ) -> Result<Option<(ChannelMapping, PuppetMapping)>> {
        let Some(mapping) = self
            .db
            .channel_store()
            .get_channel_mapping(&event.channel_id)
            .await?
        else {
            return Ok(None);
        };
        let Some(puppet) = self.db.puppet_store().get_puppet(&event.user_id).await? else {
            return Ok(None);
        };
        if !self
            .db
            .membership_store()
            .is_member(&event.channel_id, &event.user_id)
            .await?
        {
            return Ok(None);
        }

        let now = Utc::now();
        let interval = self.settings.update_interval_ms;
        if metadata_due(mapping.last_metadata_sync, now, interval)
            || metadata_due(puppet.last_metadata_sync, now, interval)
        {
            return Ok(None);
        }

        Ok(Some((mapping, puppet)))
    }

    async fn provision(
        &self,
        gate: &GateGuard,
        event: &InboundEvent,
        metadata: Option<&dyn SourceMetadata>,
    ) -> Result<(ChannelMapping, PuppetMapping)> {
        let mapping = self.provisioner.ensure_room(gate, event, metadata).await?;
        let puppet = self.provisioner.ensure_puppet(gate, event, metadata).await?;
        self.provisioner
            .ensure_membership(gate, &mapping, &event.user_id, &puppet)
            .await?;

        let now = Utc::now();
        let interval = self.settings.update_interval_ms;
        if metadata_due(mapping.last_metadata_sync, now, interval) {
            self.provisioner
                .refresh_room(gate, &mapping, event, metadata)
                .await?;
        }
        if metadata_due(puppet.last_metadata_sync, now, interval) {
            self.provisioner
                .refresh_puppet(gate, &puppet, event, metadata)
                .await?;
        }

        Ok((mapping, puppet))
    }

    /// Text goes out as one message, each media element as its own event.
    ///
    /// Media that cannot be re-uploaded degrade to a link.
    async fn outgoing_contents(&self, elements: &[MessageElement]) -> Vec<Value> {
        let mut contents: Vec<Value> = build_text_content(elements).into_iter().collect();

        for element in elements {
            let uploaded = match element {
                MessageElement::Image { url } => (
                    url,
                    self.provisioner
                        .upload_image(url)
                        .await
                        .map(|(mxc, media, info)| build_image_content(&mxc, &media.filename, &info)),
                ),
                MessageElement::File { url, name } => (
                    url,
                    self.provisioner.upload_remote(url).await.map(|(mxc, media)| {
                        let name = name.clone().unwrap_or(media.filename);
                        build_file_content(&mxc, &name, &media.content_type, media.size)
                    }),
                ),
                MessageElement::Text { .. } | MessageElement::Mention { .. } => continue,
            };

            match uploaded {
                (_, Ok(content)) => contents.push(content),
                (url, Err(err)) => {
                    warn!("failed to re-upload media {}: {:#}", url, err);
                    contents.extend(build_text_content(&[MessageElement::text(url.clone())]));
                }
            }
        }

        contents
    }
}

#[async_trait]
impl MatrixEventHandler for BridgeCore {
    async fn handle_room_message(&self, event: InboundEvent) -> Result<()> {
        self.handle_event(&event).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use chrono::Utc;
    use image::{ImageFormat, RgbImage};
    use parking_lot::Mutex;
    use serde_json::Value;
    use tempfile::NamedTempFile;

    use super::{BridgeCore, PortalSettings, StartupError};
    use crate::db::DatabaseManager;
    use crate::db::manager::tests::sqlite_manager;
    use crate::matrix::{
        CreateRoomRequest, Identity, MatrixApiError, RegisteredIdentity, StateEvent, TargetClient,
    };
    use crate::media::{MediaFetcher, MediaInfo};
    use crate::source::{
        ChannelMetadata, InboundEvent, MessageElement, SourceAdapter, SourceMetadata,
        SourceRegistry, UserMetadata,
    };

    const BOT: &str = "@_port_bot:example.org";
    const HUMAN: &str = "@alice:example.org";
    const SPACE: &str = "!space:example.org";

    #[derive(Default)]
    struct FakeTarget {
        whoami: Mutex<Option<String>>,
        fail_create: AtomicBool,
        fail_display_name_once: AtomicBool,
        fail_send_once: AtomicBool,
        room_counter: AtomicUsize,
        created: Mutex<Vec<CreateRoomRequest>>,
        registered: Mutex<Vec<String>>,
        state: Mutex<Vec<(String, String, String, Value)>>,
        state_reads: AtomicUsize,
        uploads: AtomicUsize,
        invites: Mutex<Vec<(String, String)>>,
        joins: Mutex<Vec<(String, String)>>,
        display_names: Mutex<Vec<(String, String)>>,
        avatars: Mutex<Vec<(String, String)>>,
        joined_rooms: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, String, Value)>>,
    }

    impl FakeTarget {
        fn new() -> Self {
            let target = Self::default();
            target.joined_rooms.lock().push(SPACE.to_string());
            target
        }

        fn state_of(&self, room_id: &str, event_type: &str) -> Vec<(String, Value)> {
            self.state
                .lock()
                .iter()
                .filter(|(room, kind, _, _)| room == room_id && kind == event_type)
                .map(|(_, _, key, content)| (key.clone(), content.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl TargetClient for FakeTarget {
        async fn whoami(&self) -> Result<String> {
            Ok(self.whoami.lock().clone().unwrap_or_else(|| BOT.to_string()))
        }

        async fn create_room(&self, request: &CreateRoomRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(anyhow!("M_UNKNOWN: homeserver unavailable"));
            }
            self.created.lock().push(request.clone());
            let n = self.room_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let room_id = format!("!room{n}:example.org");
            self.joined_rooms.lock().push(room_id.clone());
            Ok(room_id)
        }

        async fn get_room_state(&self, _room_id: &str) -> Result<Vec<StateEvent>> {
            self.state_reads.fetch_add(1, Ordering::SeqCst);
            let name = self
                .created
                .lock()
                .first()
                .map(|request| request.name.clone())
                .unwrap_or_default();
            Ok(vec![StateEvent {
                event_type: "m.room.name".to_string(),
                state_key: String::new(),
                content: serde_json::json!({ "name": name }),
            }])
        }

        async fn set_room_state(
            &self,
            room_id: &str,
            event_type: &str,
            state_key: &str,
            content: &Value,
        ) -> Result<String> {
            self.state.lock().push((
                room_id.to_string(),
                event_type.to_string(),
                state_key.to_string(),
                content.clone(),
            ));
            Ok(format!("$state{}", self.state.lock().len()))
        }

        async fn upload_media(
            &self,
            _data: Vec<u8>,
            _content_type: &str,
            filename: &str,
        ) -> Result<String> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(format!("mxc://example.org/{filename}"))
        }

        async fn register_identity(&self, localpart: &str) -> Result<RegisteredIdentity> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.registered.lock().push(localpart.to_string());
            Ok(RegisteredIdentity {
                user_id: format!("@{localpart}:example.org"),
                access_token: format!("token-{localpart}"),
            })
        }

        async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
            let joined = self
                .joins
                .lock()
                .iter()
                .any(|(member, room)| member == user_id && room == room_id);
            if joined {
                return Err(MatrixApiError {
                    status: 403,
                    errcode: "M_FORBIDDEN".to_string(),
                    error: format!("{user_id} is already in the room."),
                }
                .into());
            }
            self.invites
                .lock()
                .push((room_id.to_string(), user_id.to_string()));
            Ok(())
        }

        async fn join_room(&self, identity: &Identity, room_id: &str) -> Result<()> {
            self.joins
                .lock()
                .push((identity.user_id.clone(), room_id.to_string()));
            Ok(())
        }

        async fn set_display_name(&self, identity: &Identity, display_name: &str) -> Result<()> {
            if self.fail_display_name_once.swap(false, Ordering::SeqCst) {
                return Err(anyhow!("M_UNKNOWN: profile update failed"));
            }
            self.display_names
                .lock()
                .push((identity.user_id.clone(), display_name.to_string()));
            Ok(())
        }

        async fn set_avatar_url(&self, identity: &Identity, avatar_url: &str) -> Result<()> {
            self.avatars
                .lock()
                .push((identity.user_id.clone(), avatar_url.to_string()));
            Ok(())
        }

        async fn list_joined_rooms(&self) -> Result<Vec<String>> {
            Ok(self.joined_rooms.lock().clone())
        }

        async fn send_message(
            &self,
            identity: &Identity,
            room_id: &str,
            content: &Value,
        ) -> Result<String> {
            if self.fail_send_once.swap(false, Ordering::SeqCst) {
                return Err(anyhow!("M_UNKNOWN: send failed"));
            }
            let mut sent = self.sent.lock();
            sent.push((identity.user_id.clone(), room_id.to_string(), content.clone()));
            Ok(format!("$event{}", sent.len()))
        }
    }

    #[derive(Default)]
    struct FakeSource {
        channel_names: HashMap<String, String>,
        channel_avatars: HashMap<String, String>,
        user_names: HashMap<String, String>,
        sent: Mutex<Vec<(String, Vec<MessageElement>, Option<String>)>>,
    }

    #[async_trait]
    impl SourceMetadata for FakeSource {
        async fn get_channel_metadata(
            &self,
            channel_id: &str,
            _guild_id: Option<&str>,
        ) -> Result<ChannelMetadata> {
            Ok(ChannelMetadata {
                name: self.channel_names.get(channel_id).cloned(),
                avatar_url: self.channel_avatars.get(channel_id).cloned(),
            })
        }

        async fn get_user_metadata(
            &self,
            user_id: &str,
            _guild_id: Option<&str>,
        ) -> Result<UserMetadata> {
            Ok(UserMetadata {
                nickname: self.user_names.get(user_id).cloned(),
                avatar_url: None,
            })
        }
    }

    #[async_trait]
    impl SourceAdapter for FakeSource {
        fn id(&self) -> &str {
            "discord"
        }

        async fn send(
            &self,
            channel_id: &str,
            elements: &[MessageElement],
            guild_id: Option<&str>,
        ) -> Result<String> {
            let mut sent = self.sent.lock();
            sent.push((
                channel_id.to_string(),
                elements.to_vec(),
                guild_id.map(ToOwned::to_owned),
            ));
            Ok(format!("msg{}", sent.len()))
        }

        fn metadata(&self) -> Option<&dyn SourceMetadata> {
            Some(self)
        }
    }

    struct FakeMedia;

    #[async_trait]
    impl MediaFetcher for FakeMedia {
        async fn fetch(&self, url: &str) -> Result<MediaInfo> {
            let mut data = Vec::new();
            RgbImage::new(4, 3)
                .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
                .expect("encode png");
            Ok(MediaInfo {
                size: data.len(),
                data,
                content_type: "image/png".to_string(),
                filename: url.rsplit('/').next().unwrap_or("avatar").to_string(),
            })
        }
    }

    struct Harness {
        _file: NamedTempFile,
        db: Arc<DatabaseManager>,
        target: Arc<FakeTarget>,
        source: Arc<FakeSource>,
        bridge: Arc<BridgeCore>,
    }

    fn settings() -> PortalSettings {
        PortalSettings {
            space: SPACE.to_string(),
            human_user: HUMAN.to_string(),
            bot_user_id: BOT.to_string(),
            puppet_prefix: "_port_".to_string(),
            update_interval_ms: 86_400_000,
            server_name: "example.org".to_string(),
        }
    }

    async fn harness_with(source: FakeSource) -> Harness {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = Arc::new(sqlite_manager(&file).await);
        let target = Arc::new(FakeTarget::new());
        let source = Arc::new(source);
        let registry = Arc::new(SourceRegistry::new());
        registry.register(source.clone());

        let bridge = Arc::new(BridgeCore::new(
            settings(),
            target.clone(),
            db.clone(),
            registry,
            Arc::new(FakeMedia),
        ));

        Harness {
            _file: file,
            db,
            target,
            source,
            bridge,
        }
    }

    async fn harness() -> Harness {
        harness_with(FakeSource::default()).await
    }

    fn source_event(channel_id: &str, user_id: &str, text: &str) -> InboundEvent {
        InboundEvent {
            origin_bot_id: "discord".to_string(),
            channel_id: channel_id.to_string(),
            guild_id: Some("G1".to_string()),
            user_id: user_id.to_string(),
            author_nickname: None,
            author_avatar: None,
            elements: vec![MessageElement::text(text)],
        }
    }

    fn target_event(room_id: &str, sender: &str, text: &str) -> InboundEvent {
        InboundEvent {
            origin_bot_id: BOT.to_string(),
            channel_id: room_id.to_string(),
            guild_id: None,
            user_id: sender.to_string(),
            author_nickname: None,
            author_avatar: None,
            elements: vec![MessageElement::text(text)],
        }
    }

    #[tokio::test]
    async fn ensure_room_is_idempotent() {
        let h = harness().await;
        let event = source_event("C1", "U1", "hi");

        let guard = h.bridge.gate.acquire().await;
        let first = h
            .bridge
            .provisioner
            .ensure_room(&guard, &event, None)
            .await
            .expect("first ensure");
        let second = h
            .bridge
            .provisioner
            .ensure_room(&guard, &event, None)
            .await
            .expect("second ensure");
        guard.release();

        assert_eq!(first.room_id, second.room_id);
        assert_eq!(h.target.created.lock().len(), 1);
        assert_eq!(h.target.created.lock()[0].name, "C1 (C1)");

        let children = h.target.state_of(SPACE, "m.space.child");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, first.room_id);
        assert_eq!(h.target.state_of(&first.room_id, "m.space.parent").len(), 1);
        assert!(h.bridge.provisioner.is_joined(&first.room_id));

        let reverse = h
            .db
            .channel_store()
            .get_room_mapping(&first.room_id)
            .await
            .expect("query")
            .expect("reverse mapping");
        assert_eq!(reverse.source_adapter_id, "discord");
        assert_eq!(reverse.source_guild_id.as_deref(), Some("G1"));
    }

    #[tokio::test]
    async fn ensure_puppet_is_idempotent() {
        let h = harness().await;
        let event = source_event("C1", "U1", "hi");

        let guard = h.bridge.gate.acquire().await;
        let first = h
            .bridge
            .provisioner
            .ensure_puppet(&guard, &event, None)
            .await
            .expect("first ensure");
        let second = h
            .bridge
            .provisioner
            .ensure_puppet(&guard, &event, None)
            .await
            .expect("second ensure");
        guard.release();

        assert_eq!(first.puppet_id, second.puppet_id);
        assert_eq!(first.auth_token, second.auth_token);
        assert_eq!(h.target.registered.lock().len(), 1);
        assert!(first.puppet_id.starts_with("@_port_"));
        assert_eq!(h.target.display_names.lock().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_messages_provision_once() {
        let h = harness().await;
        let first = source_event("C1", "U1", "one");
        let second = source_event("C1", "U1", "two");

        let (a, b) = tokio::join!(
            h.bridge.handle_event(&first),
            h.bridge.handle_event(&second)
        );
        a.expect("first relay");
        b.expect("second relay");

        assert_eq!(h.target.created.lock().len(), 1);
        assert_eq!(h.target.registered.lock().len(), 1);
        assert_eq!(h.target.invites.lock().len(), 1);
        assert_eq!(h.target.joins.lock().len(), 1);
        assert_eq!(h.target.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn membership_is_established_once_per_user() {
        let h = harness().await;

        for text in ["a", "b", "c"] {
            h.bridge
                .handle_event(&source_event("C1", "U1", text))
                .await
                .expect("relay");
        }
        assert_eq!(h.target.invites.lock().len(), 1);
        assert_eq!(h.target.joins.lock().len(), 1);

        h.bridge
            .handle_event(&source_event("C1", "U2", "hello"))
            .await
            .expect("relay");
        assert_eq!(h.target.invites.lock().len(), 2);
        assert_eq!(h.target.created.lock().len(), 1);

        let members = h
            .db
            .membership_store()
            .list_members("C1")
            .await
            .expect("members");
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn retried_send_does_not_repeat_membership() {
        let h = harness().await;
        h.target.fail_send_once.store(true, Ordering::SeqCst);
        let event = source_event("C1", "U1", "hi");

        assert!(h.bridge.handle_event(&event).await.is_err());
        assert!(
            h.db.membership_store()
                .is_member("C1", "U1")
                .await
                .expect("query")
        );

        h.bridge.handle_event(&event).await.expect("retry");

        assert_eq!(h.target.invites.lock().len(), 1);
        assert_eq!(h.target.joins.lock().len(), 1);
        assert_eq!(h.target.sent.lock().len(), 1);
        assert_eq!(h.target.registered.lock().len(), 1);
    }

    #[tokio::test]
    async fn membership_tolerates_puppet_already_in_room() {
        let h = harness().await;
        let event = source_event("C1", "U1", "hi");

        let guard = h.bridge.gate.acquire().await;
        let mapping = h
            .bridge
            .provisioner
            .ensure_room(&guard, &event, None)
            .await
            .expect("room");
        let puppet = h
            .bridge
            .provisioner
            .ensure_puppet(&guard, &event, None)
            .await
            .expect("puppet");
        // joined earlier, but the membership record was never written
        h.target
            .joins
            .lock()
            .push((puppet.puppet_id.clone(), mapping.room_id.clone()));

        h.bridge
            .provisioner
            .ensure_membership(&guard, &mapping, "U1", &puppet)
            .await
            .expect("membership");
        guard.release();

        assert!(h.target.invites.lock().is_empty());
        assert!(
            h.db.membership_store()
                .is_member("C1", "U1")
                .await
                .expect("query")
        );

        h.bridge.handle_event(&event).await.expect("relay");
        assert_eq!(h.target.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_first_profile_sync_is_retried() {
        let h = harness().await;
        h.target.fail_display_name_once.store(true, Ordering::SeqCst);
        let mut event = source_event("C1", "U1", "hi");
        event.author_nickname = Some("Alice".to_string());

        assert!(h.bridge.handle_event(&event).await.is_err());
        assert!(h.target.display_names.lock().is_empty());

        h.bridge.handle_event(&event).await.expect("second relay");

        let puppet = h
            .db
            .puppet_store()
            .get_puppet("U1")
            .await
            .expect("query")
            .expect("puppet");
        assert_eq!(h.target.registered.lock().len(), 1);
        assert_eq!(
            *h.target.display_names.lock(),
            vec![(puppet.puppet_id.clone(), "Alice (U1)".to_string())]
        );
        assert!(puppet.last_metadata_sync > Utc::now() - chrono::Duration::minutes(1));

        h.bridge.handle_event(&event).await.expect("third relay");
        assert_eq!(h.target.display_names.lock().len(), 1);
        assert_eq!(h.target.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn general_alice_scenario() {
        let mut source = FakeSource::default();
        source
            .channel_names
            .insert("general".to_string(), "general".to_string());
        let h = harness_with(source).await;

        let mut event = source_event("general", "U1", "hello");
        event.author_nickname = Some("Alice".to_string());
        h.bridge.handle_event(&event).await.expect("relay");

        let created = h.target.created.lock().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "general (general)");
        assert_eq!(created[0].invite, vec![HUMAN.to_string()]);

        let puppet = h
            .db
            .puppet_store()
            .get_puppet("U1")
            .await
            .expect("query")
            .expect("puppet");
        assert_eq!(
            *h.target.display_names.lock(),
            vec![(puppet.puppet_id.clone(), "Alice (U1)".to_string())]
        );
        assert!(h.target.avatars.lock().is_empty());

        let room_id = "!room1:example.org".to_string();
        assert_eq!(
            *h.target.invites.lock(),
            vec![(room_id.clone(), puppet.puppet_id.clone())]
        );
        assert_eq!(
            *h.target.joins.lock(),
            vec![(puppet.puppet_id.clone(), room_id.clone())]
        );

        let sent = h.target.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, puppet.puppet_id);
        assert_eq!(sent[0].1, room_id);
        assert_eq!(sent[0].2["body"], "hello");
    }

    #[tokio::test]
    async fn nickname_falls_back_to_adapter_lookup() {
        let mut source = FakeSource::default();
        source
            .user_names
            .insert("U7".to_string(), "Bob".to_string());
        let h = harness_with(source).await;

        h.bridge
            .handle_event(&source_event("C1", "U7", "yo"))
            .await
            .expect("relay");

        let names = h.target.display_names.lock();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].1, "Bob (U7)");
    }

    #[tokio::test]
    async fn channel_avatar_is_uploaded_with_dimensions() {
        let mut source = FakeSource::default();
        source.channel_avatars.insert(
            "C1".to_string(),
            "https://cdn.discordapp.com/icons/G1/icon.png".to_string(),
        );
        let h = harness_with(source).await;

        h.bridge
            .handle_event(&source_event("C1", "U1", "hi"))
            .await
            .expect("relay");

        let avatars = h.target.state_of("!room1:example.org", "m.room.avatar");
        assert_eq!(avatars.len(), 1);
        let content = &avatars[0].1;
        assert_eq!(content["url"], "mxc://example.org/icon.png");
        assert_eq!(content["info"]["w"], 4);
        assert_eq!(content["info"]["h"], 3);
        assert_eq!(content["info"]["mimetype"], "image/png");
    }

    #[tokio::test]
    async fn human_messages_are_forwarded_to_the_original_channel() {
        let h = harness().await;
        h.bridge
            .handle_event(&source_event("C1", "U1", "hi"))
            .await
            .expect("relay");
        assert_eq!(h.target.created.lock().len(), 1);

        h.bridge
            .handle_event(&target_event("!room1:example.org", HUMAN, "reply"))
            .await
            .expect("forward");

        let sent = h.source.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "C1");
        assert_eq!(sent[0].1, vec![MessageElement::text("reply")]);
        assert_eq!(sent[0].2.as_deref(), Some("G1"));
        assert_eq!(h.target.created.lock().len(), 1);
    }

    #[tokio::test]
    async fn unmapped_or_foreign_target_messages_are_ignored() {
        let h = harness().await;
        h.bridge
            .handle_event(&target_event("!unknown:example.org", HUMAN, "hi"))
            .await
            .expect("ignored");

        h.bridge
            .handle_event(&source_event("C1", "U1", "hi"))
            .await
            .expect("relay");
        let puppet = h
            .db
            .puppet_store()
            .get_puppet("U1")
            .await
            .expect("query")
            .expect("puppet");
        h.bridge
            .handle_event(&target_event("!room1:example.org", &puppet.puppet_id, "echo"))
            .await
            .expect("ignored");

        assert!(h.source.sent.lock().is_empty());
        assert_eq!(h.target.created.lock().len(), 1);
        assert_eq!(h.target.registered.lock().len(), 1);
    }

    #[tokio::test]
    async fn missing_source_adapter_is_a_relay_failure() {
        let h = harness().await;
        let now = Utc::now();
        h.db.channel_store()
            .create_room_link(
                &crate::db::ChannelMapping {
                    source_channel_id: "S1".to_string(),
                    room_id: "!slack:example.org".to_string(),
                    last_metadata_sync: now,
                    created_at: now,
                },
                &crate::db::RoomMapping {
                    room_id: "!slack:example.org".to_string(),
                    source_adapter_id: "slack".to_string(),
                    source_channel_id: "S1".to_string(),
                    source_guild_id: None,
                    created_at: now,
                },
            )
            .await
            .expect("link");

        let result = h
            .bridge
            .handle_event(&target_event("!slack:example.org", HUMAN, "hi"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn metadata_refresh_is_throttled() {
        let h = harness().await;
        h.bridge
            .handle_event(&source_event("C1", "U1", "first"))
            .await
            .expect("relay");
        h.bridge
            .handle_event(&source_event("C1", "U1", "second"))
            .await
            .expect("relay");

        assert_eq!(h.target.state_reads.load(Ordering::SeqCst), 0);
        assert_eq!(h.target.display_names.lock().len(), 1);

        let stale = Utc::now() - chrono::Duration::days(2);
        h.db.channel_store()
            .touch_channel_sync("C1", stale)
            .await
            .expect("touch channel");
        h.db.puppet_store()
            .touch_puppet_sync("U1", stale)
            .await
            .expect("touch puppet");

        h.bridge
            .handle_event(&source_event("C1", "U1", "third"))
            .await
            .expect("relay");

        assert_eq!(h.target.state_reads.load(Ordering::SeqCst), 1);
        // the name did not change, so no rename is written
        assert!(h.target.state_of("!room1:example.org", "m.room.name").is_empty());
        assert_eq!(h.target.display_names.lock().len(), 2);

        let channel = h
            .db
            .channel_store()
            .get_channel_mapping("C1")
            .await
            .expect("query")
            .expect("mapping");
        assert!(channel.last_metadata_sync > stale + chrono::Duration::days(1));
        let puppet = h
            .db
            .puppet_store()
            .get_puppet("U1")
            .await
            .expect("query")
            .expect("puppet");
        assert!(puppet.last_metadata_sync > stale + chrono::Duration::days(1));
        assert_eq!(h.target.sent.lock().len(), 3);
    }

    #[tokio::test]
    async fn room_creation_failure_leaves_no_mapping() {
        let h = harness().await;
        h.target.fail_create.store(true, Ordering::SeqCst);

        let result = h.bridge.handle_event(&source_event("C1", "U1", "hi")).await;
        assert!(result.is_err());
        assert!(!h.bridge.provisioning_in_progress());
        assert!(
            h.db.channel_store()
                .get_channel_mapping("C1")
                .await
                .expect("query")
                .is_none()
        );
        assert!(h.target.sent.lock().is_empty());

        h.target.fail_create.store(false, Ordering::SeqCst);
        h.bridge
            .handle_event(&source_event("C1", "U1", "retry"))
            .await
            .expect("relay after recovery");
        assert_eq!(h.target.created.lock().len(), 1);
    }

    #[tokio::test]
    async fn startup_requires_identity_and_space() {
        let h = harness().await;
        h.bridge.start().await.expect("startup");

        h.target.joined_rooms.lock().retain(|room| room != SPACE);
        assert!(matches!(
            h.bridge.start().await,
            Err(StartupError::SpaceNotJoined(space)) if space == SPACE
        ));

        *h.target.whoami.lock() = Some("@someone:example.org".to_string());
        assert!(matches!(
            h.bridge.start().await,
            Err(StartupError::IdentityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn image_elements_are_reuploaded() {
        let h = harness().await;
        let mut event = source_event("C1", "U1", "look");
        event.elements.push(MessageElement::Image {
            url: "https://cdn.discordapp.com/attachments/1/cat.png".to_string(),
        });

        h.bridge.handle_event(&event).await.expect("relay");

        let sent = h.target.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].2["msgtype"], "m.text");
        assert_eq!(sent[1].2["msgtype"], "m.image");
        assert_eq!(sent[1].2["url"], "mxc://example.org/cat.png");
        assert_eq!(sent[1].2["info"]["w"], 4);
    }
}
