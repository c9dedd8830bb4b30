use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serenity::all::{
    ChannelId, Client as SerenityClient, Context as SerenityContext, CreateMessage,
    EventHandler as SerenityEventHandler, GatewayIntents, GuildId, Http,
    Message as SerenityMessage, Ready, UserId,
};
use tokio::sync::{Mutex as AsyncMutex, RwLock, oneshot};
use tracing::{debug, error, info};

use crate::bridge::BridgeCore;
use crate::config::DiscordConfig;
use crate::parsers::{DiscordAttachment, parse_discord_message, render_for_discord};
use crate::source::{
    ChannelMetadata, InboundEvent, MessageElement, SourceAdapter, SourceMetadata, UserMetadata,
};

const INITIAL_LOGIN_RETRY_SECONDS: u64 = 2;
const MAX_LOGIN_RETRY_SECONDS: u64 = 300;
const READY_TIMEOUT_SECONDS: u64 = 30;
const DISCORD_MESSAGE_LIMIT: usize = 2000;

/// Discord as a message source: gateway events in, REST sends out.
pub struct DiscordAdapter {
    adapter_id: String,
    token: SecretString,
    use_privileged_intents: bool,
    http: Arc<Http>,
    bridge: Arc<RwLock<Option<Arc<BridgeCore>>>>,
    login_state: AsyncMutex<DiscordLoginState>,
}

#[derive(Default)]
struct DiscordLoginState {
    is_logged_in: bool,
    gateway_task: Option<tokio::task::JoinHandle<()>>,
}

struct GatewayHandler {
    adapter_id: String,
    bridge: Arc<RwLock<Option<Arc<BridgeCore>>>>,
    ready_sender: AsyncMutex<Option<oneshot::Sender<()>>>,
}

#[serenity::async_trait]
impl SerenityEventHandler for GatewayHandler {
    async fn ready(&self, _ctx: SerenityContext, ready: Ready) {
        info!(
            "discord gateway ready as {} ({}) guilds={}",
            ready.user.name,
            ready.user.id,
            ready.guilds.len()
        );
        if let Some(sender) = self.ready_sender.lock().await.take() {
            let _ = sender.send(());
        }
    }

    async fn message(&self, _ctx: SerenityContext, msg: SerenityMessage) {
        if msg.author.bot {
            return;
        }

        let bridge = self.bridge.read().await.clone();
        let Some(bridge) = bridge else {
            debug!("ignoring discord message before bridge binding");
            return;
        };

        let event = inbound_event(&self.adapter_id, &msg);
        if event.elements.is_empty() {
            debug!(
                "ignoring discord message without content message_id={}",
                msg.id
            );
            return;
        }

        if let Err(err) = bridge.handle_event(&event).await {
            error!(
                "failed to handle discord message message_id={}: {:#}",
                msg.id, err
            );
        }
    }
}

fn inbound_event(adapter_id: &str, msg: &SerenityMessage) -> InboundEvent {
    let mentions: Vec<(String, String)> = msg
        .mentions
        .iter()
        .map(|user| {
            let name = user.global_name.clone().unwrap_or_else(|| user.name.clone());
            (user.id.to_string(), name)
        })
        .collect();
    let attachments: Vec<DiscordAttachment> = msg
        .attachments
        .iter()
        .map(|attachment| DiscordAttachment {
            url: attachment.url.clone(),
            filename: attachment.filename.clone(),
            content_type: attachment.content_type.clone(),
        })
        .collect();

    let nick = msg.member.as_ref().and_then(|member| member.nick.as_deref());
    InboundEvent {
        origin_bot_id: adapter_id.to_string(),
        channel_id: msg.channel_id.to_string(),
        guild_id: msg.guild_id.map(|id| id.to_string()),
        user_id: msg.author.id.to_string(),
        author_nickname: Some(display_nickname(
            nick,
            msg.author.global_name.as_deref(),
            &msg.author.name,
        )),
        author_avatar: msg.author.avatar_url(),
        elements: parse_discord_message(&msg.content, &mentions, &attachments),
    }
}

/// Guild nickname, then global display name, then username.
fn display_nickname(nick: Option<&str>, global_name: Option<&str>, username: &str) -> String {
    nick.filter(|value| !value.trim().is_empty())
        .or(global_name.filter(|value| !value.trim().is_empty()))
        .unwrap_or(username)
        .to_string()
}

fn parse_snowflake(value: &str, kind: &str) -> Result<u64> {
    match value.parse::<u64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(anyhow!("invalid discord {} id: {}", kind, value)),
    }
}

/// Splits a body into chunks Discord accepts, preferring line boundaries.
fn split_message(content: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in content.split_inclusive('\n') {
        if current.chars().count() + line.chars().count() > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.chars().count() > limit {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn next_retry_seconds(current: u64) -> u64 {
    (current * 2).min(MAX_LOGIN_RETRY_SECONDS)
}

impl DiscordAdapter {
    pub fn new(config: &DiscordConfig) -> Self {
        info!("initializing discord adapter id={}", config.adapter_id);
        let token = SecretString::from(config.bot_token.clone());
        Self {
            adapter_id: config.adapter_id.clone(),
            http: Arc::new(Http::new(token.expose_secret())),
            token,
            use_privileged_intents: config.use_privileged_intents,
            bridge: Arc::new(RwLock::new(None)),
            login_state: AsyncMutex::new(DiscordLoginState::default()),
        }
    }

    pub async fn set_bridge(&self, bridge: Arc<BridgeCore>) {
        *self.bridge.write().await = Some(bridge);
    }

    fn intents(&self) -> GatewayIntents {
        if self.use_privileged_intents {
            GatewayIntents::all()
        } else {
            GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT
        }
    }

    pub async fn login(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if state.is_logged_in {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = GatewayHandler {
            adapter_id: self.adapter_id.clone(),
            bridge: self.bridge.clone(),
            ready_sender: AsyncMutex::new(Some(ready_tx)),
        };

        let mut gateway_client =
            SerenityClient::builder(self.token.expose_secret(), self.intents())
                .event_handler(handler)
                .await
                .map_err(|err| anyhow!("failed to build discord gateway client: {err}"))?;

        let gateway_task = tokio::spawn(async move {
            if let Err(err) = gateway_client.start_autosharded().await {
                error!("discord gateway stopped: {err}");
            }
        });

        match tokio::time::timeout(Duration::from_secs(READY_TIMEOUT_SECONDS), ready_rx).await {
            Ok(Ok(())) => {
                state.is_logged_in = true;
                state.gateway_task = Some(gateway_task);
                info!("discord bot login succeeded and gateway is connected");
                Ok(())
            }
            Ok(Err(_)) => {
                gateway_task.abort();
                Err(anyhow!("discord gateway exited before receiving Ready event"))
            }
            Err(_) => {
                gateway_task.abort();
                Err(anyhow!("timed out waiting for discord Ready event"))
            }
        }
    }

    /// Logs in, retrying with exponential backoff until the gateway is ready.
    pub async fn start(&self) -> Result<()> {
        let mut retry_seconds = INITIAL_LOGIN_RETRY_SECONDS;

        loop {
            match self.login().await {
                Ok(()) => {
                    info!("discord adapter {} is ready", self.adapter_id);
                    return Ok(());
                }
                Err(err) => {
                    error!(
                        "failed to start discord adapter: {err}. retrying in {} seconds",
                        retry_seconds
                    );
                    tokio::time::sleep(Duration::from_secs(retry_seconds)).await;
                    retry_seconds = next_retry_seconds(retry_seconds);
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if !state.is_logged_in {
            return Ok(());
        }

        if let Some(gateway_task) = state.gateway_task.take() {
            gateway_task.abort();
            match gateway_task.await {
                Ok(()) => info!("discord gateway task exited"),
                Err(join_err) if join_err.is_cancelled() => info!("discord gateway task aborted"),
                Err(join_err) => error!("discord gateway task join error: {join_err}"),
            }
        }

        state.is_logged_in = false;
        info!("discord adapter stopped");
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for DiscordAdapter {
    fn id(&self) -> &str {
        &self.adapter_id
    }

    async fn send(
        &self,
        channel_id: &str,
        elements: &[MessageElement],
        _guild_id: Option<&str>,
    ) -> Result<String> {
        let channel = ChannelId::new(parse_snowflake(channel_id, "channel")?);
        let body = render_for_discord(elements);
        if body.trim().is_empty() {
            return Err(anyhow!("nothing to send to discord channel {}", channel_id));
        }

        let mut last_id = None;
        for chunk in split_message(&body, DISCORD_MESSAGE_LIMIT) {
            let message = channel
                .send_message(&*self.http, CreateMessage::new().content(chunk))
                .await
                .map_err(|e| anyhow!("failed to send to discord channel {}: {}", channel_id, e))?;
            last_id = Some(message.id.to_string());
        }

        let message_id = last_id.ok_or_else(|| anyhow!("discord returned no message id"))?;
        debug!(
            "discord send channel={} message_id={} len={}",
            channel_id,
            message_id,
            body.len()
        );
        Ok(message_id)
    }

    fn metadata(&self) -> Option<&dyn SourceMetadata> {
        Some(self)
    }
}

#[async_trait]
impl SourceMetadata for DiscordAdapter {
    async fn get_channel_metadata(
        &self,
        channel_id: &str,
        guild_id: Option<&str>,
    ) -> Result<ChannelMetadata> {
        let channel_num = ChannelId::new(parse_snowflake(channel_id, "channel")?);
        let channel = self
            .http
            .get_channel(channel_num)
            .await
            .map_err(|e| anyhow!("failed to fetch discord channel {}: {}", channel_id, e))?;
        let guild_channel = channel.guild();

        let guild_id = match guild_channel.as_ref().map(|c| c.guild_id) {
            Some(id) => Some(id),
            None => guild_id
                .map(|id| parse_snowflake(id, "guild").map(GuildId::new))
                .transpose()?,
        };
        let avatar_url = match guild_id {
            Some(guild_id) => self
                .http
                .get_guild(guild_id)
                .await
                .map_err(|e| anyhow!("failed to fetch discord guild {}: {}", guild_id, e))?
                .icon_url(),
            None => None,
        };

        Ok(ChannelMetadata {
            name: guild_channel.map(|c| c.name),
            avatar_url,
        })
    }

    async fn get_user_metadata(
        &self,
        user_id: &str,
        guild_id: Option<&str>,
    ) -> Result<UserMetadata> {
        let user = UserId::new(parse_snowflake(user_id, "user")?);

        if let Some(guild_id) = guild_id {
            let guild = GuildId::new(parse_snowflake(guild_id, "guild")?);
            match self.http.get_member(guild, user).await {
                Ok(member) => {
                    return Ok(UserMetadata {
                        nickname: Some(display_nickname(
                            member.nick.as_deref(),
                            member.user.global_name.as_deref(),
                            &member.user.name,
                        )),
                        avatar_url: member.avatar_url().or_else(|| member.user.avatar_url()),
                    });
                }
                Err(err) => {
                    debug!(
                        "discord member lookup failed guild={} user={}: {}",
                        guild_id, user_id, err
                    );
                }
            }
        }

        let found = self
            .http
            .get_user(user)
            .await
            .map_err(|e| anyhow!("failed to fetch discord user {}: {}", user_id, e))?;
        Ok(UserMetadata {
            nickname: Some(display_nickname(
                None,
                found.global_name.as_deref(),
                &found.name,
            )),
            avatar_url: found.avatar_url(),
        })
    }
}
