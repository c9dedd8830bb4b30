use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::{CreateRoomRequest, Identity, RegisteredIdentity, StateEvent, TargetClient};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("matrix request failed with status {status}: {errcode} {error}")]
pub struct MatrixApiError {
    pub status: u16,
    pub errcode: String,
    pub error: String,
}

impl MatrixApiError {
    fn from_body(status: u16, body: &Value, raw: &str) -> Self {
        Self {
            status,
            errcode: body
                .get("errcode")
                .and_then(Value::as_str)
                .unwrap_or("M_UNKNOWN")
                .to_string(),
            error: body
                .get("error")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| raw.chars().take(200).collect()),
        }
    }
}

enum Actor<'a> {
    /// The bridge bot, asserted with `user_id` on the appservice token.
    Bot,
    /// The appservice itself, without identity assertion.
    Appservice,
    Identity(&'a Identity),
}

/// Client-server API client authenticated as an application service.
pub struct MatrixClient {
    http: Client,
    homeserver_url: Url,
    as_token: SecretString,
    bot_user_id: String,
}

impl MatrixClient {
    pub fn new(homeserver_url: &str, as_token: &str, bot_user_id: &str) -> Result<Self> {
        let homeserver_url = Url::parse(homeserver_url)
            .with_context(|| format!("invalid homeserver url {homeserver_url}"))?;

        Ok(Self {
            http: Client::new(),
            homeserver_url,
            as_token: SecretString::from(as_token.to_string()),
            bot_user_id: bot_user_id.to_string(),
        })
    }

    fn endpoint(&self, segments: &[&str], actor: &Actor<'_>, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.homeserver_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("homeserver url cannot be a base: {}", self.homeserver_url))?
            .pop_if_empty()
            .extend(segments);

        let assert_bot = matches!(actor, Actor::Bot);
        if !query.is_empty() || assert_bot {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            if assert_bot {
                pairs.append_pair("user_id", &self.bot_user_id);
            }
        }

        Ok(url)
    }

    fn token<'a>(&'a self, actor: &Actor<'a>) -> &'a str {
        match actor {
            Actor::Bot | Actor::Appservice => self.as_token.expose_secret(),
            Actor::Identity(identity) => &identity.access_token,
        }
    }

    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        actor: Actor<'_>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = self.endpoint(segments, &actor, &[])?;
        debug!("matrix request method={} path={}", method, url.path());

        let mut request = self
            .http
            .request(method, url.clone())
            .bearer_auth(self.token(&actor));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("matrix request to {} failed", url.path()))?;
        Self::read_response(response).await
    }

    async fn read_response(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let raw = response
            .text()
            .await
            .context("failed to read matrix response body")?;
        let body: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(MatrixApiError::from_body(status.as_u16(), &body, &raw).into());
        }

        Ok(body)
    }

    fn string_field(body: &Value, field: &str) -> Result<String> {
        body.get(field)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| anyhow!("matrix response is missing {field}"))
    }
}

#[async_trait]
impl TargetClient for MatrixClient {
    async fn whoami(&self) -> Result<String> {
        let body = self
            .call(
                Method::GET,
                &["_matrix", "client", "v3", "account", "whoami"],
                Actor::Bot,
                None,
            )
            .await?;
        Self::string_field(&body, "user_id")
    }

    async fn create_room(&self, request: &CreateRoomRequest) -> Result<String> {
        let body = serde_json::to_value(request)?;
        let response = self
            .call(
                Method::POST,
                &["_matrix", "client", "v3", "createRoom"],
                Actor::Bot,
                Some(&body),
            )
            .await?;
        Self::string_field(&response, "room_id")
    }

    async fn get_room_state(&self, room_id: &str) -> Result<Vec<StateEvent>> {
        let body = self
            .call(
                Method::GET,
                &["_matrix", "client", "v3", "rooms", room_id, "state"],
                Actor::Bot,
                None,
            )
            .await?;
        serde_json::from_value(body).context("failed to decode room state")
    }

    async fn set_room_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String> {
        let response = self
            .call(
                Method::PUT,
                &[
                    "_matrix", "client", "v3", "rooms", room_id, "state", event_type, state_key,
                ],
                Actor::Bot,
                Some(content),
            )
            .await?;
        Self::string_field(&response, "event_id")
    }

    async fn upload_media(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String> {
        let url = self.endpoint(
            &["_matrix", "media", "v3", "upload"],
            &Actor::Bot,
            &[("filename", filename)],
        )?;
        debug!(
            "matrix upload filename={} content_type={} size={}",
            filename,
            content_type,
            data.len()
        );

        let response = self
            .http
            .post(url)
            .bearer_auth(self.as_token.expose_secret())
            .header(CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .context("matrix media upload failed")?;
        let body = Self::read_response(response).await?;
        Self::string_field(&body, "content_uri")
    }

    async fn register_identity(&self, localpart: &str) -> Result<RegisteredIdentity> {
        let body = json!({
            "type": "m.login.application_service",
            "username": localpart,
        });
        let response = self
            .call(
                Method::POST,
                &["_matrix", "client", "v3", "register"],
                Actor::Appservice,
                Some(&body),
            )
            .await?;
        serde_json::from_value(response).context("failed to decode registration response")
    }

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.call(
            Method::POST,
            &["_matrix", "client", "v3", "rooms", room_id, "invite"],
            Actor::Bot,
            Some(&json!({ "user_id": user_id })),
        )
        .await?;
        Ok(())
    }

    async fn join_room(&self, identity: &Identity, room_id: &str) -> Result<()> {
        self.call(
            Method::POST,
            &["_matrix", "client", "v3", "join", room_id],
            Actor::Identity(identity),
            Some(&json!({})),
        )
        .await?;
        Ok(())
    }

    async fn set_display_name(&self, identity: &Identity, display_name: &str) -> Result<()> {
        self.call(
            Method::PUT,
            &[
                "_matrix",
                "client",
                "v3",
                "profile",
                &identity.user_id,
                "displayname",
            ],
            Actor::Identity(identity),
            Some(&json!({ "displayname": display_name })),
        )
        .await?;
        Ok(())
    }

    async fn set_avatar_url(&self, identity: &Identity, avatar_url: &str) -> Result<()> {
        self.call(
            Method::PUT,
            &[
                "_matrix",
                "client",
                "v3",
                "profile",
                &identity.user_id,
                "avatar_url",
            ],
            Actor::Identity(identity),
            Some(&json!({ "avatar_url": avatar_url })),
        )
        .await?;
        Ok(())
    }

    async fn list_joined_rooms(&self) -> Result<Vec<String>> {
        let body = self
            .call(
                Method::GET,
                &["_matrix", "client", "v3", "joined_rooms"],
                Actor::Bot,
                None,
            )
            .await?;
        let rooms = body
            .get("joined_rooms")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("matrix response is missing joined_rooms"))?;
        Ok(rooms
            .iter()
            .filter_map(Value::as_str)
            .map(ToOwned::to_owned)
            .collect())
    }

    async fn send_message(
        &self,
        identity: &Identity,
        room_id: &str,
        content: &Value,
    ) -> Result<String> {
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        let response = self
            .call(
                Method::PUT,
                &[
                    "_matrix",
                    "client",
                    "v3",
                    "rooms",
                    room_id,
                    "send",
                    "m.room.message",
                    &txn_id,
                ],
                Actor::Identity(identity),
                Some(content),
            )
            .await?;
        Self::string_field(&response, "event_id")
    }
}
