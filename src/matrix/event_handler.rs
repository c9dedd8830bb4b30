use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::parsers::matrix_parser::parse_message_content;
use crate::source::InboundEvent;

const AGE_LIMIT_MS: i64 = 900000;
const RECENT_TRANSACTIONS: usize = 256;

#[derive(Debug, Clone)]
pub struct MatrixEvent {
    pub event_id: Option<String>,
    pub event_type: String,
    pub room_id: String,
    pub sender: String,
    pub state_key: Option<String>,
    pub content: Option<Value>,
    pub timestamp: Option<i64>,
}

impl MatrixEvent {
    /// Reads the fields the bridge cares about from a raw transaction event.
    pub fn from_json(event: &Value) -> Option<Self> {
        let text = |key: &str| event.get(key).and_then(Value::as_str).map(ToOwned::to_owned);

        Some(Self {
            event_id: text("event_id"),
            event_type: text("type")?,
            room_id: text("room_id")?,
            sender: text("sender")?,
            state_key: text("state_key"),
            content: event.get("content").cloned(),
            timestamp: event.get("origin_server_ts").and_then(Value::as_i64),
        })
    }
}

#[async_trait]
pub trait MatrixEventHandler: Send + Sync {
    async fn handle_room_message(&self, event: InboundEvent) -> Result<()>;
}

pub struct MatrixEventProcessor {
    event_handler: Arc<dyn MatrixEventHandler>,
    bot_user_id: String,
    homeserver_url: String,
    recent_transactions: Mutex<VecDeque<String>>,
}

impl MatrixEventProcessor {
    pub fn new(
        event_handler: Arc<dyn MatrixEventHandler>,
        bot_user_id: &str,
        homeserver_url: &str,
    ) -> Self {
        Self {
            event_handler,
            bot_user_id: bot_user_id.to_string(),
            homeserver_url: homeserver_url.to_string(),
            recent_transactions: Mutex::new(VecDeque::with_capacity(RECENT_TRANSACTIONS)),
        }
    }

    /// Records `txn_id`, returning false when the homeserver is retrying it.
    fn first_delivery(&self, txn_id: &str) -> bool {
        let mut recent = self.recent_transactions.lock();
        if recent.iter().any(|seen| seen == txn_id) {
            return false;
        }
        if recent.len() == RECENT_TRANSACTIONS {
            recent.pop_front();
        }
        recent.push_back(txn_id.to_string());
        true
    }

    fn check_event_age(event: &MatrixEvent) -> bool {
        if let Some(ts) = event.timestamp {
            let now = chrono::Utc::now().timestamp_millis();
            if ts > now {
                debug!(
                    "event timestamp is in the future, allowing event_id={:?}",
                    event.event_id
                );
                return true;
            }
            let age = now - ts;
            if age > AGE_LIMIT_MS {
                info!(
                    "skipping event due to age {}ms > {}ms event_id={:?} room_id={} type={}",
                    age, AGE_LIMIT_MS, event.event_id, event.room_id, event.event_type
                );
                return false;
            }
        }
        true
    }

    /// Processes every event of a pushed transaction and returns how many were relayed.
    ///
    /// A failing event is logged and does not stop the rest of the transaction.
    pub async fn process_transaction(&self, txn_id: &str, body: &Value) -> usize {
        if !self.first_delivery(txn_id) {
            debug!("transaction already processed txn_id={}", txn_id);
            return 0;
        }
        let Some(events) = body.get("events").and_then(Value::as_array) else {
            debug!("transaction has no events txn_id={}", txn_id);
            return 0;
        };

        let mut relayed = 0;
        for raw in events {
            let Some(event) = MatrixEvent::from_json(raw) else {
                debug!("skipping malformed event in txn_id={}", txn_id);
                continue;
            };
            let event_id = event.event_id.clone();
            match self.process_event(event).await {
                Ok(true) => relayed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(
                        "error processing matrix event txn_id={} event_id={:?}: {:#}",
                        txn_id, event_id, err
                    );
                }
            }
        }
        relayed
    }

    pub async fn process_event(&self, event: MatrixEvent) -> Result<bool> {
        if !Self::check_event_age(&event) {
            return Ok(false);
        }

        if event.event_type != "m.room.message" {
            debug!(
                "ignoring matrix event type={} room_id={}",
                event.event_type, event.room_id
            );
            return Ok(false);
        }

        let elements = event
            .content
            .as_ref()
            .map(|content| parse_message_content(content, &self.homeserver_url))
            .unwrap_or_default();
        if elements.is_empty() {
            debug!(
                "matrix message has no relayable content event_id={:?}",
                event.event_id
            );
            return Ok(false);
        }

        self.event_handler
            .handle_room_message(InboundEvent {
                origin_bot_id: self.bot_user_id.clone(),
                channel_id: event.room_id,
                guild_id: None,
                user_id: event.sender,
                author_nickname: None,
                author_avatar: None,
                elements,
            })
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::source::MessageElement;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<InboundEvent>>,
    }

    #[async_trait]
    impl MatrixEventHandler for Recorder {
        async fn handle_room_message(&self, event: InboundEvent) -> Result<()> {
            let fail = event.channel_id == "!broken:example.org";
            self.events.lock().push(event);
            if fail {
                return Err(anyhow!("relay failed"));
            }
            Ok(())
        }
    }

    fn make_event(ts: Option<i64>) -> MatrixEvent {
        MatrixEvent {
            event_id: Some("$test".to_string()),
            event_type: "m.room.message".to_string(),
            room_id: "!room:example.org".to_string(),
            sender: "@user:example.org".to_string(),
            state_key: None,
            content: None,
            timestamp: ts,
        }
    }

    fn message(room_id: &str, body: &str, ts: i64) -> Value {
        json!({
            "type": "m.room.message",
            "event_id": format!("$ev-{body}"),
            "room_id": room_id,
            "sender": "@alice:example.org",
            "origin_server_ts": ts,
            "content": { "msgtype": "m.text", "body": body }
        })
    }

    #[test]
    fn check_event_age_allows_recent_events() {
        let now = chrono::Utc::now().timestamp_millis();
        assert!(MatrixEventProcessor::check_event_age(&make_event(Some(now))));
    }

    #[test]
    fn check_event_age_rejects_old_events() {
        let old_ts = chrono::Utc::now().timestamp_millis() - 1_000_000;
        assert!(!MatrixEventProcessor::check_event_age(&make_event(Some(old_ts))));
    }

    #[test]
    fn check_event_age_allows_events_without_timestamp() {
        assert!(MatrixEventProcessor::check_event_age(&make_event(None)));
    }

    #[test]
    fn check_event_age_allows_future_events() {
        let future_ts = chrono::Utc::now().timestamp_millis() + 60_000;
        assert!(MatrixEventProcessor::check_event_age(&make_event(Some(future_ts))));
    }

    #[tokio::test]
    async fn transaction_relays_messages_as_bridge_origin() {
        let recorder = Arc::new(Recorder::default());
        let processor = MatrixEventProcessor::new(
            recorder.clone(),
            "@_port_bot:example.org",
            "http://localhost:8008",
        );
        let now = chrono::Utc::now().timestamp_millis();
        let body = json!({
            "events": [
                message("!room:example.org", "hello", now),
                { "type": "m.room.member", "room_id": "!room:example.org", "sender": "@alice:example.org", "state_key": "@alice:example.org", "content": { "membership": "join" } },
                message("!room:example.org", "stale", now - 1_000_000),
            ]
        });

        assert_eq!(processor.process_transaction("txn1", &body).await, 1);

        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin_bot_id, "@_port_bot:example.org");
        assert_eq!(events[0].channel_id, "!room:example.org");
        assert_eq!(events[0].user_id, "@alice:example.org");
        assert_eq!(events[0].elements, vec![MessageElement::text("hello")]);
    }

    #[tokio::test]
    async fn failing_event_does_not_stop_the_transaction() {
        let recorder = Arc::new(Recorder::default());
        let processor =
            MatrixEventProcessor::new(recorder.clone(), "@bot:example.org", "http://hs");
        let now = chrono::Utc::now().timestamp_millis();
        let body = json!({
            "events": [
                message("!broken:example.org", "first", now),
                message("!room:example.org", "second", now),
            ]
        });

        assert_eq!(processor.process_transaction("txn2", &body).await, 1);
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[tokio::test]
    async fn retried_transactions_are_not_replayed() {
        let recorder = Arc::new(Recorder::default());
        let processor =
            MatrixEventProcessor::new(recorder.clone(), "@bot:example.org", "http://hs");
        let now = chrono::Utc::now().timestamp_millis();
        let body = json!({ "events": [message("!room:example.org", "once", now)] });

        assert_eq!(processor.process_transaction("txn3", &body).await, 1);
        assert_eq!(processor.process_transaction("txn3", &body).await, 0);
        assert_eq!(recorder.events.lock().len(), 1);
    }
}
