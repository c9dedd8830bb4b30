use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::source::InboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventDirection {
    /// Pushed by the homeserver, to be forwarded to the source channel.
    FromTarget,
    /// Produced by a source adapter, to be relayed through a puppet.
    FromSource,
}

pub(crate) fn classify_event(event: &InboundEvent, bot_user_id: &str) -> EventDirection {
    if event.origin_bot_id == bot_user_id {
        EventDirection::FromTarget
    } else {
        EventDirection::FromSource
    }
}

pub(crate) fn room_display_name(channel_name: Option<&str>, channel_id: &str) -> String {
    let name = channel_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(channel_id);
    format!("{name} ({channel_id})")
}

pub(crate) fn puppet_display_name(nickname: Option<&str>, user_id: &str) -> String {
    match nickname.map(str::trim).filter(|nick| !nick.is_empty()) {
        Some(nick) => format!("{nick} ({user_id})"),
        None => user_id.to_string(),
    }
}

pub(crate) fn puppet_localpart(prefix: &str) -> String {
    let first = Uuid::new_v4().simple().to_string();
    let second = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}{}", &first[..8], &second[..8])
}

pub(crate) fn is_puppet_user_id(user_id: &str, prefix: &str, server_name: &str) -> bool {
    let Some(rest) = user_id.strip_prefix('@') else {
        return false;
    };
    let Some((localpart, server)) = rest.split_once(':') else {
        return false;
    };
    server == server_name && localpart.starts_with(prefix) && localpart.len() > prefix.len()
}

/// True once at least `interval_ms` has passed since `last`.
pub(crate) fn metadata_due(last: DateTime<Utc>, now: DateTime<Utc>, interval_ms: u64) -> bool {
    let interval = i64::try_from(interval_ms).unwrap_or(i64::MAX);
    (now - last).num_milliseconds() >= interval
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use test_case::test_case;

    use super::*;
    use crate::source::MessageElement;

    fn event(origin: &str) -> InboundEvent {
        InboundEvent {
            origin_bot_id: origin.to_string(),
            channel_id: "general".to_string(),
            guild_id: None,
            user_id: "U1".to_string(),
            author_nickname: None,
            author_avatar: None,
            elements: vec![MessageElement::text("hi")],
        }
    }

    #[test]
    fn events_from_the_bridge_identity_go_to_the_source() {
        assert_eq!(
            classify_event(&event("@bot:example.org"), "@bot:example.org"),
            EventDirection::FromTarget
        );
        assert_eq!(
            classify_event(&event("discord"), "@bot:example.org"),
            EventDirection::FromSource
        );
    }

    #[test_case(Some("general"), "general", "general (general)" ; "resolved name")]
    #[test_case(None, "C1", "C1 (C1)" ; "falls back to id")]
    #[test_case(Some("  "), "C1", "C1 (C1)" ; "blank name")]
    fn room_names(name: Option<&str>, channel_id: &str, expected: &str) {
        assert_eq!(room_display_name(name, channel_id), expected);
    }

    #[test_case(Some("Alice"), "U1", "Alice (U1)" ; "nickname")]
    #[test_case(None, "U1", "U1" ; "bare id")]
    #[test_case(Some(""), "U1", "U1" ; "empty nickname")]
    fn puppet_names(nickname: Option<&str>, user_id: &str, expected: &str) {
        assert_eq!(puppet_display_name(nickname, user_id), expected);
    }

    #[test]
    fn localparts_are_prefixed_and_unique() {
        let first = puppet_localpart("_port_");
        let second = puppet_localpart("_port_");
        assert!(first.starts_with("_port_"));
        assert_eq!(first.len(), "_port_".len() + 16);
        assert_ne!(first, second);
    }

    #[test_case("@_port_ab12:example.org", true ; "puppet")]
    #[test_case("@_port_:example.org", false ; "bare prefix")]
    #[test_case("@alice:example.org", false ; "human")]
    #[test_case("@_port_ab12:other.org", false ; "foreign server")]
    #[test_case("_port_ab12", false ; "not a user id")]
    fn puppet_namespace(user_id: &str, expected: bool) {
        assert_eq!(is_puppet_user_id(user_id, "_port_", "example.org"), expected);
    }

    #[test]
    fn metadata_refresh_follows_interval() {
        let now = Utc::now();
        let interval_ms = 60_000;
        assert!(!metadata_due(now - Duration::seconds(59), now, interval_ms));
        assert!(metadata_due(now - Duration::seconds(60), now, interval_ms));
        assert!(metadata_due(now - Duration::days(2), now, interval_ms));
        assert!(!metadata_due(now + Duration::seconds(5), now, interval_ms));
    }
}
