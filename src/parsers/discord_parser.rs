use once_cell::sync::Lazy;
use regex::Regex;

use crate::source::MessageElement;

use super::common::MessageUtils;

static USER_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@!?(\d+)>").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordAttachment {
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
}

/// Splits a Discord message into text, mention and attachment elements.
///
/// `mentions` maps the ids referenced in the content to display names.
pub fn parse_discord_message(
    content: &str,
    mentions: &[(String, String)],
    attachments: &[DiscordAttachment],
) -> Vec<MessageElement> {
    let mut elements = Vec::new();
    let mut cursor = 0;

    for captures in USER_MENTION_RE.captures_iter(content) {
        let (Some(whole), Some(id)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if whole.start() > cursor {
            elements.push(MessageElement::text(&content[cursor..whole.start()]));
        }
        let user_id = id.as_str().to_string();
        let name = mentions
            .iter()
            .find(|(mentioned, _)| *mentioned == user_id)
            .map(|(_, name)| name.clone());
        elements.push(MessageElement::Mention { user_id, name });
        cursor = whole.end();
    }
    if cursor < content.len() {
        elements.push(MessageElement::text(&content[cursor..]));
    }

    for attachment in attachments {
        let is_image = attachment
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"));
        if is_image {
            elements.push(MessageElement::Image {
                url: attachment.url.clone(),
            });
        } else {
            elements.push(MessageElement::File {
                url: attachment.url.clone(),
                name: Some(attachment.filename.clone()),
            });
        }
    }

    elements
}

/// Renders elements as a Discord message body.
pub fn render_for_discord(elements: &[MessageElement]) -> String {
    MessageUtils::render_plain(elements)
}
