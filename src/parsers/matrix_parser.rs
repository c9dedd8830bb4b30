use serde_json::{Value, json};

use crate::media::{ImageInfo, mxc_to_http};
use crate::source::MessageElement;

use super::common::MessageUtils;

/// Converts the content of an `m.room.message` into bridge elements.
pub fn parse_message_content(content: &Value, homeserver_url: &str) -> Vec<MessageElement> {
    let msgtype = content.get("msgtype").and_then(Value::as_str).unwrap_or("");
    let body = content
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let media_url = content
        .get("url")
        .and_then(Value::as_str)
        .map(|url| mxc_to_http(homeserver_url, url).unwrap_or_else(|| url.to_string()));

    match (msgtype, media_url) {
        ("m.text" | "m.notice", _) if !body.is_empty() => vec![MessageElement::text(body)],
        ("m.emote", _) if !body.is_empty() => vec![MessageElement::text(format!("* {body}"))],
        ("m.image", Some(url)) => vec![MessageElement::Image { url }],
        ("m.file" | "m.video" | "m.audio", Some(url)) => vec![MessageElement::File {
            url,
            name: (!body.is_empty()).then_some(body),
        }],
        _ => Vec::new(),
    }
}

/// Builds an `m.text` content from the textual elements, if there are any.
pub fn build_text_content(elements: &[MessageElement]) -> Option<Value> {
    let body = MessageUtils::render_text(elements);
    if body.is_empty() {
        return None;
    }
    Some(json!({
        "msgtype": "m.text",
        "body": body,
    }))
}

pub fn build_image_content(mxc: &str, name: &str, info: &ImageInfo) -> Value {
    json!({
        "msgtype": "m.image",
        "body": name,
        "url": mxc,
        "info": info.to_json(),
    })
}

pub fn build_file_content(mxc: &str, name: &str, mimetype: &str, size: usize) -> Value {
    json!({
        "msgtype": "m.file",
        "body": name,
        "url": mxc,
        "info": {
            "mimetype": mimetype,
            "size": size,
        },
    })
}
