use crate::source::MessageElement;

pub struct MessageUtils;

impl MessageUtils {
    /// Flattens elements into a single line-oriented plain text body.
    ///
    /// Media become their URL on a line of their own.
    pub fn render_plain(elements: &[MessageElement]) -> String {
        let mut out = String::new();
        for element in elements {
            match element {
                MessageElement::Text { content } => out.push_str(content),
                MessageElement::Mention { user_id, name } => {
                    out.push('@');
                    out.push_str(name.as_deref().unwrap_or(user_id));
                }
                MessageElement::Image { url } | MessageElement::File { url, .. } => {
                    if !out.is_empty() && !out.ends_with('\n') {
                        out.push('\n');
                    }
                    out.push_str(url);
                    out.push('\n');
                }
            }
        }
        out.trim_end_matches('\n').to_string()
    }

    /// Renders only the textual elements, dropping media.
    pub fn render_text(elements: &[MessageElement]) -> String {
        let textual: Vec<MessageElement> = elements
            .iter()
            .filter(|element| {
                matches!(
                    element,
                    MessageElement::Text { .. } | MessageElement::Mention { .. }
                )
            })
            .cloned()
            .collect();
        Self::render_plain(&textual).trim().to_string()
    }

    pub fn preview_text(value: &str) -> String {
        const MAX_PREVIEW_CHARS: usize = 120;
        let compact = value.replace('\n', "\\n");
        if compact.chars().count() <= MAX_PREVIEW_CHARS {
            compact
        } else {
            let truncated: String = compact.chars().take(MAX_PREVIEW_CHARS).collect();
            format!("{truncated}...")
        }
    }
}
