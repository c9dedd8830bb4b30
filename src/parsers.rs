pub mod common;
pub mod discord_parser;
pub mod matrix_parser;

pub use common::MessageUtils;
pub use discord_parser::{DiscordAttachment, parse_discord_message, render_for_discord};
pub use matrix_parser::{build_text_content, parse_message_content};
