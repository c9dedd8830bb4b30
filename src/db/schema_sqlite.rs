// SQLite schema definitions
// Mirrors schema.rs with timestamps stored as RFC 3339 text

diesel::table! {
    channel_mappings (source_channel_id) {
        source_channel_id -> Text,
        room_id -> Text,
        last_metadata_sync -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    room_mappings (room_id) {
        room_id -> Text,
        source_adapter_id -> Text,
        source_channel_id -> Text,
        source_guild_id -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    puppet_mappings (source_user_id) {
        source_user_id -> Text,
        puppet_id -> Text,
        auth_token -> Text,
        last_metadata_sync -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    room_members (source_channel_id, source_user_id) {
        source_channel_id -> Text,
        source_user_id -> Text,
        joined_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    channel_mappings,
    room_mappings,
    puppet_mappings,
    room_members,
);
