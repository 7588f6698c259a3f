use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostType {
    Text,
    Media,
    Link,
    Poll,
}

impl PostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Text => "Text",
            PostType::Media => "Media",
            PostType::Link => "Link",
            PostType::Poll => "Poll",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Text" => Some(PostType::Text),
            "Media" => Some(PostType::Media),
            "Link" => Some(PostType::Link),
            "Poll" => Some(PostType::Poll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    pub link: String,
}

/// Row shape of `posts`, without the child tables.
#[derive(Debug, Clone)]
pub struct PostRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub community: String,
    pub post_type: PostType,
    pub link: Option<String>,
    pub is_spoiler: bool,
    pub is_nsfw: bool,
    pub is_comments_locked: bool,
    pub send_reply_notifications: bool,
    pub poll_enabled: bool,
    pub poll_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CommentRecord {
    pub id: String,
    pub post_id: String,
    pub parent_id: Option<String>,
    pub user_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollOption {
    pub label: String,
    pub votes: i64,
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort as strings.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_type_round_trips_through_its_name() {
        for ty in [PostType::Text, PostType::Media, PostType::Link, PostType::Poll] {
            assert_eq!(PostType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(PostType::parse("Images & Video"), None);
    }

    #[test]
    fn timestamps_parse_what_they_format() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(&now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
        assert_eq!(format_timestamp(&parsed).len(), "2025-01-01T00:00:00.000000Z".len());
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
