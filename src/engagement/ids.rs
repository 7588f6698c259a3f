// Identifier newtypes for engageable items.
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::EngageError;

const ID_LEN: usize = 24;

fn generate_hex_id() -> String {
    use rand::Rng;
    let bytes: [u8; ID_LEN / 2] = rand::thread_rng().gen();
    hex::encode(bytes)
}

fn is_well_formed(raw: &str) -> bool {
    raw.len() == ID_LEN && raw.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostId(String);

impl PostId {
    pub fn generate() -> Self {
        Self(generate_hex_id())
    }

    /// Malformed ids are indistinguishable from absent ones.
    pub fn parse(raw: &str) -> Result<Self, EngageError> {
        if is_well_formed(raw) {
            Ok(Self(raw.to_ascii_lowercase()))
        } else {
            Err(EngageError::NotFound)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommentId(String);

impl CommentId {
    pub fn generate() -> Self {
        Self(generate_hex_id())
    }

    pub fn parse(raw: &str) -> Result<Self, EngageError> {
        if is_well_formed(raw) {
            Ok(Self(raw.to_ascii_lowercase()))
        } else {
            Err(EngageError::NotFound)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Anything that can carry a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRef<'a> {
    Post(&'a PostId),
    Comment(&'a CommentId),
}

impl ItemRef<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            ItemRef::Post(_) => "post",
            ItemRef::Comment(_) => "comment",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ItemRef::Post(id) => id.as_str(),
            ItemRef::Comment(id) => id.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_24_hex_chars() {
        let id = PostId::generate();
        assert_eq!(id.as_str().len(), 24);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(PostId::generate(), PostId::generate());
    }

    #[test]
    fn parse_accepts_generated_ids() {
        let id = CommentId::generate();
        assert_eq!(CommentId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn parse_rejects_malformed_ids_as_not_found() {
        for raw in ["", "abc", "zzzzzzzzzzzzzzzzzzzzzzzz", "0123456789abcdef012345678"] {
            assert!(matches!(PostId::parse(raw), Err(EngageError::NotFound)));
        }
    }

    #[test]
    fn parse_normalizes_case() {
        let id = PostId::parse("ABCDEF0123456789ABCDEF01").unwrap();
        assert_eq!(id.as_str(), "abcdef0123456789abcdef01");
    }

    #[test]
    fn item_ref_reports_kind_and_id() {
        let post = PostId::generate();
        let item = ItemRef::Post(&post);
        assert_eq!(item.kind(), "post");
        assert_eq!(item.id(), post.as_str());
    }
}
