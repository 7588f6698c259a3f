// Moderator capability resolution. The permission rows are owned by the
// moderation layer; this module only reads them.
use rusqlite::{params, Connection, OptionalExtension};

use super::error::{EngageError, EngageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ManageUsers,
    ManageSettings,
    ManagePostsAndComments,
}

impl Capability {
    fn describe(&self) -> &'static str {
        match self {
            Capability::ManageUsers => "manage users",
            Capability::ManageSettings => "manage settings",
            Capability::ManagePostsAndComments => "manage posts and comments",
        }
    }
}

/// What a user may do in one community.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub is_moderator: bool,
    pub manage_users: bool,
    pub manage_settings: bool,
    pub manage_posts_and_comments: bool,
}

impl CapabilitySet {
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::ManageUsers => self.manage_users,
            Capability::ManageSettings => self.manage_settings,
            Capability::ManagePostsAndComments => self.manage_posts_and_comments,
        }
    }
}

pub fn resolve(conn: &Connection, community: &str, user_id: &str) -> rusqlite::Result<CapabilitySet> {
    let row = conn
        .query_row(
            "SELECT manage_users, manage_settings, manage_posts_and_comments
             FROM moderator_permissions WHERE community = ?1 AND user_id = ?2",
            params![community, user_id],
            |row| {
                Ok(CapabilitySet {
                    is_moderator: true,
                    manage_users: row.get(0)?,
                    manage_settings: row.get(1)?,
                    manage_posts_and_comments: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row.unwrap_or_default())
}

/// Who is allowed through a gate besides capability holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorOverride {
    Allowed,
    Denied,
}

/// The single gate for moderation-driven transitions.
pub fn require(
    conn: &Connection,
    community: &str,
    user_id: &str,
    author_id: &str,
    capability: Capability,
    author: AuthorOverride,
) -> EngageResult<()> {
    if author == AuthorOverride::Allowed && user_id == author_id {
        return Ok(());
    }

    let caps = resolve(conn, community, user_id)?;
    if !caps.is_moderator {
        return Err(EngageError::Forbidden(
            "You are not a moderator of this community".into(),
        ));
    }
    if !caps.has(capability) {
        return Err(EngageError::Forbidden(format!(
            "Moderator doesn't have permission to {}",
            capability.describe()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    #[test]
    fn non_moderator_resolves_to_empty_set() {
        let pool = testing::pool();
        let conn = pool.get().unwrap();
        let caps = resolve(&conn, "rust", "nobody").unwrap();
        assert_eq!(caps, CapabilitySet::default());
    }

    #[test]
    fn resolve_reads_named_capabilities() {
        let pool = testing::pool();
        testing::grant_moderator(&pool, "rust", "mod", false);
        let conn = pool.get().unwrap();
        let caps = resolve(&conn, "rust", "mod").unwrap();
        assert!(caps.is_moderator);
        assert!(caps.has(Capability::ManageSettings));
        assert!(!caps.has(Capability::ManagePostsAndComments));
    }

    #[test]
    fn require_lets_author_through_when_allowed() {
        let pool = testing::pool();
        let conn = pool.get().unwrap();
        let ok = require(
            &conn,
            "rust",
            "alice",
            "alice",
            Capability::ManagePostsAndComments,
            AuthorOverride::Allowed,
        );
        assert!(ok.is_ok());

        let denied = require(
            &conn,
            "rust",
            "alice",
            "alice",
            Capability::ManagePostsAndComments,
            AuthorOverride::Denied,
        );
        assert!(matches!(denied, Err(EngageError::Forbidden(_))));
    }

    #[test]
    fn require_checks_the_specific_capability() {
        let pool = testing::pool();
        testing::grant_moderator(&pool, "rust", "weak", false);
        testing::grant_moderator(&pool, "rust", "strong", true);
        let conn = pool.get().unwrap();

        let weak = require(
            &conn,
            "rust",
            "weak",
            "alice",
            Capability::ManagePostsAndComments,
            AuthorOverride::Denied,
        );
        assert!(matches!(weak, Err(EngageError::Forbidden(msg)) if msg.contains("permission")));

        let strong = require(
            &conn,
            "rust",
            "strong",
            "alice",
            Capability::ManagePostsAndComments,
            AuthorOverride::Denied,
        );
        assert!(strong.is_ok());

        let other_community = require(
            &conn,
            "go",
            "strong",
            "alice",
            Capability::ManagePostsAndComments,
            AuthorOverride::Denied,
        );
        assert!(other_community.is_err());
    }
}
