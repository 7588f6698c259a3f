use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::capabilities::{self, AuthorOverride, Capability};
use super::error::{EngageError, EngageResult};
use super::ids::PostId;
use crate::db::models::format_timestamp;
use crate::state::DbPool;

/// Per-post moderation flags. Each is an independent boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostFlag {
    Spoiler,
    Nsfw,
    CommentsLocked,
}

impl PostFlag {
    fn column(&self) -> &'static str {
        match self {
            PostFlag::Spoiler => "is_spoiler",
            PostFlag::Nsfw => "is_nsfw",
            PostFlag::CommentsLocked => "is_comments_locked",
        }
    }

    /// Spoiler and NSFW may also be set by the post's author; locking is
    /// moderator-only.
    fn author_override(&self) -> AuthorOverride {
        match self {
            PostFlag::Spoiler | PostFlag::Nsfw => AuthorOverride::Allowed,
            PostFlag::CommentsLocked => AuthorOverride::Denied,
        }
    }
}

/// User-scoped post lists. Rows reference posts by id only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserList {
    Saved,
    Hidden,
    Recent,
}

impl UserList {
    fn table(&self) -> &'static str {
        match self {
            UserList::Saved => "user_saved_posts",
            UserList::Hidden => "user_hidden_posts",
            UserList::Recent => "user_recent_posts",
        }
    }
}

#[derive(Clone)]
pub struct VisibilityStateMachine {
    db: DbPool,
}

impl VisibilityStateMachine {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Idempotent flag write, gated by the caller's capabilities in the
    /// post's community.
    pub fn set_flag(
        &self,
        post_id: &PostId,
        caller_id: &str,
        flag: PostFlag,
        value: bool,
    ) -> EngageResult<()> {
        let conn = self.db.get()?;
        let (community, author_id): (String, String) = conn
            .query_row(
                "SELECT community, user_id FROM posts WHERE id = ?1",
                params![post_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(EngageError::NotFound)?;

        capabilities::require(
            &conn,
            &community,
            caller_id,
            &author_id,
            Capability::ManagePostsAndComments,
            flag.author_override(),
        )?;

        let sql = format!("UPDATE posts SET {} = ?1 WHERE id = ?2", flag.column());
        conn.execute(&sql, params![value, post_id.as_str()])?;
        tracing::info!("{:?} set to {} on post {} by {}", flag, value, post_id, caller_id);
        Ok(())
    }

    /// Add `user_id` to the post's hidden-by set and the post to the user's
    /// hidden list, together or not at all.
    pub fn hide(&self, post_id: &PostId, user_id: &str) -> EngageResult<()> {
        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_post(&tx, post_id)?;

        if is_hidden_for(&tx, post_id, user_id)? {
            return Err(EngageError::InvalidState(
                "Post is already hidden by the user".into(),
            ));
        }
        tx.execute(
            "INSERT INTO post_hidden_by (post_id, user_id) VALUES (?1, ?2)",
            params![post_id.as_str(), user_id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO user_hidden_posts (user_id, post_id, added_at) VALUES (?1, ?2, ?3)",
            params![user_id, post_id.as_str(), format_timestamp(&Utc::now())],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn unhide(&self, post_id: &PostId, user_id: &str) -> EngageResult<()> {
        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_post(&tx, post_id)?;

        let removed = tx.execute(
            "DELETE FROM post_hidden_by WHERE post_id = ?1 AND user_id = ?2",
            params![post_id.as_str(), user_id],
        )?;
        if removed == 0 {
            return Err(EngageError::InvalidState(
                "Post is not hidden by the user".into(),
            ));
        }
        tx.execute(
            "DELETE FROM user_hidden_posts WHERE user_id = ?1 AND post_id = ?2",
            params![user_id, post_id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn save(&self, post_id: &PostId, user_id: &str) -> EngageResult<()> {
        let conn = self.db.get()?;
        ensure_post(&conn, post_id)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO user_saved_posts (user_id, post_id, added_at) VALUES (?1, ?2, ?3)",
            params![user_id, post_id.as_str(), format_timestamp(&Utc::now())],
        )?;
        if inserted == 0 {
            return Err(EngageError::InvalidState(
                "Post already saved by the user".into(),
            ));
        }
        Ok(())
    }

    pub fn unsave(&self, post_id: &PostId, user_id: &str) -> EngageResult<()> {
        let conn = self.db.get()?;
        ensure_post(&conn, post_id)?;
        let removed = conn.execute(
            "DELETE FROM user_saved_posts WHERE user_id = ?1 AND post_id = ?2",
            params![user_id, post_id.as_str()],
        )?;
        if removed == 0 {
            return Err(EngageError::InvalidState(
                "Post is not saved by the user".into(),
            ));
        }
        Ok(())
    }

    /// Move the post to the front of the user's recent list.
    pub fn record_visit(&self, post_id: &PostId, user_id: &str) -> EngageResult<()> {
        let conn = self.db.get()?;
        ensure_post(&conn, post_id)?;
        record_recent(&conn, user_id, post_id)?;
        Ok(())
    }

    pub fn remove_recent(&self, post_id: &PostId, user_id: &str) -> EngageResult<()> {
        let conn = self.db.get()?;
        ensure_post(&conn, post_id)?;
        let removed = conn.execute(
            "DELETE FROM user_recent_posts WHERE user_id = ?1 AND post_id = ?2",
            params![user_id, post_id.as_str()],
        )?;
        if removed == 0 {
            return Err(EngageError::NotFound);
        }
        Ok(())
    }

    /// Post ids in one of the user's lists, newest first. References to
    /// posts that no longer exist are skipped.
    pub fn list(&self, user_id: &str, list: UserList) -> EngageResult<Vec<String>> {
        let conn = self.db.get()?;
        let sql = format!(
            "SELECT l.post_id FROM {} l JOIN posts p ON p.id = l.post_id
             WHERE l.user_id = ?1 ORDER BY l.added_at DESC",
            list.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn is_in(&self, user_id: &str, post_id: &PostId, list: UserList) -> EngageResult<bool> {
        let conn = self.db.get()?;
        Ok(in_list(&conn, user_id, post_id, list)?)
    }
}

fn ensure_post(conn: &Connection, post_id: &PostId) -> EngageResult<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM posts WHERE id = ?1",
        params![post_id.as_str()],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(EngageError::NotFound)
    }
}

pub(crate) fn is_hidden_for(conn: &Connection, post_id: &PostId, user_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM post_hidden_by WHERE post_id = ?1 AND user_id = ?2",
        params![post_id.as_str(), user_id],
        |row| row.get(0),
    )
}

pub(crate) fn in_list(
    conn: &Connection,
    user_id: &str,
    post_id: &PostId,
    list: UserList,
) -> rusqlite::Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) > 0 FROM {} WHERE user_id = ?1 AND post_id = ?2",
        list.table()
    );
    conn.query_row(&sql, params![user_id, post_id.as_str()], |row| row.get(0))
}

pub(crate) fn record_recent(conn: &Connection, user_id: &str, post_id: &PostId) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO user_recent_posts (user_id, post_id, added_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id, post_id) DO UPDATE SET added_at = excluded.added_at",
        params![user_id, post_id.as_str(), format_timestamp(&Utc::now())],
    )?;
    Ok(())
}

/// Drop user-scoped references to a deleted post.
pub(crate) fn prune_references(conn: &Connection, post_id: &PostId) -> rusqlite::Result<usize> {
    let mut pruned = 0;
    for list in [UserList::Saved, UserList::Hidden, UserList::Recent] {
        let sql = format!("DELETE FROM {} WHERE post_id = ?1", list.table());
        pruned += conn.execute(&sql, params![post_id.as_str()])?;
    }
    Ok(pruned)
}
