use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::error::{EngageError, EngageResult};
use super::ids::ItemRef;
use crate::db::models::format_timestamp;
use crate::state::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    fn as_i64(self) -> i64 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }

    fn from_i64(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(VoteDirection::Up),
            -1 => Some(VoteDirection::Down),
            _ => None,
        }
    }
}

/// Up/down votes for posts and comments.
///
/// Each (item, user) pair holds at most one row, so a user can never be in
/// both the up and down sets. Mutations are single statements, which keeps
/// concurrent voters on the same item from overwriting each other.
#[derive(Clone)]
pub struct VoteLedger {
    db: DbPool,
}

impl VoteLedger {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Record `direction` for `user_id` and return the new net score.
    ///
    /// Repeating the same direction leaves the ledger unchanged; voting the
    /// opposite direction moves the user across.
    pub fn apply_vote(
        &self,
        item: ItemRef<'_>,
        user_id: &str,
        direction: VoteDirection,
    ) -> EngageResult<i64> {
        let conn = self.db.get()?;
        if !item_exists(&conn, item)? {
            return Err(EngageError::NotFound);
        }

        conn.execute(
            "INSERT INTO votes (item_kind, item_id, user_id, direction, voted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(item_kind, item_id, user_id) DO UPDATE SET
               direction = excluded.direction,
               voted_at = CASE WHEN votes.direction = excluded.direction
                               THEN votes.voted_at ELSE excluded.voted_at END",
            params![
                item.kind(),
                item.id(),
                user_id,
                direction.as_i64(),
                format_timestamp(&Utc::now())
            ],
        )?;

        let score = net_score(&conn, item)?;
        tracing::debug!(
            "{} {} vote {:?} by {} -> {}",
            item.kind(),
            item.id(),
            direction,
            user_id,
            score
        );
        Ok(score)
    }

    pub fn score(&self, item: ItemRef<'_>) -> EngageResult<i64> {
        let conn = self.db.get()?;
        Ok(net_score(&conn, item)?)
    }

    pub fn vote_of(&self, item: ItemRef<'_>, user_id: &str) -> EngageResult<Option<VoteDirection>> {
        let conn = self.db.get()?;
        Ok(vote_of(&conn, item, user_id)?)
    }

    /// Post ids the user currently votes in `direction`, newest vote first.
    pub fn posts_voted_by(
        &self,
        user_id: &str,
        direction: VoteDirection,
    ) -> EngageResult<Vec<String>> {
        let conn = self.db.get()?;
        let mut stmt = conn.prepare(
            "SELECT item_id FROM votes
             WHERE user_id = ?1 AND item_kind = 'post' AND direction = ?2
             ORDER BY voted_at DESC",
        )?;
        let ids = stmt
            .query_map(params![user_id, direction.as_i64()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

fn item_exists(conn: &Connection, item: ItemRef<'_>) -> rusqlite::Result<bool> {
    let sql = match item {
        ItemRef::Post(_) => "SELECT COUNT(*) > 0 FROM posts WHERE id = ?1",
        ItemRef::Comment(_) => "SELECT COUNT(*) > 0 FROM comments WHERE id = ?1",
    };
    conn.query_row(sql, params![item.id()], |row| row.get(0))
}

/// |up| - |down| for the item.
pub(crate) fn net_score(conn: &Connection, item: ItemRef<'_>) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(direction), 0) FROM votes WHERE item_kind = ?1 AND item_id = ?2",
        params![item.kind(), item.id()],
        |row| row.get(0),
    )
}

pub(crate) fn vote_of(
    conn: &Connection,
    item: ItemRef<'_>,
    user_id: &str,
) -> rusqlite::Result<Option<VoteDirection>> {
    let raw: Option<i64> = conn
        .query_row(
            "SELECT direction FROM votes WHERE item_kind = ?1 AND item_id = ?2 AND user_id = ?3",
            params![item.kind(), item.id(), user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(VoteDirection::from_i64))
}

/// Drop every vote on the given items of one kind. Used by cascading deletes.
pub(crate) fn purge_items(conn: &Connection, kind: &str, ids: &[String]) -> rusqlite::Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "DELETE FROM votes WHERE item_kind = ? AND item_id IN ({})",
        placeholders
    );
    let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(ids.len() + 1);
    values.push(&kind);
    for id in ids {
        values.push(id);
    }
    conn.execute(&sql, values.as_slice())
}
