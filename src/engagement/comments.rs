use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

use super::error::{EngageError, EngageResult};
use super::ids::{CommentId, PostId};
use super::votes;
use crate::db::models::{format_timestamp, parse_timestamp, CommentRecord};
use crate::state::DbPool;

/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
const CHUNK: usize = 500;

/// Outcome of a cascading delete. Failures are logged and counted rather
/// than returned; a failed level leaves its subtree orphaned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub removed: usize,
    pub levels: usize,
    pub failures: usize,
}

impl CascadeReport {
    pub fn is_complete(&self) -> bool {
        self.failures == 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub username: String,
    pub content: String,
    pub votes: i64,
    pub created_at: String,
    pub replies: Vec<CommentNode>,
}

/// Comment forests under posts. `parent_id` is the only structural link.
#[derive(Clone)]
pub struct CommentTree {
    db: DbPool,
    max_len: usize,
}

impl CommentTree {
    pub fn new(db: DbPool, max_len: usize) -> Self {
        Self { db, max_len }
    }

    pub fn add(
        &self,
        post_id: &PostId,
        parent_id: Option<&CommentId>,
        author_id: &str,
        content: &str,
    ) -> EngageResult<CommentRecord> {
        let body = content.trim();
        if body.is_empty() {
            return Err(EngageError::Validation("Comment cannot be empty".into()));
        }
        if body.chars().count() > self.max_len {
            return Err(EngageError::Validation(format!(
                "Comment must be {} characters or less",
                self.max_len
            )));
        }

        let conn = self.db.get()?;

        let locked: bool = conn
            .query_row(
                "SELECT is_comments_locked FROM posts WHERE id = ?1",
                params![post_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(EngageError::NotFound)?;
        if locked {
            return Err(EngageError::InvalidState(
                "Comments are locked on this post".into(),
            ));
        }

        if let Some(parent) = parent_id {
            let parent_post: String = conn
                .query_row(
                    "SELECT post_id FROM comments WHERE id = ?1",
                    params![parent.as_str()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(EngageError::NotFound)?;
            if parent_post != post_id.as_str() {
                return Err(EngageError::Validation(
                    "Parent comment belongs to a different post".into(),
                ));
            }
        }

        let record = CommentRecord {
            id: CommentId::generate().as_str().to_string(),
            post_id: post_id.as_str().to_string(),
            parent_id: parent_id.map(|p| p.as_str().to_string()),
            user_id: author_id.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO comments (id, post_id, parent_id, user_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.post_id,
                record.parent_id,
                record.user_id,
                record.body,
                format_timestamp(&record.created_at)
            ],
        )?;

        Ok(record)
    }

    /// The post's comment forest, oldest first at every level.
    pub fn thread(&self, post_id: &PostId) -> EngageResult<Vec<CommentNode>> {
        let conn = self.db.get()?;
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM posts WHERE id = ?1",
            params![post_id.as_str()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(EngageError::NotFound);
        }

        let mut stmt = conn.prepare(
            "SELECT c.id, c.parent_id, COALESCE(u.username, '[deleted]'), c.body, c.created_at,
                    COALESCE((SELECT SUM(v.direction) FROM votes v
                              WHERE v.item_kind = 'comment' AND v.item_id = c.id), 0)
             FROM comments c
             LEFT JOIN users u ON u.id = c.user_id
             WHERE c.post_id = ?1
             ORDER BY c.created_at ASC, c.rowid ASC",
        )?;
        let nodes = stmt
            .query_map(params![post_id.as_str()], |row| {
                Ok(CommentNode {
                    id: row.get(0)?,
                    parent_id: row.get(1)?,
                    username: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                    votes: row.get(5)?,
                    replies: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(assemble_forest(nodes))
    }

    pub fn get(&self, comment_id: &CommentId) -> EngageResult<CommentRecord> {
        let conn = self.db.get()?;
        load_comment(&conn, comment_id)?.ok_or(EngageError::NotFound)
    }

    /// Author-initiated removal of a comment and all of its replies.
    pub fn delete(&self, comment_id: &CommentId, caller_id: &str) -> EngageResult<CascadeReport> {
        let conn = self.db.get()?;
        let comment = load_comment(&conn, comment_id)?.ok_or(EngageError::NotFound)?;
        if comment.user_id != caller_id {
            return Err(EngageError::Forbidden(
                "User is not authorized to delete this comment".into(),
            ));
        }

        conn.execute(
            "DELETE FROM comments WHERE id = ?1",
            params![comment_id.as_str()],
        )?;
        votes::purge_items(&conn, "comment", &[comment.id.clone()])?;

        let mut report = cascade_from(&conn, vec![comment.id]);
        report.removed += 1;
        tracing::info!(
            "Deleted comment {} ({} removed over {} levels)",
            comment_id,
            report.removed,
            report.levels
        );
        Ok(report)
    }
}

fn load_comment(conn: &Connection, comment_id: &CommentId) -> rusqlite::Result<Option<CommentRecord>> {
    conn.query_row(
        "SELECT id, post_id, parent_id, user_id, body, created_at FROM comments WHERE id = ?1",
        params![comment_id.as_str()],
        |row| {
            let created_at: String = row.get(5)?;
            Ok(CommentRecord {
                id: row.get(0)?,
                post_id: row.get(1)?,
                parent_id: row.get(2)?,
                user_id: row.get(3)?,
                body: row.get(4)?,
                created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
            })
        },
    )
    .optional()
}

/// Remove every comment under a post: the top-level forest first, then
/// each level of replies beneath it.
pub(crate) fn cascade_post(conn: &Connection, post_id: &PostId) -> CascadeReport {
    let mut report = CascadeReport::default();

    let roots: Vec<String> = match select_ids(
        conn,
        "SELECT id FROM comments WHERE post_id = ?1 AND parent_id IS NULL",
        post_id.as_str(),
    ) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!("Cascade for post {} could not list comments: {}", post_id, e);
            report.failures += 1;
            return report;
        }
    };

    match delete_where(conn, "DELETE FROM comments WHERE post_id = ?1 AND parent_id IS NULL", post_id.as_str()) {
        Ok(n) => {
            report.removed += n;
            report.levels += 1;
            if let Err(e) = votes::purge_items(conn, "comment", &roots) {
                tracing::warn!("Cascade for post {} left comment votes behind: {}", post_id, e);
                report.failures += 1;
            }
        }
        Err(e) => {
            tracing::warn!("Cascade for post {} failed on top-level comments: {}", post_id, e);
            report.failures += 1;
        }
    }

    let below = cascade_from(conn, roots);
    report.removed += below.removed;
    report.levels += below.levels;
    report.failures += below.failures;
    report
}

/// Level-by-level delete of all descendants of `frontier`. Each level is
/// one bulk delete keyed by parent, so statement count tracks tree depth.
pub(crate) fn cascade_from(conn: &Connection, mut frontier: Vec<String>) -> CascadeReport {
    let mut report = CascadeReport::default();

    while !frontier.is_empty() {
        let mut next = Vec::new();
        let mut removed_this_level = 0;

        for chunk in frontier.chunks(CHUNK) {
            let children = match children_of(conn, chunk) {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::warn!("Cascade could not list replies: {}", e);
                    report.failures += 1;
                    continue;
                }
            };
            if children.is_empty() {
                continue;
            }

            match delete_children_of(conn, chunk) {
                Ok(n) => removed_this_level += n,
                Err(e) => {
                    tracing::warn!("Cascade could not delete replies: {}", e);
                    report.failures += 1;
                }
            }
            if let Err(e) = votes::purge_items(conn, "comment", &children) {
                tracing::warn!("Cascade left reply votes behind: {}", e);
                report.failures += 1;
            }
            next.extend(children);
        }

        if removed_this_level > 0 {
            report.levels += 1;
            report.removed += removed_this_level;
        }
        frontier = next;
    }

    report
}

fn select_ids(conn: &Connection, sql: &str, key: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![key], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn delete_where(conn: &Connection, sql: &str, key: &str) -> rusqlite::Result<usize> {
    conn.execute(sql, params![key])
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn children_of(conn: &Connection, parents: &[String]) -> rusqlite::Result<Vec<String>> {
    let sql = format!(
        "SELECT id FROM comments WHERE parent_id IN ({})",
        placeholders(parents.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(rusqlite::params_from_iter(parents.iter()), |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn delete_children_of(conn: &Connection, parents: &[String]) -> rusqlite::Result<usize> {
    let sql = format!(
        "DELETE FROM comments WHERE parent_id IN ({})",
        placeholders(parents.len())
    );
    conn.execute(&sql, rusqlite::params_from_iter(parents.iter()))
}

/// Nest a flat, creation-ordered list. Built bottom-up from a breadth-first
/// order, so arbitrarily deep threads never recurse. Rows whose parent is
/// missing are orphans and are left out.
fn assemble_forest(flat: Vec<CommentNode>) -> Vec<CommentNode> {
    let mut children: HashMap<Option<String>, Vec<String>> = HashMap::new();
    let mut nodes: HashMap<String, CommentNode> = HashMap::new();
    for node in flat {
        children
            .entry(node.parent_id.clone())
            .or_default()
            .push(node.id.clone());
        nodes.insert(node.id.clone(), node);
    }

    let roots = children.get(&None).cloned().unwrap_or_default();
    let mut order = roots.clone();
    let mut cursor = 0;
    while cursor < order.len() {
        if let Some(kids) = children.get(&Some(order[cursor].clone())) {
            order.extend(kids.iter().cloned());
        }
        cursor += 1;
    }

    // Children sit after their parent in `order`, so walking it backwards
    // finishes every subtree before its parent is moved.
    let mut finished: HashMap<String, CommentNode> = HashMap::new();
    for id in order.iter().rev() {
        let Some(mut node) = nodes.remove(id) else {
            continue;
        };
        if let Some(kids) = children.get(&Some(id.clone())) {
            node.replies = kids.iter().filter_map(|k| finished.remove(k)).collect();
        }
        finished.insert(id.clone(), node);
    }

    roots.iter().filter_map(|id| finished.remove(id)).collect()
}
