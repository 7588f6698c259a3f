use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::error::{EngageError, EngageResult};
use super::ids::{ItemRef, PostId};
use super::visibility::{self, UserList};
use super::votes::{self, VoteDirection};
use super::{polls, posts};
use crate::db::models::{Attachment, PollOption, PostType};
use crate::state::DbPool;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorView {
    pub username: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollView {
    pub options: Vec<PollOption>,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub total_votes: i64,
    pub has_voted: bool,
}

/// What a given viewer sees of a post.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub id: String,
    pub title: String,
    pub community: String,
    #[serde(rename = "type")]
    pub post_type: PostType,
    /// Latest revision.
    pub content: Option<String>,
    pub revisions: usize,
    pub link: Option<String>,
    pub attachments: Vec<Attachment>,
    pub author: AuthorView,
    pub votes: i64,
    pub viewer_vote: Option<VoteDirection>,
    pub comment_count: i64,
    pub is_spoiler: bool,
    pub is_nsfw: bool,
    pub is_comments_locked: bool,
    pub is_saved: bool,
    pub is_hidden: bool,
    pub poll: Option<PollView>,
    pub created_at: DateTime<Utc>,
}

/// Read-only projection of posts for a viewer. `Ok(None)` means the post
/// exists but is suppressed for this viewer.
#[derive(Clone)]
pub struct PostAggregateView {
    db: DbPool,
}

impl PostAggregateView {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub fn compose(
        &self,
        post_id: &PostId,
        viewer_id: &str,
        include_hidden: bool,
    ) -> EngageResult<Option<PostView>> {
        let conn = self.db.get()?;
        compose_in(&conn, post_id, viewer_id, include_hidden)
    }

    /// Compose a listing. Ids that no longer resolve and suppressed posts are
    /// skipped.
    pub fn compose_many(
        &self,
        ids: &[String],
        viewer_id: &str,
        include_hidden: bool,
    ) -> EngageResult<Vec<PostView>> {
        let conn = self.db.get()?;
        let mut views = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(post_id) = PostId::parse(raw) else {
                continue;
            };
            match compose_in(&conn, &post_id, viewer_id, include_hidden) {
                Ok(Some(view)) => views.push(view),
                Ok(None) | Err(EngageError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(views)
    }
}

fn compose_in(
    conn: &Connection,
    post_id: &PostId,
    viewer_id: &str,
    include_hidden: bool,
) -> EngageResult<Option<PostView>> {
    let post = posts::load_post(conn, post_id)?.ok_or(EngageError::NotFound)?;

    let is_hidden = visibility::is_hidden_for(conn, post_id, viewer_id)?;
    if is_hidden && !include_hidden {
        return Ok(None);
    }

    let revisions = posts::revisions(conn, post_id)?;
    let author = author_of(conn, &post.user_id)?;
    let item = ItemRef::Post(post_id);

    let poll = if post.post_type == PostType::Poll {
        polls::load_state(conn, post_id)?
            .map(|state| -> rusqlite::Result<PollView> {
                let expired = state.expires_at.is_some_and(|at| Utc::now() > at);
                Ok(PollView {
                    total_votes: state.options.iter().map(|o| o.votes).sum(),
                    options: state.options,
                    enabled: state.enabled && !expired,
                    expires_at: state.expires_at,
                    has_voted: polls::has_voted(conn, post_id, viewer_id)?,
                })
            })
            .transpose()?
    } else {
        None
    };

    let comment_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM comments WHERE post_id = ?1",
        params![post_id.as_str()],
        |row| row.get(0),
    )?;

    Ok(Some(PostView {
        id: post.id,
        title: post.title,
        community: post.community,
        post_type: post.post_type,
        content: revisions.last().cloned(),
        revisions: revisions.len(),
        link: post.link,
        attachments: posts::attachments(conn, post_id)?,
        author,
        votes: votes::net_score(conn, item)?,
        viewer_vote: votes::vote_of(conn, item, viewer_id)?,
        comment_count,
        is_spoiler: post.is_spoiler,
        is_nsfw: post.is_nsfw,
        is_comments_locked: post.is_comments_locked,
        is_saved: visibility::in_list(conn, viewer_id, post_id, UserList::Saved)?,
        is_hidden,
        poll,
        created_at: post.created_at,
    }))
}

fn author_of(conn: &Connection, user_id: &str) -> rusqlite::Result<AuthorView> {
    let author = conn
        .query_row(
            "SELECT username, display_name, avatar_path FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(AuthorView {
                    username: row.get(0)?,
                    display_name: row.get(1)?,
                    avatar: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(author.unwrap_or_else(|| AuthorView {
        username: "[deleted]".to_string(),
        display_name: None,
        avatar: None,
    }))
}
