use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Deserialize;

use super::comments::{self, CascadeReport};
use super::error::{EngageError, EngageResult};
use super::ids::PostId;
use super::polls::{self, VotingLength};
use super::{visibility, votes};
use crate::config::LimitsConfig;
use crate::db::models::{format_timestamp, parse_timestamp, Attachment, PostRecord, PostType};
use crate::state::DbPool;

/// Submission body for a new post.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPostRequest {
    #[serde(default)]
    pub title: String,
    pub content: Option<String>,
    #[serde(default)]
    pub community: String,
    #[serde(rename = "type", default)]
    pub post_type: String,
    pub poll_options: Option<Vec<String>>,
    #[serde(alias = "pollVotingLength")]
    pub poll_voting_duration_days: Option<VotingLength>,
    pub link: Option<String>,
    pub attachments: Option<Vec<String>>,
    pub file_type: Option<String>,
    #[serde(default)]
    pub is_spoiler: bool,
    #[serde(default)]
    pub is_nsfw: bool,
    pub send_post_reply_notification: Option<bool>,
    pub scheduled_date: Option<String>,
}

/// A validated post that has not been written yet.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub id: PostId,
    pub author_id: String,
    pub title: String,
    pub community: String,
    pub post_type: PostType,
    pub content: Option<String>,
    pub link: Option<String>,
    pub attachments: Vec<Attachment>,
    pub poll_options: Vec<String>,
    pub poll_days: Option<u32>,
    pub is_spoiler: bool,
    pub is_nsfw: bool,
    pub send_reply_notifications: bool,
}

#[derive(Debug, Clone)]
pub struct PreparedPost {
    pub post: NewPost,
    /// Future publication instant, if the post is deferred.
    pub publish_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct PostService {
    db: DbPool,
    limits: LimitsConfig,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn invalid(msg: &str) -> EngageError {
    EngageError::Validation(msg.to_string())
}

/// Accepts RFC 3339 or `YYYY-MM-DD HH:MM` (UTC).
pub fn parse_schedule(raw: &str) -> EngageResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Some(dt) = parse_timestamp(raw) {
        return Ok(dt);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .map(|naive| naive.and_utc())
        .map_err(|_| invalid("scheduledDate must be RFC 3339 or YYYY-MM-DD HH:MM"))
}

impl PostService {
    pub fn new(db: DbPool, limits: LimitsConfig) -> Self {
        Self { db, limits }
    }

    /// Check the submission against the type rules. Nothing is written.
    pub fn prepare(&self, author_id: &str, req: NewPostRequest) -> EngageResult<PreparedPost> {
        let title = req.title.trim().to_string();
        let community = req.community.trim().to_string();
        if title.is_empty() || community.is_empty() {
            return Err(invalid(
                "Invalid post data. Please provide title and community",
            ));
        }
        if title.chars().count() > self.limits.title_max {
            return Err(EngageError::Validation(format!(
                "Title must be {} characters or less",
                self.limits.title_max
            )));
        }

        let post_type = PostType::parse(req.post_type.trim())
            .ok_or_else(|| invalid("Invalid post data. Please provide real post type"))?;

        let content = non_blank(req.content);
        let link = non_blank(req.link);
        let file_type = non_blank(req.file_type);
        let attachments = req.attachments.unwrap_or_default();
        let has_poll_fields = req.poll_options.is_some() || req.poll_voting_duration_days.is_some();

        if let Some(body) = &content {
            if body.chars().count() > self.limits.content_max {
                return Err(EngageError::Validation(format!(
                    "Content must be {} characters or less",
                    self.limits.content_max
                )));
            }
        }

        let mut poll_options = Vec::new();
        let mut poll_days = None;
        match post_type {
            PostType::Text => {
                if has_poll_fields || link.is_some() || !attachments.is_empty() {
                    return Err(invalid(
                        "Text posts cannot have poll options, poll voting length, link, or attachments",
                    ));
                }
            }
            PostType::Media => {
                if attachments.is_empty() || file_type.is_none() {
                    return Err(invalid(
                        "fileType and attachments are required for media posts",
                    ));
                }
                if has_poll_fields || link.is_some() || content.is_some() {
                    return Err(invalid(
                        "Media posts cannot have poll options, poll voting length, link, or content",
                    ));
                }
            }
            PostType::Link => {
                if link.is_none() {
                    return Err(invalid("link is required for link posts"));
                }
                if !attachments.is_empty() || has_poll_fields || content.is_some() {
                    return Err(invalid(
                        "Link posts cannot have attachments, poll options, poll voting length, or content",
                    ));
                }
            }
            PostType::Poll => {
                let (Some(options), Some(length)) = (req.poll_options, req.poll_voting_duration_days)
                else {
                    return Err(invalid(
                        "poll options and poll voting length are required for poll posts",
                    ));
                };
                if !attachments.is_empty() || link.is_some() {
                    return Err(invalid("Poll posts cannot have attachments or a link"));
                }
                poll_options = normalize_options(options, self.limits.poll_options_max)?;
                poll_days = length.days();
            }
        }

        let kind = file_type.unwrap_or_default();
        let attachments = attachments
            .into_iter()
            .map(|link| Attachment {
                kind: kind.clone(),
                link,
            })
            .collect();

        let publish_at = match req.scheduled_date.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => {
                let at = parse_schedule(raw)?;
                (at > Utc::now()).then_some(at)
            }
            _ => None,
        };

        Ok(PreparedPost {
            post: NewPost {
                id: PostId::generate(),
                author_id: author_id.to_string(),
                title,
                community,
                post_type,
                content,
                link,
                attachments,
                poll_options,
                poll_days,
                is_spoiler: req.is_spoiler,
                is_nsfw: req.is_nsfw,
                send_reply_notifications: req.send_post_reply_notification.unwrap_or(true),
            },
            publish_at,
        })
    }

    /// Persist the post and its owned rows in one transaction, stamped with
    /// the commit time. Returns the poll's expiration instant, if any.
    pub fn commit(&self, post: &NewPost) -> EngageResult<Option<DateTime<Utc>>> {
        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let created_at = Utc::now();
        let is_poll = post.post_type == PostType::Poll;
        let expires_at = if is_poll {
            polls::expiration_for(created_at, post.poll_days)
        } else {
            None
        };

        tx.execute(
            "INSERT INTO posts (id, user_id, title, community, post_type, link, is_spoiler,
                                is_nsfw, send_reply_notifications, poll_enabled,
                                poll_expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                post.id.as_str(),
                post.author_id,
                post.title,
                post.community,
                post.post_type.as_str(),
                post.link,
                post.is_spoiler,
                post.is_nsfw,
                post.send_reply_notifications,
                is_poll,
                expires_at.as_ref().map(format_timestamp),
                format_timestamp(&created_at)
            ],
        )?;

        if let Some(body) = &post.content {
            append_revision(&tx, &post.id, body, created_at)?;
        }
        for (position, attachment) in post.attachments.iter().enumerate() {
            tx.execute(
                "INSERT INTO post_attachments (post_id, position, kind, link) VALUES (?1, ?2, ?3, ?4)",
                params![post.id.as_str(), position as i64, attachment.kind, attachment.link],
            )?;
        }
        if is_poll {
            polls::insert_options(&tx, &post.id, &post.poll_options)?;
        }
        tx.commit()?;

        tracing::info!("Post {} published by {}", post.id, post.author_id);
        Ok(expires_at)
    }

    pub fn get(&self, post_id: &PostId) -> EngageResult<PostRecord> {
        let conn = self.db.get()?;
        load_post(&conn, post_id)?.ok_or(EngageError::NotFound)
    }

    /// Append a content revision. Only Text posts that already carry content,
    /// and Poll posts, can be edited.
    pub fn edit(&self, post_id: &PostId, caller_id: &str, content: &str) -> EngageResult<()> {
        let conn = self.db.get()?;
        let post = load_post(&conn, post_id)?.ok_or(EngageError::NotFound)?;
        if post.user_id != caller_id {
            return Err(EngageError::Forbidden(
                "User is not authorized to edit this post".into(),
            ));
        }

        match post.post_type {
            PostType::Poll => {}
            PostType::Text => {
                if revision_count(&conn, post_id)? == 0 {
                    return Err(invalid("Only posts with content can be edited"));
                }
            }
            PostType::Media | PostType::Link => {
                return Err(invalid(
                    "Invalid post type. Only Text or Poll posts can be edited",
                ));
            }
        }

        let body = content.trim();
        if body.is_empty() {
            return Err(invalid("Content cannot be empty"));
        }
        if body.chars().count() > self.limits.content_max {
            return Err(EngageError::Validation(format!(
                "Content must be {} characters or less",
                self.limits.content_max
            )));
        }

        append_revision(&conn, post_id, body, Utc::now())?;
        Ok(())
    }

    /// Author-initiated delete. Someone else's post reads as absent. The
    /// comment forest goes first; its failures are logged, not returned.
    pub fn delete(&self, post_id: &PostId, caller_id: &str) -> EngageResult<CascadeReport> {
        let conn = self.db.get()?;
        let owned: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM posts WHERE id = ?1 AND user_id = ?2",
            params![post_id.as_str(), caller_id],
            |row| row.get(0),
        )?;
        if !owned {
            return Err(EngageError::NotFound);
        }

        let report = comments::cascade_post(&conn, post_id);
        if !report.is_complete() {
            tracing::warn!(
                "Post {} deleted with {} cascade failures; orphaned comments need reconciling",
                post_id,
                report.failures
            );
        }

        conn.execute("DELETE FROM posts WHERE id = ?1", params![post_id.as_str()])?;

        if let Err(e) = votes::purge_items(&conn, "post", &[post_id.as_str().to_string()]) {
            tracing::warn!("Votes for deleted post {} left behind: {}", post_id, e);
        }
        if let Err(e) = visibility::prune_references(&conn, post_id) {
            tracing::warn!("User lists still reference deleted post {}: {}", post_id, e);
        }

        tracing::info!(
            "Deleted post {} and {} comments",
            post_id,
            report.removed
        );
        Ok(report)
    }

    pub fn ids_by_username(&self, username: &str) -> EngageResult<Vec<String>> {
        let conn = self.db.get()?;
        let user_id: String = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(EngageError::NotFound)?;
        select_ids(
            &conn,
            "SELECT id FROM posts WHERE user_id = ?1 ORDER BY created_at DESC",
            &user_id,
        )
    }

    pub fn ids_in_community(&self, community: &str) -> EngageResult<Vec<String>> {
        let conn = self.db.get()?;
        select_ids(
            &conn,
            "SELECT id FROM posts WHERE community = ?1 ORDER BY created_at DESC",
            community,
        )
    }
}

fn normalize_options(options: Vec<String>, max: usize) -> EngageResult<Vec<String>> {
    let mut labels: Vec<String> = Vec::with_capacity(options.len());
    for option in options {
        let label = option.trim().to_string();
        if label.is_empty() {
            return Err(invalid("Poll options cannot be empty"));
        }
        if labels.contains(&label) {
            return Err(invalid("Poll options must be distinct"));
        }
        labels.push(label);
    }
    if labels.len() < 2 {
        return Err(invalid("Poll posts need at least two options"));
    }
    if labels.len() > max {
        return Err(EngageError::Validation(format!(
            "Poll posts can have at most {} options",
            max
        )));
    }
    Ok(labels)
}

fn select_ids(conn: &Connection, sql: &str, key: &str) -> EngageResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![key], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn append_revision(
    conn: &Connection,
    post_id: &PostId,
    body: &str,
    at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO post_revisions (post_id, revision, body, created_at)
         VALUES (?1,
                 (SELECT COALESCE(MAX(revision), 0) + 1 FROM post_revisions WHERE post_id = ?1),
                 ?2, ?3)",
        params![post_id.as_str(), body, format_timestamp(&at)],
    )?;
    Ok(())
}

fn revision_count(conn: &Connection, post_id: &PostId) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM post_revisions WHERE post_id = ?1",
        params![post_id.as_str()],
        |row| row.get(0),
    )
}

pub(crate) fn revisions(conn: &Connection, post_id: &PostId) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT body FROM post_revisions WHERE post_id = ?1 ORDER BY revision ASC",
    )?;
    let bodies = stmt
        .query_map(params![post_id.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(bodies)
}

pub(crate) fn attachments(conn: &Connection, post_id: &PostId) -> rusqlite::Result<Vec<Attachment>> {
    let mut stmt = conn.prepare(
        "SELECT kind, link FROM post_attachments WHERE post_id = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt
        .query_map(params![post_id.as_str()], |row| {
            Ok(Attachment {
                kind: row.get(0)?,
                link: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn load_post(conn: &Connection, post_id: &PostId) -> rusqlite::Result<Option<PostRecord>> {
    conn.query_row(
        "SELECT id, user_id, title, community, post_type, link, is_spoiler, is_nsfw,
                is_comments_locked, send_reply_notifications, poll_enabled, poll_expires_at,
                created_at
         FROM posts WHERE id = ?1",
        params![post_id.as_str()],
        |row| {
            let post_type: String = row.get(4)?;
            let expires_at: Option<String> = row.get(11)?;
            let created_at: String = row.get(12)?;
            Ok(PostRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                title: row.get(2)?,
                community: row.get(3)?,
                post_type: PostType::parse(&post_type).unwrap_or(PostType::Text),
                link: row.get(5)?,
                is_spoiler: row.get(6)?,
                is_nsfw: row.get(7)?,
                is_comments_locked: row.get(8)?,
                send_reply_notifications: row.get(9)?,
                poll_enabled: row.get(10)?,
                poll_expires_at: expires_at.as_deref().and_then(parse_timestamp),
                created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
            })
        },
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use crate::engagement::comments::CommentTree;

    fn service() -> (DbPool, PostService) {
        let pool = testing::pool();
        testing::seed_user(&pool, "alice", "alice");
        testing::seed_user(&pool, "bob", "bob");
        let svc = PostService::new(pool.clone(), LimitsConfig::default());
        (pool, svc)
    }

    fn text(title: &str, content: Option<&str>) -> NewPostRequest {
        NewPostRequest {
            title: title.into(),
            content: content.map(str::to_string),
            community: "rust".into(),
            post_type: "Text".into(),
            ..Default::default()
        }
    }

    fn poll(options: &[&str], length: VotingLength) -> NewPostRequest {
        NewPostRequest {
            title: "Pick".into(),
            community: "rust".into(),
            post_type: "Poll".into(),
            poll_options: Some(options.iter().map(|s| s.to_string()).collect()),
            poll_voting_duration_days: Some(length),
            ..Default::default()
        }
    }

    fn publish(svc: &PostService, req: NewPostRequest) -> PostId {
        let prepared = svc.prepare("alice", req).unwrap();
        svc.commit(&prepared.post).unwrap();
        prepared.post.id
    }

    #[test]
    fn prepare_requires_title_and_community() {
        let (_, svc) = service();
        assert!(matches!(
            svc.prepare("alice", text("", None)),
            Err(EngageError::Validation(_))
        ));
        let mut req = text("Hello", None);
        req.community = " ".into();
        assert!(svc.prepare("alice", req).is_err());
    }

    #[test]
    fn prepare_rejects_unknown_type() {
        let (_, svc) = service();
        let mut req = text("Hello", None);
        req.post_type = "Images & Video".into();
        assert!(matches!(
            svc.prepare("alice", req),
            Err(EngageError::Validation(_))
        ));
    }

    #[test]
    fn text_posts_forbid_poll_and_link_fields() {
        let (_, svc) = service();
        let mut req = text("Hello", Some("body"));
        req.poll_options = Some(vec!["a".into(), "b".into()]);
        assert!(svc.prepare("alice", req).is_err());

        let mut req = text("Hello", Some("body"));
        req.link = Some("https://example.com".into());
        assert!(svc.prepare("alice", req).is_err());

        assert!(svc.prepare("alice", text("Hello", None)).is_ok());
    }

    #[test]
    fn media_posts_need_attachments_and_file_type() {
        let (_, svc) = service();
        let base = NewPostRequest {
            title: "Pics".into(),
            community: "rust".into(),
            post_type: "Media".into(),
            attachments: Some(vec!["https://cdn/x.png".into()]),
            file_type: Some("image".into()),
            ..Default::default()
        };
        let prepared = svc.prepare("alice", base.clone()).unwrap();
        assert_eq!(prepared.post.attachments[0].kind, "image");

        let mut no_type = base.clone();
        no_type.file_type = None;
        assert!(svc.prepare("alice", no_type).is_err());

        let mut with_content = base;
        with_content.content = Some("words".into());
        assert!(svc.prepare("alice", with_content).is_err());
    }

    #[test]
    fn link_posts_need_a_link_and_nothing_else() {
        let (_, svc) = service();
        let base = NewPostRequest {
            title: "Read".into(),
            community: "rust".into(),
            post_type: "Link".into(),
            link: Some("https://example.com".into()),
            ..Default::default()
        };
        assert!(svc.prepare("alice", base.clone()).is_ok());

        let mut missing = base.clone();
        missing.link = None;
        assert!(svc.prepare("alice", missing).is_err());

        let mut with_content = base;
        with_content.content = Some("words".into());
        assert!(svc.prepare("alice", with_content).is_err());
    }

    #[test]
    fn poll_posts_need_options_and_length() {
        let (_, svc) = service();
        let prepared = svc
            .prepare("alice", poll(&["a", "b"], VotingLength::Text("3 days".into())))
            .unwrap();
        assert_eq!(prepared.post.poll_days, Some(3));

        let mut missing_length = poll(&["a", "b"], VotingLength::Days(1));
        missing_length.poll_voting_duration_days = None;
        assert!(svc.prepare("alice", missing_length).is_err());

        assert!(svc.prepare("alice", poll(&["a"], VotingLength::Days(1))).is_err());
        assert!(svc.prepare("alice", poll(&["a", "a"], VotingLength::Days(1))).is_err());
    }

    #[test]
    fn invalid_voting_length_means_no_expiration() {
        let (_, svc) = service();
        let prepared = svc
            .prepare("alice", poll(&["a", "b"], VotingLength::Text("soon".into())))
            .unwrap();
        assert_eq!(prepared.post.poll_days, None);
        assert_eq!(svc.commit(&prepared.post).unwrap(), None);
    }

    #[test]
    fn overlong_voting_length_commits_without_expiration() {
        let (_, svc) = service();
        let prepared = svc
            .prepare("alice", poll(&["a", "b"], VotingLength::Days(100_000_000)))
            .unwrap();
        assert_eq!(prepared.post.poll_days, Some(100_000_000));
        assert_eq!(svc.commit(&prepared.post).unwrap(), None);

        let record = svc.get(&prepared.post.id).unwrap();
        assert!(record.poll_enabled);
        assert_eq!(record.poll_expires_at, None);
    }

    #[test]
    fn commit_persists_poll_with_expiration() {
        let (_, svc) = service();
        let prepared = svc
            .prepare("alice", poll(&["a", "b"], VotingLength::Days(3)))
            .unwrap();
        let before = Utc::now();
        let expires = svc.commit(&prepared.post).unwrap().unwrap();
        assert!(expires >= before + chrono::Duration::days(3));

        let record = svc.get(&prepared.post.id).unwrap();
        assert!(record.poll_enabled);
        assert_eq!(record.post_type, PostType::Poll);
    }

    #[test]
    fn scheduled_date_in_future_defers_publication() {
        let (_, svc) = service();
        let mut req = text("Later", None);
        req.scheduled_date = Some((Utc::now() + chrono::Duration::hours(1)).to_rfc3339());
        assert!(svc.prepare("alice", req).unwrap().publish_at.is_some());

        let mut past = text("Now", None);
        past.scheduled_date = Some("2001-01-01 10:00".into());
        assert!(svc.prepare("alice", past).unwrap().publish_at.is_none());

        let mut garbage = text("Bad", None);
        garbage.scheduled_date = Some("next tuesday".into());
        assert!(svc.prepare("alice", garbage).is_err());
    }

    #[test]
    fn edit_appends_revisions_for_author_only() {
        let (pool, svc) = service();
        let id = publish(&svc, text("Hello", Some("v1")));
        svc.edit(&id, "alice", "v2").unwrap();
        assert!(matches!(
            svc.edit(&id, "bob", "v3"),
            Err(EngageError::Forbidden(_))
        ));
        let conn = pool.get().unwrap();
        assert_eq!(revisions(&conn, &id).unwrap(), vec!["v1", "v2"]);
    }

    #[test]
    fn edit_rejects_text_posts_without_content() {
        let (_, svc) = service();
        let id = publish(&svc, text("Title only", None));
        assert!(matches!(
            svc.edit(&id, "alice", "late body"),
            Err(EngageError::Validation(_))
        ));
    }

    #[test]
    fn delete_cascades_and_hides_ownership() {
        let (pool, svc) = service();
        let id = publish(&svc, text("Hello", Some("body")));
        let tree = CommentTree::new(pool.clone(), 500);
        let root = tree.add(&id, None, "bob", "root").unwrap();
        let root_id = crate::engagement::ids::CommentId::parse(&root.id).unwrap();
        tree.add(&id, Some(&root_id), "alice", "reply").unwrap();

        assert!(matches!(svc.delete(&id, "bob"), Err(EngageError::NotFound)));

        let report = svc.delete(&id, "alice").unwrap();
        assert_eq!(report.removed, 2);
        assert!(matches!(svc.get(&id), Err(EngageError::NotFound)));

        let conn = pool.get().unwrap();
        let left: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM comments WHERE post_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(left, 0);
        assert!(revisions(&conn, &id).unwrap().is_empty());
    }

    #[test]
    fn listings_by_user_and_community() {
        let (_, svc) = service();
        let id = publish(&svc, text("Hello", None));
        assert_eq!(svc.ids_by_username("alice").unwrap(), vec![id.as_str().to_string()]);
        assert!(svc.ids_by_username("bob").unwrap().is_empty());
        assert!(matches!(
            svc.ids_by_username("nobody"),
            Err(EngageError::NotFound)
        ));
        assert_eq!(svc.ids_in_community("rust").unwrap().len(), 1);
    }
}
