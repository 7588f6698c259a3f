use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Deserialize;

use super::error::{EngageError, EngageResult};
use super::ids::PostId;
use crate::db::models::{format_timestamp, parse_timestamp, PollOption};
use crate::state::DbPool;

/// Voting length as submitted: a bare number of days or text such as
/// `"3 days"`. Anything else deserializes into `Other` and means no
/// expiration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum VotingLength {
    Days(i64),
    Text(String),
    Other(serde_json::Value),
}

impl VotingLength {
    /// Positive whole days, or `None` for a poll that never expires.
    pub fn days(&self) -> Option<u32> {
        let days = match self {
            VotingLength::Days(n) => *n,
            VotingLength::Text(s) => leading_integer(s)?,
            VotingLength::Other(_) => return None,
        };
        if days > 0 {
            u32::try_from(days).ok()
        } else {
            None
        }
    }
}

/// Integer prefix of the first whitespace-separated token, so `"3days"`
/// and `"3 days"` both read as 3.
fn leading_integer(text: &str) -> Option<i64> {
    let token = text.split_whitespace().next()?;
    let sign_len = usize::from(token.starts_with(['-', '+']));
    let digits = token[sign_len..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(token.len(), |end| sign_len + end);
    token[..digits].parse().ok()
}

/// Creation instant plus `days`. A duration past the representable range
/// yields no expiration.
pub fn expiration_for(created_at: DateTime<Utc>, days: Option<u32>) -> Option<DateTime<Utc>> {
    let span = Duration::try_days(i64::from(days?))?;
    created_at.checked_add_signed(span)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollState {
    pub options: Vec<PollOption>,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub voters: i64,
}

/// Option counters and the one-vote-per-user rule for poll posts.
#[derive(Clone)]
pub struct PollEngine {
    db: DbPool,
}

impl PollEngine {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Cast `user_id`'s single vote for `label`. Every check happens before
    /// the counter moves, inside one immediate transaction.
    pub fn vote(&self, post_id: &PostId, user_id: &str, label: &str) -> EngageResult<PollState> {
        if label.trim().is_empty() {
            return Err(EngageError::Validation("Selected option is required".into()));
        }
        let mut conn = self.db.get()?;
        let now = Utc::now();
        {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let (post_type, enabled, expires_at): (String, bool, Option<String>) = tx
                .query_row(
                    "SELECT post_type, poll_enabled, poll_expires_at FROM posts WHERE id = ?1",
                    params![post_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?
                .ok_or(EngageError::NotFound)?;

            if post_type != "Poll" {
                return Err(EngageError::NotAPoll);
            }
            let expired = expires_at
                .as_deref()
                .and_then(parse_timestamp)
                .map(|at| now > at)
                .unwrap_or(false);
            if !enabled || expired {
                return Err(EngageError::PollClosed);
            }

            let already: bool = tx.query_row(
                "SELECT COUNT(*) > 0 FROM poll_voters WHERE post_id = ?1 AND user_id = ?2",
                params![post_id.as_str(), user_id],
                |row| row.get(0),
            )?;
            if already {
                return Err(EngageError::AlreadyVoted);
            }

            let bumped = tx.execute(
                "UPDATE poll_options SET votes = votes + 1 WHERE post_id = ?1 AND label = ?2",
                params![post_id.as_str(), label],
            )?;
            if bumped == 0 {
                return Err(EngageError::OptionNotFound);
            }

            tx.execute(
                "INSERT INTO poll_voters (post_id, user_id, option_label, voted_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![post_id.as_str(), user_id, label, format_timestamp(&now)],
            )?;
            tx.commit()?;
        }

        tracing::debug!("Poll vote on {} by {} for {:?}", post_id, user_id, label);
        load_state(&conn, post_id)?.ok_or(EngageError::NotFound)
    }

    /// Close the poll once its expiration instant has passed. A missing or
    /// non-poll post is a no-op. Returns whether the flag flipped.
    pub fn expire(&self, post_id: &PostId, now: DateTime<Utc>) -> EngageResult<bool> {
        let conn = self.db.get()?;
        let flipped = conn.execute(
            "UPDATE posts SET poll_enabled = 0
             WHERE id = ?1 AND post_type = 'Poll' AND poll_enabled = 1
               AND poll_expires_at IS NOT NULL AND poll_expires_at <= ?2",
            params![post_id.as_str(), format_timestamp(&now)],
        )?;
        if flipped > 0 {
            tracing::info!("Poll on post {} closed", post_id);
        } else {
            tracing::debug!("Poll expiration for {} had nothing to do", post_id);
        }
        Ok(flipped > 0)
    }

    pub fn state(&self, post_id: &PostId) -> EngageResult<PollState> {
        let conn = self.db.get()?;
        load_state(&conn, post_id)?.ok_or(EngageError::NotFound)
    }

    /// Enabled polls that still carry an expiration instant.
    pub fn open_with_expiration(&self) -> EngageResult<Vec<(PostId, DateTime<Utc>)>> {
        let conn = self.db.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, poll_expires_at FROM posts
             WHERE post_type = 'Poll' AND poll_enabled = 1 AND poll_expires_at IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, at)| Some((PostId::parse(&id).ok()?, parse_timestamp(&at)?)))
            .collect())
    }
}

pub(crate) fn insert_options(conn: &Connection, post_id: &PostId, labels: &[String]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO poll_options (post_id, position, label, votes) VALUES (?1, ?2, ?3, 0)",
    )?;
    for (position, label) in labels.iter().enumerate() {
        stmt.execute(params![post_id.as_str(), position as i64, label])?;
    }
    Ok(())
}

pub(crate) fn has_voted(conn: &Connection, post_id: &PostId, user_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM poll_voters WHERE post_id = ?1 AND user_id = ?2",
        params![post_id.as_str(), user_id],
        |row| row.get(0),
    )
}

pub(crate) fn load_state(conn: &Connection, post_id: &PostId) -> rusqlite::Result<Option<PollState>> {
    let header: Option<(bool, Option<String>)> = conn
        .query_row(
            "SELECT poll_enabled, poll_expires_at FROM posts WHERE id = ?1 AND post_type = 'Poll'",
            params![post_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((enabled, expires_at)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT label, votes FROM poll_options WHERE post_id = ?1 ORDER BY position ASC",
    )?;
    let options = stmt
        .query_map(params![post_id.as_str()], |row| {
            Ok(PollOption {
                label: row.get(0)?,
                votes: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let voters: i64 = conn.query_row(
        "SELECT COUNT(*) FROM poll_voters WHERE post_id = ?1",
        params![post_id.as_str()],
        |row| row.get(0),
    )?;

    Ok(Some(PollState {
        options,
        enabled,
        expires_at: expires_at.as_deref().and_then(parse_timestamp),
        voters,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    fn make_poll(pool: &DbPool, expires_at: Option<DateTime<Utc>>) -> PostId {
        let post = PostId::generate();
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO posts (id, user_id, title, community, post_type, poll_enabled,
                                poll_expires_at, created_at)
             VALUES (?1, 'author', 'Pick one', 'rust', 'Poll', 1, ?2, ?3)",
            params![
                post.as_str(),
                expires_at.as_ref().map(format_timestamp),
                format_timestamp(&Utc::now())
            ],
        )
        .unwrap();
        insert_options(&conn, &post, &["tabs".to_string(), "spaces".to_string()]).unwrap();
        post
    }

    fn setup() -> (DbPool, PollEngine) {
        let pool = testing::pool();
        testing::seed_user(&pool, "author", "author");
        let engine = PollEngine::new(pool.clone());
        (pool, engine)
    }

    #[test]
    fn voting_length_accepts_positive_day_counts_only() {
        assert_eq!(VotingLength::Days(3).days(), Some(3));
        assert_eq!(VotingLength::Text("3 days".into()).days(), Some(3));
        assert_eq!(VotingLength::Text("7".into()).days(), Some(7));
        assert_eq!(VotingLength::Days(0).days(), None);
        assert_eq!(VotingLength::Days(-2).days(), None);
        assert_eq!(VotingLength::Text("forever".into()).days(), None);
        assert_eq!(VotingLength::Text("".into()).days(), None);
    }

    #[test]
    fn expiration_is_creation_plus_days() {
        let created = Utc::now();
        assert_eq!(
            expiration_for(created, Some(3)),
            Some(created + Duration::days(3))
        );
        assert_eq!(expiration_for(created, None), None);
    }

    #[test]
    fn out_of_range_length_means_no_expiration() {
        assert_eq!(expiration_for(Utc::now(), Some(100_000_000)), None);
        assert_eq!(expiration_for(Utc::now(), Some(u32::MAX)), None);
    }

    #[test]
    fn voting_length_reads_leading_digits() {
        assert_eq!(VotingLength::Text("3days".into()).days(), Some(3));
        assert_eq!(VotingLength::Text("14d left".into()).days(), Some(14));
        assert_eq!(VotingLength::Text("3.5 days".into()).days(), Some(3));
        assert_eq!(VotingLength::Text("-3days".into()).days(), None);
        assert_eq!(VotingLength::Text("days3".into()).days(), None);
    }

    #[test]
    fn non_integer_lengths_deserialize_without_expiration() {
        for raw in ["3.5", "3.0", "true", "[3]", "{\"days\": 3}"] {
            let length: VotingLength = serde_json::from_str(raw).unwrap();
            assert!(matches!(length, VotingLength::Other(_)), "{raw}");
            assert_eq!(length.days(), None, "{raw}");
        }
        let length: VotingLength = serde_json::from_str("7").unwrap();
        assert_eq!(length, VotingLength::Days(7));
    }

    #[test]
    fn vote_counts_once_per_user() {
        let (pool, engine) = setup();
        let post = make_poll(&pool, Some(Utc::now() + Duration::days(3)));

        let state = engine.vote(&post, "x", "tabs").unwrap();
        assert_eq!(state.options[0].votes, 1);
        assert_eq!(state.voters, 1);

        assert!(matches!(
            engine.vote(&post, "x", "spaces"),
            Err(EngageError::AlreadyVoted)
        ));
        let after = engine.state(&post).unwrap();
        assert_eq!(after.options, state.options);
    }

    #[test]
    fn unknown_option_leaves_no_trace() {
        let (pool, engine) = setup();
        let post = make_poll(&pool, None);
        assert!(matches!(
            engine.vote(&post, "x", "vim"),
            Err(EngageError::OptionNotFound)
        ));
        let state = engine.state(&post).unwrap();
        assert_eq!(state.voters, 0);
        // The failed attempt did not consume the user's vote.
        engine.vote(&post, "x", "spaces").unwrap();
    }

    #[test]
    fn blank_selection_is_a_validation_error() {
        let (pool, engine) = setup();
        let post = make_poll(&pool, None);
        for label in ["", "   "] {
            assert!(matches!(
                engine.vote(&post, "x", label),
                Err(EngageError::Validation(_))
            ));
        }
        assert_eq!(engine.state(&post).unwrap().voters, 0);
    }

    #[test]
    fn expired_poll_rejects_votes() {
        let (pool, engine) = setup();
        let expires = Utc::now() + Duration::days(3);
        let post = make_poll(&pool, Some(expires));
        engine.vote(&post, "x", "tabs").unwrap();

        assert!(!engine.expire(&post, Utc::now()).unwrap());
        assert!(engine.expire(&post, expires + Duration::seconds(1)).unwrap());
        assert!(matches!(
            engine.vote(&post, "y", "tabs"),
            Err(EngageError::PollClosed)
        ));
        assert!(!engine.state(&post).unwrap().enabled);
    }

    #[test]
    fn past_expiration_closes_even_before_timer_fires() {
        let (pool, engine) = setup();
        let post = make_poll(&pool, Some(Utc::now() - Duration::minutes(1)));
        assert!(matches!(
            engine.vote(&post, "y", "tabs"),
            Err(EngageError::PollClosed)
        ));
    }

    #[test]
    fn poll_without_expiration_never_expires() {
        let (pool, engine) = setup();
        let post = make_poll(&pool, None);
        let far_future = Utc::now() + Duration::days(10_000);
        assert!(!engine.expire(&post, far_future).unwrap());
        engine.vote(&post, "y", "spaces").unwrap();
    }

    #[test]
    fn expire_on_missing_post_is_a_no_op() {
        let (_, engine) = setup();
        assert!(!engine.expire(&PostId::generate(), Utc::now()).unwrap());
    }

    #[test]
    fn voting_on_non_poll_is_rejected() {
        let (pool, engine) = setup();
        let post = PostId::generate();
        pool.get()
            .unwrap()
            .execute(
                "INSERT INTO posts (id, user_id, title, community, post_type, created_at)
                 VALUES (?1, 'author', 't', 'rust', 'Text', ?2)",
                params![post.as_str(), format_timestamp(&Utc::now())],
            )
            .unwrap();
        assert!(matches!(
            engine.vote(&post, "y", "tabs"),
            Err(EngageError::NotAPoll)
        ));
        assert!(matches!(
            engine.vote(&PostId::generate(), "y", "tabs"),
            Err(EngageError::NotFound)
        ));
    }

    #[test]
    fn open_with_expiration_lists_armed_polls() {
        let (pool, engine) = setup();
        let armed = make_poll(&pool, Some(Utc::now() + Duration::days(1)));
        make_poll(&pool, None);
        let open = engine.open_with_expiration().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].0, armed);
    }

    #[test]
    fn total_votes_never_exceed_voters() {
        let (pool, engine) = setup();
        let post = make_poll(&pool, None);
        for (i, user) in ["a", "b", "c", "a", "b"].iter().enumerate() {
            let label = if i % 2 == 0 { "tabs" } else { "spaces" };
            let _ = engine.vote(&post, user, label);
        }
        let state = engine.state(&post).unwrap();
        let total: i64 = state.options.iter().map(|o| o.votes).sum();
        assert_eq!(total, state.voters);
        assert_eq!(state.voters, 3);
    }
}
