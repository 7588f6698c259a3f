use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::error::{EngageError, EngageResult};
use super::ids::PostId;
use super::polls::PollEngine;
use super::posts::{NewPost, PostService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Publish,
    ExpirePoll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJob {
    pub post_id: String,
    pub kind: JobKind,
    pub run_at: DateTime<Utc>,
}

struct Job {
    token: Uuid,
    run_at: DateTime<Utc>,
    author_id: Option<String>,
    handle: AbortHandle,
}

type JobKey = (String, JobKind);

/// One-shot timers for deferred publication and poll expiry.
///
/// Jobs live only in memory. Poll expirations are re-armed from storage on
/// startup; deferred posts that never fired are lost with the process.
#[derive(Clone)]
pub struct PublicationScheduler {
    posts: PostService,
    polls: PollEngine,
    jobs: Arc<Mutex<HashMap<JobKey, Job>>>,
}

fn delay_until(at: DateTime<Utc>) -> std::time::Duration {
    (at - Utc::now()).to_std().unwrap_or_default()
}

impl PublicationScheduler {
    pub fn new(posts: PostService, polls: PollEngine) -> Self {
        Self {
            posts,
            polls,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Commit `post` at `at`. Its poll expiration, if any, is armed from
    /// the actual publication instant.
    pub async fn schedule(&self, post: NewPost, at: DateTime<Utc>) {
        let key = (post.id.as_str().to_string(), JobKind::Publish);
        let author_id = post.author_id.clone();
        let token = Uuid::now_v7();
        let scheduler = self.clone();
        let job_key = key.clone();

        // Held across spawn and insert so the job cannot finish first.
        let mut jobs = self.jobs.lock().await;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay_until(at)).await;

            let posts = scheduler.posts.clone();
            let id = post.id.clone();
            match tokio::task::spawn_blocking(move || posts.commit(&post)).await {
                Ok(Ok(expires_at)) => {
                    tracing::info!("Scheduled post {} published", id);
                    scheduler.finish(&job_key, token).await;
                    if let Some(expires_at) = expires_at {
                        scheduler.schedule_expiration(id, expires_at).await;
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!("Scheduled post {} could not be published: {}", id, e);
                    scheduler.finish(&job_key, token).await;
                }
                Err(e) => {
                    tracing::error!("Publish job for {} panicked: {}", id, e);
                    scheduler.finish(&job_key, token).await;
                }
            }
        });

        tracing::info!("Post {} scheduled for {}", key.0, at);
        if let Some(previous) = jobs.insert(
            key,
            Job {
                token,
                run_at: at,
                author_id: Some(author_id),
                handle: task.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Disable voting on `post_id` once `at` has passed. A post deleted in
    /// the meantime makes the job a no-op.
    pub async fn schedule_expiration(&self, post_id: PostId, at: DateTime<Utc>) {
        let key = (post_id.as_str().to_string(), JobKind::ExpirePoll);
        let token = Uuid::now_v7();
        let scheduler = self.clone();
        let job_key = key.clone();

        let mut jobs = self.jobs.lock().await;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay_until(at)).await;

            let polls = scheduler.polls.clone();
            let id = post_id.clone();
            // The wall clock may trail the timer by a hair; never judge before `at`.
            let now = Utc::now().max(at);
            match tokio::task::spawn_blocking(move || polls.expire(&id, now)).await {
                Ok(Ok(true)) => tracing::info!("Poll {} closed", post_id),
                Ok(Ok(false)) => tracing::debug!("Poll {} already closed or gone", post_id),
                Ok(Err(e)) => tracing::warn!("Poll {} could not be closed: {}", post_id, e),
                Err(e) => tracing::error!("Expiry job for {} panicked: {}", post_id, e),
            }
            scheduler.finish(&job_key, token).await;
        });

        tracing::debug!("Poll {} expires at {}", key.0, at);
        if let Some(previous) = jobs.insert(
            key,
            Job {
                token,
                run_at: at,
                author_id: None,
                handle: task.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Cancel a deferred post before it publishes. Only its author may.
    pub async fn cancel(&self, post_id: &PostId, caller_id: &str) -> EngageResult<()> {
        let key = (post_id.as_str().to_string(), JobKind::Publish);
        let mut jobs = self.jobs.lock().await;
        match jobs.get(&key) {
            Some(job) if job.author_id.as_deref() == Some(caller_id) => {}
            _ => return Err(EngageError::NotFound),
        }
        if let Some(job) = jobs.remove(&key) {
            job.handle.abort();
            tracing::info!("Scheduled post {} cancelled", post_id);
        }
        Ok(())
    }

    pub async fn pending(&self) -> Vec<PendingJob> {
        let jobs = self.jobs.lock().await;
        let mut pending: Vec<PendingJob> = jobs
            .iter()
            .map(|((post_id, kind), job)| PendingJob {
                post_id: post_id.clone(),
                kind: *kind,
                run_at: job.run_at,
            })
            .collect();
        pending.sort_by_key(|job| job.run_at);
        pending
    }

    pub async fn is_pending(&self, post_id: &PostId, kind: JobKind) -> bool {
        self.jobs
            .lock()
            .await
            .contains_key(&(post_id.as_str().to_string(), kind))
    }

    /// Re-arm expirations for open polls found in storage. Polls whose
    /// deadline passed while the process was down close immediately.
    pub async fn rearm_poll_expirations(&self) -> EngageResult<usize> {
        let polls = self.polls.clone();
        let open = tokio::task::spawn_blocking(move || polls.open_with_expiration())
            .await
            .map_err(|e| EngageError::InvalidState(format!("rearm task failed: {}", e)))??;

        let count = open.len();
        for (post_id, at) in open {
            self.schedule_expiration(post_id, at).await;
        }
        tracing::info!("Re-armed {} poll expirations", count);
        Ok(count)
    }

    async fn finish(&self, key: &JobKey, token: Uuid) {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(key).is_some_and(|job| job.token == token) {
            jobs.remove(key);
        }
    }
}
