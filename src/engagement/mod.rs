pub mod capabilities;
pub mod comments;
pub mod error;
pub mod ids;
pub mod polls;
pub mod posts;
pub mod scheduler;
pub mod view;
pub mod visibility;
pub mod votes;

pub use error::{EngageError, EngageResult};

use serde::Serialize;

use crate::config::LimitsConfig;
use crate::state::DbPool;
use comments::CommentTree;
use ids::PostId;
use polls::PollEngine;
use posts::{NewPostRequest, PostService};
use scheduler::PublicationScheduler;
use view::{PostAggregateView, PostView};
use visibility::VisibilityStateMachine;
use votes::VoteLedger;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPost {
    pub post_id: String,
    pub scheduled: bool,
}

/// All engagement components over one pool.
#[derive(Clone)]
pub struct Engagement {
    pub posts: PostService,
    pub votes: VoteLedger,
    pub comments: CommentTree,
    pub polls: PollEngine,
    pub visibility: VisibilityStateMachine,
    pub scheduler: PublicationScheduler,
    pub view: PostAggregateView,
}

impl Engagement {
    pub fn new(db: DbPool, limits: LimitsConfig) -> Self {
        let posts = PostService::new(db.clone(), limits);
        let polls = PollEngine::new(db.clone());
        Self {
            scheduler: PublicationScheduler::new(posts.clone(), polls.clone()),
            posts,
            votes: VoteLedger::new(db.clone()),
            comments: CommentTree::new(db.clone(), limits.comment_max),
            polls,
            visibility: VisibilityStateMachine::new(db.clone()),
            view: PostAggregateView::new(db),
        }
    }

    /// Validate and either publish now or hand the post to the scheduler.
    /// Must run inside a tokio runtime.
    pub async fn create_post(
        &self,
        author_id: &str,
        req: NewPostRequest,
    ) -> EngageResult<CreatedPost> {
        let prepared = self.posts.prepare(author_id, req)?;
        let post_id = prepared.post.id.clone();

        if let Some(at) = prepared.publish_at {
            self.scheduler.schedule(prepared.post, at).await;
            return Ok(CreatedPost {
                post_id: post_id.to_string(),
                scheduled: true,
            });
        }

        if let Some(expires_at) = self.posts.commit(&prepared.post)? {
            self.scheduler
                .schedule_expiration(post_id.clone(), expires_at)
                .await;
        }
        Ok(CreatedPost {
            post_id: post_id.to_string(),
            scheduled: false,
        })
    }

    /// A direct fetch: the post is returned even if the viewer hid it, and
    /// lands in the viewer's recent list.
    pub fn open_post(&self, post_id: &PostId, viewer_id: &str) -> EngageResult<PostView> {
        let view = self
            .view
            .compose(post_id, viewer_id, true)?
            .ok_or(EngageError::NotFound)?;
        if let Err(e) = self.visibility.record_visit(post_id, viewer_id) {
            tracing::warn!("Could not record visit to {}: {}", post_id, e);
        }
        Ok(view)
    }
}
