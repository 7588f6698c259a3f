use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::db::models::format_timestamp;
use crate::engagement::ids::{CommentId, ItemRef, PostId};
use crate::engagement::votes::VoteDirection;
use crate::error::AppResult;
use crate::extractors::CurrentUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/post/{id}/comments", get(thread).post(add_comment))
        .route("/comment/{id}", delete(delete_comment))
        .route("/comment/{id}/upvote", post(upvote))
        .route("/comment/{id}/downvote", post(downvote))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCommentRequest {
    pub content: String,
    pub parent_id: Option<String>,
}

async fn thread(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let post_id = PostId::parse(&id)?;
    let forest = state.engagement.comments.thread(&post_id)?;
    Ok(Json(forest).into_response())
}

async fn add_comment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<NewCommentRequest>,
) -> AppResult<Response> {
    let post_id = PostId::parse(&id)?;
    let parent_id = req
        .parent_id
        .as_deref()
        .map(CommentId::parse)
        .transpose()?;

    let comment = state.engagement.comments.add(
        &post_id,
        parent_id.as_ref(),
        &user.id,
        &req.content,
    )?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": comment.id,
            "postId": comment.post_id,
            "parentId": comment.parent_id,
            "username": user.username,
            "content": comment.body,
            "votes": 0,
            "createdAt": format_timestamp(&comment.created_at),
        })),
    )
        .into_response())
}

async fn delete_comment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let comment_id = CommentId::parse(&id)?;
    let report = state.engagement.comments.delete(&comment_id, &user.id)?;
    Ok(Json(json!({
        "message": "Comment deleted successfully",
        "deleted": report.removed,
    }))
    .into_response())
}

async fn vote(state: &AppState, user: &CurrentUser, id: &str, direction: VoteDirection) -> AppResult<Response> {
    let comment_id = CommentId::parse(id)?;
    let votes = state
        .engagement
        .votes
        .apply_vote(ItemRef::Comment(&comment_id), &user.id, direction)?;
    Ok(Json(json!({ "votes": votes })).into_response())
}

async fn upvote(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    vote(&state, &user, &id, VoteDirection::Up).await
}

async fn downvote(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    vote(&state, &user, &id, VoteDirection::Down).await
}
