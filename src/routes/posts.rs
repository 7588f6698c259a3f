use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::engagement::ids::{ItemRef, PostId};
use crate::engagement::posts::NewPostRequest;
use crate::engagement::visibility::PostFlag;
use crate::engagement::votes::VoteDirection;
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/post", post(create_post))
        .route(
            "/post/{id}",
            get(get_post).patch(edit_post).delete(delete_post),
        )
        .route("/post/{id}/schedule", delete(cancel_scheduled))
        .route("/post/{id}/upvote", post(upvote))
        .route("/post/{id}/downvote", post(downvote))
        .route("/post/{id}/save", post(save))
        .route("/post/{id}/unsave", post(unsave))
        .route("/post/{id}/hide", post(hide))
        .route("/post/{id}/unhide", post(unhide))
        .route("/post/{id}/recent", delete(remove_recent))
        .route("/post/{id}/spoiler", post(spoiler))
        .route("/post/{id}/unspoiler", post(unspoiler))
        .route("/post/{id}/nsfw", post(nsfw))
        .route("/post/{id}/unnsfw", post(unnsfw))
        .route("/post/{id}/lock", post(lock))
        .route("/post/{id}/unlock", post(unlock))
        .route("/post/{id}/poll/vote", post(poll_vote))
}

#[derive(Deserialize)]
pub struct EditRequest {
    pub content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollVoteRequest {
    #[serde(default)]
    pub selected_option: Option<String>,
}

fn message(text: &str) -> Json<serde_json::Value> {
    Json(json!({ "message": text }))
}

async fn create_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<NewPostRequest>,
) -> AppResult<Response> {
    let created = state.engagement.create_post(&user.id, req).await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn get_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let post_id = PostId::parse(&id)?;
    let view = state.engagement.open_post(&post_id, &user.id)?;
    Ok(Json(view).into_response())
}

async fn edit_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<EditRequest>,
) -> AppResult<Response> {
    let post_id = PostId::parse(&id)?;
    let engagement = &state.engagement;
    engagement.posts.edit(&post_id, &user.id, &req.content)?;
    let view = engagement
        .view
        .compose(&post_id, &user.id, true)?
        .ok_or(AppError::NotFound)?;
    Ok(Json(view).into_response())
}

async fn delete_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let post_id = PostId::parse(&id)?;
    let report = state.engagement.posts.delete(&post_id, &user.id)?;
    Ok(Json(json!({
        "message": "Post deleted successfully",
        "deletedComments": report.removed,
    }))
    .into_response())
}

async fn cancel_scheduled(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let post_id = PostId::parse(&id)?;
    state.engagement.scheduler.cancel(&post_id, &user.id).await?;
    Ok(message("Scheduled post cancelled").into_response())
}

async fn vote(state: &AppState, user: &CurrentUser, id: &str, direction: VoteDirection) -> AppResult<Response> {
    let post_id = PostId::parse(id)?;
    let votes = state
        .engagement
        .votes
        .apply_vote(ItemRef::Post(&post_id), &user.id, direction)?;
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

async fn save(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    state.engagement.visibility.save(&PostId::parse(&id)?, &user.id)?;
    Ok(message("Post saved successfully").into_response())
}

async fn unsave(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    state.engagement.visibility.unsave(&PostId::parse(&id)?, &user.id)?;
    Ok(message("Post unsaved successfully").into_response())
}

async fn hide(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    state.engagement.visibility.hide(&PostId::parse(&id)?, &user.id)?;
    Ok(message("Post hidden successfully").into_response())
}

async fn unhide(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    state.engagement.visibility.unhide(&PostId::parse(&id)?, &user.id)?;
    Ok(message("Post unhidden successfully").into_response())
}

async fn remove_recent(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    state
        .engagement
        .visibility
        .remove_recent(&PostId::parse(&id)?, &user.id)?;
    Ok(message("Post removed from recent successfully").into_response())
}

async fn set_flag(
    state: &AppState,
    user: &CurrentUser,
    id: &str,
    flag: PostFlag,
    value: bool,
) -> AppResult<Response> {
    let post_id = PostId::parse(id)?;
    state
        .engagement
        .visibility
        .set_flag(&post_id, &user.id, flag, value)?;
    Ok(message("Post updated successfully").into_response())
}

async fn spoiler(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    set_flag(&state, &user, &id, PostFlag::Spoiler, true).await
}

async fn unspoiler(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    set_flag(&state, &user, &id, PostFlag::Spoiler, false).await
}

async fn nsfw(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    set_flag(&state, &user, &id, PostFlag::Nsfw, true).await
}

async fn unnsfw(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    set_flag(&state, &user, &id, PostFlag::Nsfw, false).await
}

async fn lock(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    set_flag(&state, &user, &id, PostFlag::CommentsLocked, true).await
}

async fn unlock(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    set_flag(&state, &user, &id, PostFlag::CommentsLocked, false).await
}

async fn poll_vote(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<PollVoteRequest>,
) -> AppResult<Response> {
    let post_id = PostId::parse(&id)?;
    let engagement = &state.engagement;
    engagement
        .polls
        .vote(&post_id, &user.id, req.selected_option.as_deref().unwrap_or_default().trim())?;
    let poll = engagement
        .view
        .compose(&post_id, &user.id, true)?
        .and_then(|view| view.poll)
        .ok_or(AppError::NotFound)?;
    Ok(Json(poll).into_response())
}
