use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::engagement::visibility::UserList;
use crate::engagement::votes::VoteDirection;
use crate::error::AppResult;
use crate::extractors::CurrentUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/posts/saved", get(saved))
        .route("/posts/hidden", get(hidden))
        .route("/posts/recent", get(recent))
        .route("/posts/upvoted", get(upvoted))
        .route("/posts/downvoted", get(downvoted))
        .route("/user/{username}/posts", get(by_user))
        .route("/community/{name}/posts", get(by_community))
}

fn render(state: &AppState, user: &CurrentUser, ids: &[String], include_hidden: bool) -> AppResult<Response> {
    let views = state
        .engagement
        .view
        .compose_many(ids, &user.id, include_hidden)?;
    Ok(Json(views).into_response())
}

async fn saved(State(state): State<AppState>, user: CurrentUser) -> AppResult<Response> {
    let ids = state.engagement.visibility.list(&user.id, UserList::Saved)?;
    render(&state, &user, &ids, false)
}

async fn hidden(State(state): State<AppState>, user: CurrentUser) -> AppResult<Response> {
    let ids = state.engagement.visibility.list(&user.id, UserList::Hidden)?;
    render(&state, &user, &ids, true)
}

async fn recent(State(state): State<AppState>, user: CurrentUser) -> AppResult<Response> {
    let ids = state.engagement.visibility.list(&user.id, UserList::Recent)?;
    render(&state, &user, &ids, false)
}

async fn upvoted(State(state): State<AppState>, user: CurrentUser) -> AppResult<Response> {
    let ids = state
        .engagement
        .votes
        .posts_voted_by(&user.id, VoteDirection::Up)?;
    render(&state, &user, &ids, false)
}

async fn downvoted(State(state): State<AppState>, user: CurrentUser) -> AppResult<Response> {
    let ids = state
        .engagement
        .votes
        .posts_voted_by(&user.id, VoteDirection::Down)?;
    render(&state, &user, &ids, false)
}

async fn by_user(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(username): Path<String>,
) -> AppResult<Response> {
    let ids = state.engagement.posts.ids_by_username(&username)?;
    render(&state, &user, &ids, false)
}

async fn by_community(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(name): Path<String>,
) -> AppResult<Response> {
    let ids = state.engagement.posts.ids_in_community(&name)?;
    render(&state, &user, &ids, false)
}
