use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use super::{ok, EDITORS};
use crate::auth::session;
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::models::post::{self, Post, PostInput, PostQuery};
use crate::models::user::User;
use crate::models::{history, Ctx};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/posts", get(list).post(create))
        .route("/posts/{slug}", get(show).put(update).delete(remove))
        .route("/posts/{slug}/history", get(revisions))
}

/// Editors and above may touch any post; authors only their own.
pub fn can_edit(user: &User, post: &Post) -> bool {
    session::has_role(user, EDITORS) || post.author == user.id
}

pub(super) fn editable(ctx: &Ctx<'_>, user: &User, slug: &str) -> Result<Post, AppError> {
    let post = post::get(ctx, slug)?.ok_or(AppError::NotFound)?;
    if !can_edit(user, &post) {
        return Err(AppError::Forbidden);
    }
    Ok(post)
}

async fn list(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(q): Query<PostQuery>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let (posts, pagination) = post::get_many(&state.ctx(&conn), &q)?;
    Ok(ok(json!({ "posts": posts, "pagination": pagination })))
}

async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(mut input): Json<PostInput>,
) -> AppResult<impl IntoResponse> {
    if !session::has_role(&user, EDITORS) || input.author.is_none() {
        input.author = Some(user.slug.clone());
    }

    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    let id = post::add(&ctx, &input)?;
    let created = post::get_by_id(&ctx, id)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "post": created })))
}

async fn show(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(slug): Path<String>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let found = post::get(&state.ctx(&conn), &slug)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "post": found })))
}

async fn update(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(slug): Path<String>,
    Json(mut input): Json<PostInput>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    let current = editable(&ctx, &user, &slug)?;
    if !session::has_role(&user, EDITORS) {
        input.author = None;
    }

    post::update(&ctx, &slug, &input)?;
    let updated = post::get_by_id(&ctx, current.id)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "post": updated })))
}

async fn remove(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(slug): Path<String>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    editable(&ctx, &user, &slug)?;
    post::delete(&ctx, &slug)?;
    Ok(ok(json!({})))
}

async fn revisions(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(slug): Path<String>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    let current = editable(&ctx, &user, &slug)?;
    let history = history::get_many(&ctx, current.id)?;
    Ok(ok(json!({ "history": history })))
}
