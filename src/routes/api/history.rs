use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use super::ok;
use super::posts::can_edit;
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::models::history::{self, Revision};
use crate::models::user::User;
use crate::models::{post, Ctx};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/history/{id}", get(show).delete(remove))
        .route("/history/{id}/restore", post(restore))
}

/// The revision, if `user` may edit the post it belongs to.
fn revision(ctx: &Ctx<'_>, user: &User, id: i64) -> Result<Revision, AppError> {
    let revision = history::get(ctx, id)?.ok_or(AppError::NotFound)?;
    let owner = post::get_by_id(ctx, revision.post)?.ok_or(AppError::NotFound)?;
    if !can_edit(user, &owner) {
        return Err(AppError::Forbidden);
    }
    Ok(revision)
}

async fn show(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let found = revision(&state.ctx(&conn), &user, id)?;
    Ok(ok(json!({ "history": found })))
}

async fn remove(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    revision(&ctx, &user, id)?;
    history::delete(&ctx, id)?;
    Ok(ok(json!({})))
}

async fn restore(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    revision(&ctx, &user, id)?;
    let slug = post::restore_revision(&ctx, id)?;
    let restored = post::get(&ctx, &slug)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "post": restored })))
}
