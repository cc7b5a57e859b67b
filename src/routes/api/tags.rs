use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use super::{ok, EDITORS};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::models::tag::{self, TagInput, TagQuery};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tags", get(list).post(create))
        .route("/tags/{slug}", get(show).put(update).delete(remove))
}

async fn list(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(q): Query<TagQuery>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let (tags, pagination) = tag::get_many(&state.ctx(&conn), &q)?;
    Ok(ok(json!({ "tags": tags, "pagination": pagination })))
}

async fn create(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(input): Json<TagInput>,
) -> AppResult<impl IntoResponse> {
    user.require(EDITORS)?;
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    let id = tag::add(&ctx, &input)?;
    let created = tag::get_all(&ctx)?
        .into_iter()
        .find(|t| t.id == id)
        .ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "tag": created })))
}

async fn show(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(slug): Path<String>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let found = tag::get(&state.ctx(&conn), &slug)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "tag": found })))
}

async fn update(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(slug): Path<String>,
    Json(input): Json<TagInput>,
) -> AppResult<impl IntoResponse> {
    user.require(EDITORS)?;
    let conn = state.db.conn()?;
    tag::update(&state.ctx(&conn), &slug, &input)?;
    Ok(ok(json!({})))
}

async fn remove(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(slug): Path<String>,
) -> AppResult<impl IntoResponse> {
    user.require(EDITORS)?;
    let conn = state.db.conn()?;
    if !tag::delete(&state.ctx(&conn), &slug)? {
        return Err(AppError::NotFound);
    }
    Ok(ok(json!({})))
}
