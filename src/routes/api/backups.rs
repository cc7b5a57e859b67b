use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use super::{ok, MANAGERS};
use crate::backup;
use crate::error::AppResult;
use crate::extractors::CurrentUser;
use crate::models::plugin;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/backups", get(list).post(create))
        .route("/backups/{filename}", get(download).delete(remove))
        .route("/backups/{filename}/restore", post(restore))
}

async fn list(State(state): State<AppState>, user: CurrentUser) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let backups = backup::list(&state.config.backups_path())?;
    Ok(ok(json!({ "backups": backups })))
}

async fn create(State(state): State<AppState>, user: CurrentUser) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let conn = state.db.conn()?;
    let created = backup::create(
        &state.ctx(&conn),
        &state.config.content_path(),
        &state.config.backups_path(),
    )?;
    Ok(ok(json!({ "backup": created })))
}

async fn download(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(filename): Path<String>,
) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let path = backup::get(&state.config.backups_path(), &filename)?;
    let bytes = tokio::fs::read(&path).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-tar".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    ))
}

async fn remove(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(filename): Path<String>,
) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    backup::delete(&state.config.backups_path(), &filename)?;
    Ok(ok(json!({})))
}

/// Restores the backup, then brings plugins in line with the restored
/// plugin table.
async fn restore(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(filename): Path<String>,
) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    backup::restore(
        &ctx,
        &state.config.content_path(),
        &state.config.backups_path(),
        &filename,
    )?;

    state.shutdown();
    if let Err(e) = plugin::activate_enabled(&ctx, &state.plugins) {
        tracing::warn!("Plugins did not come back after restore: {}", e);
    }
    Ok(ok(json!({})))
}
