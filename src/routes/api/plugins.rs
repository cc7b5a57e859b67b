use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::{ok, MANAGERS};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::models::plugin::{self, PluginQuery};
use crate::models::Flag;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    pub dir: String,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: Flag,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/plugins", get(list).post(install))
        .route("/plugins/{dir}", put(toggle).delete(uninstall))
}

async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(q): Query<PluginQuery>,
) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    let (plugins, pagination) = plugin::get_many(&ctx, &q)?;
    let available: Vec<_> = plugin::available(&ctx, &state.config.plugins_path())?
        .into_iter()
        .map(|(dir, manifest)| json!({ "dir": dir, "manifest": manifest }))
        .collect();
    Ok(ok(json!({
        "plugins": plugins,
        "available": available,
        "pagination": pagination,
    })))
}

async fn install(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<InstallRequest>,
) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    plugin::install(&ctx, &state.config.plugins_path(), &req.dir)?;
    let installed = plugin::get(&ctx, &req.dir)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "plugin": installed })))
}

async fn toggle(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(dir): Path<String>,
    Json(req): Json<ToggleRequest>,
) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    if req.enabled.0 {
        plugin::enable(&ctx, &state.plugins, &dir)?;
    } else {
        plugin::disable(&ctx, &state.plugins, &dir)?;
    }
    let updated = plugin::get(&ctx, &dir)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "plugin": updated })))
}

async fn uninstall(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(dir): Path<String>,
) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let conn = state.db.conn()?;
    plugin::uninstall(&state.ctx(&conn), &state.plugins, &dir)?;
    Ok(ok(json!({})))
}
