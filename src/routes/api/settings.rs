use std::collections::BTreeMap;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde_json::{json, Value};

use super::{ok, MANAGERS};
use crate::error::{AppError, AppResult};
use crate::events::Event;
use crate::extractors::CurrentUser;
use crate::render::theme;
use crate::state::AppState;

/// Settings that only the server itself writes.
pub const PRIVATE: &[&str] = &["auth_key"];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/settings", get(show).put(update))
        .route("/settings/cache", delete(clear_cache))
        .route("/themes", get(themes))
}

/// Form posts send strings; JSON clients may send numbers and booleans.
fn as_setting(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(true) => Some("on".to_string()),
        Value::Bool(false) => Some("off".to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

pub fn changes(body: &BTreeMap<String, Value>) -> Result<BTreeMap<String, String>, AppError> {
    body.iter()
        .map(|(name, value)| {
            if PRIVATE.contains(&name.as_str()) {
                return Err(AppError::BadRequest(format!("{} can't be changed", name)));
            }
            let value = as_setting(value)
                .ok_or_else(|| AppError::BadRequest(format!("Invalid value for {}", name)))?;
            Ok((name.clone(), value))
        })
        .collect()
}

async fn show(State(state): State<AppState>, user: CurrentUser) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    Ok(ok(json!({ "settings": state.settings.public() })))
}

async fn update(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<BTreeMap<String, Value>>,
) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let changes = changes(&body)?;

    if let Some(name) = changes.get("theme") {
        let installed = theme::list(&state.config.themes_path())?;
        if !installed.iter().any(|t| &t.dir == name) {
            return Err(AppError::BadRequest(format!("Theme not installed: {}", name)));
        }
    }

    let conn = state.db.conn()?;
    let names = state.settings.update(&conn, &changes)?;
    if !names.is_empty() {
        tracing::info!(user = %user.0.slug, ?names, "Settings updated");
        state.events.publish(Event::SettingsUpdated { names });
    }
    Ok(ok(json!({ "settings": state.settings.public() })))
}

async fn clear_cache(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let removed = state.renderer.clear_cache()?;
    tracing::info!("Cleared {} cached templates", removed);
    Ok(ok(json!({ "removed": removed })))
}

async fn themes(State(state): State<AppState>, user: CurrentUser) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let themes = theme::list(&state.config.themes_path())?;
    Ok(ok(json!({ "themes": themes, "active": state.settings.get("theme") })))
}
