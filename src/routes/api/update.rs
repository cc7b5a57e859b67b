use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;

use super::{ok, MANAGERS};
use crate::error::AppResult;
use crate::extractors::CurrentUser;
use crate::update;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/update", get(check))
}

async fn check(State(state): State<AppState>, user: CurrentUser) -> AppResult<impl IntoResponse> {
    user.require(MANAGERS)?;
    let status = update::check(&state.config.update.repository).await?;
    Ok(ok(json!({ "update": status })))
}
