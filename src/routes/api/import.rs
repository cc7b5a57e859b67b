use axum::body::Bytes;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use serde_json::json;

use super::{ok, MANAGERS};
use crate::error::AppResult;
use crate::extractors::CurrentUser;
use crate::import;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/import", post(run))
}

/// Imports a JSON export; posts without an author go to the importing user.
async fn run(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    current.require(MANAGERS)?;
    let user = current.0;
    let doc = import::parse(&body)?;
    let conn = state.db.conn()?;
    let summary = import::run(&state.ctx(&conn), &doc, &user.slug)?;
    tracing::info!(user = %user.slug, ?summary, "Import finished");
    Ok(ok(json!({ "summary": summary })))
}
