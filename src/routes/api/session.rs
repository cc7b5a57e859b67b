use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Duration;
use serde::Deserialize;
use serde_json::json;

use super::ok;
use crate::auth::session;
use crate::error::AppResult;
use crate::extractors::CurrentUser;
use crate::models::Flag;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub remember: Flag,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/logout", get(logout).post(logout))
        .route("/session", get(current))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    let auth = &state.config.auth;
    let lifetime = if req.remember.0 {
        Duration::days(auth.remember_days)
    } else {
        Duration::hours(auth.session_hours)
    };

    let conn = state.db.conn()?;
    let (user, token) = session::login(&state.ctx(&conn), &req.username, &req.password, lifetime)?;

    Ok((
        [(
            header::SET_COOKIE,
            session::cookie(&auth.cookie_name, &token, lifetime),
        )],
        ok(json!({ "user": user })),
    ))
}

async fn logout(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    session::logout(&state.ctx(&conn), &user);
    Ok((
        [(
            header::SET_COOKIE,
            session::clear_cookie(&state.config.auth.cookie_name),
        )],
        ok(json!({})),
    ))
}

async fn current(CurrentUser(user): CurrentUser) -> AppResult<impl IntoResponse> {
    Ok(ok(json!({ "user": user })))
}
