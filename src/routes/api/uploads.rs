use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use super::ok;
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::models::upload::{self, UploadInput, UploadQuery};
use crate::state::AppState;

/// Largest request accepted for a batch of uploads.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/uploads",
            get(list)
                .post(create)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/uploads/{id}", get(show).put(update).delete(remove))
}

async fn list(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(q): Query<UploadQuery>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let (uploads, pagination) = upload::get_many(&state.ctx(&conn), &q)?;
    Ok(ok(json!({ "uploads": uploads, "pagination": pagination })))
}

/// Every file part of the form is stored. One bad file fails the request
/// but keeps the files stored before it.
async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        files.push((name, bytes));
    }
    if files.is_empty() {
        return Err(AppError::BadRequest("No files were uploaded".to_string()));
    }

    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    let content = state.config.content_path();
    let mut uploaded = Vec::with_capacity(files.len());
    for (name, bytes) in &files {
        let id = upload::add(&ctx, &content, name, bytes)?;
        if let Some(stored) = upload::get(&ctx, id)? {
            uploaded.push(stored);
        }
    }
    tracing::info!(user = %user.slug, count = uploaded.len(), "Files uploaded");
    Ok(ok(json!({ "uploads": uploaded })))
}

async fn show(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let found = upload::get(&state.ctx(&conn), id)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "upload": found })))
}

async fn update(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(id): Path<i64>,
    Json(input): Json<UploadInput>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    upload::update(&ctx, id, &input)?;
    let updated = upload::get(&ctx, id)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "upload": updated })))
}

async fn remove(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    if !upload::delete(&state.ctx(&conn), &state.config.content_path(), id)? {
        return Err(AppError::NotFound);
    }
    Ok(ok(json!({})))
}
