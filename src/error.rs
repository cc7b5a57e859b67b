use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::auth::session::SessionError;
use crate::backup::BackupError;
use crate::db::DbError;
use crate::import::ImportError;
use crate::models::history::HistoryError;
use crate::models::post::PostError;
use crate::models::tag::TagError;
use crate::models::upload::UploadError;
use crate::models::user::UserError;
use crate::plugins::PluginError;
use crate::render::RenderError;
use crate::settings::SettingsError;
use crate::update::UpdateError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found")]
    NotFound,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A model refused the request; `code` and `field` come from its error.
    #[error("{message}")]
    Rejected {
        status: StatusCode,
        message: String,
        code: u16,
        field: Option<String>,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    fn rejected(
        status: StatusCode,
        err: &impl std::fmt::Display,
        code: u16,
        field: Option<&str>,
    ) -> Self {
        AppError::Rejected {
            status,
            message: err.to_string(),
            code,
            field: field.map(str::to_string),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Rejected { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, code, field) = match self {
            AppError::NotFound => ("Not found".to_string(), 0, None),
            AppError::Unauthorized => ("Unauthorized".to_string(), 0, None),
            AppError::Forbidden => ("Forbidden".to_string(), 0, None),
            AppError::BadRequest(msg) => (msg, 0, None),
            AppError::Rejected {
                message,
                code,
                field,
                ..
            } => (message, code, field),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                ("Internal server error".to_string(), 100, None)
            }
            AppError::Db(e) => {
                tracing::error!("Database error: {}", e);
                ("Internal server error".to_string(), 100, None)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ("Internal server error".to_string(), 100, None)
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                ("Internal server error".to_string(), 100, None)
            }
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                ("Internal server error".to_string(), 100, None)
            }
        };

        let invalid: Vec<String> = field.into_iter().collect();
        let body = json!({
            "success": false,
            "message": message,
            "code": code,
            "invalid": invalid,
        });
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<PostError> for AppError {
    fn from(e: PostError) -> Self {
        let status = match e {
            PostError::NotFound => StatusCode::NOT_FOUND,
            PostError::AlreadyExists => StatusCode::CONFLICT,
            PostError::Tag(t) => return t.into(),
            PostError::History(h) => return h.into(),
            PostError::Database(e) => return e.into(),
            _ => StatusCode::BAD_REQUEST,
        };
        AppError::rejected(status, &e, e.code(), e.field())
    }
}

impl From<TagError> for AppError {
    fn from(e: TagError) -> Self {
        let status = match e {
            TagError::NotFound => StatusCode::NOT_FOUND,
            TagError::AlreadyExists => StatusCode::CONFLICT,
            TagError::Database(e) => return e.into(),
            _ => StatusCode::BAD_REQUEST,
        };
        AppError::rejected(status, &e, e.code(), e.field())
    }
}

impl From<UserError> for AppError {
    fn from(e: UserError) -> Self {
        let status = match e {
            UserError::NotFound => StatusCode::NOT_FOUND,
            UserError::AlreadyExists | UserError::EmailInUse | UserError::OwnerExists => {
                StatusCode::CONFLICT
            }
            UserError::Hash(e) => return AppError::Internal(e.to_string()),
            UserError::Database(e) => return e.into(),
            _ => StatusCode::BAD_REQUEST,
        };
        AppError::rejected(status, &e, e.code(), e.field())
    }
}

impl From<UploadError> for AppError {
    fn from(e: UploadError) -> Self {
        let status = match e {
            UploadError::NotFound => StatusCode::NOT_FOUND,
            UploadError::Io(e) => return e.into(),
            UploadError::Tag(t) => return t.into(),
            UploadError::Database(e) => return e.into(),
            _ => StatusCode::BAD_REQUEST,
        };
        AppError::rejected(status, &e, e.code(), e.field())
    }
}

impl From<HistoryError> for AppError {
    fn from(e: HistoryError) -> Self {
        match e {
            HistoryError::NotFound => {
                AppError::rejected(StatusCode::NOT_FOUND, &e, e.code(), None)
            }
            HistoryError::Data(e) => e.into(),
            HistoryError::Database(e) => e.into(),
        }
    }
}

impl From<PluginError> for AppError {
    fn from(e: PluginError) -> Self {
        let status = match e {
            PluginError::NotFound(_) | PluginError::NotInstalled(_) => StatusCode::NOT_FOUND,
            PluginError::AlreadyInstalled(_) => StatusCode::CONFLICT,
            PluginError::Io(e) => return e.into(),
            PluginError::Database(e) => return e.into(),
            _ => StatusCode::BAD_REQUEST,
        };
        AppError::rejected(status, &e, e.code(), Some("dir"))
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidLogin => {
                AppError::rejected(StatusCode::UNAUTHORIZED, &e, e.code(), Some("password"))
            }
            SessionError::NotAuthenticated | SessionError::Token(_) => AppError::Unauthorized,
            SessionError::Forbidden => AppError::Forbidden,
            SessionError::MissingKey => AppError::Internal(e.to_string()),
            SessionError::User(u) => u.into(),
        }
    }
}

impl From<SettingsError> for AppError {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::Database(e) => e.into(),
            _ => AppError::rejected(StatusCode::BAD_REQUEST, &e, e.code(), e.field()),
        }
    }
}

impl From<RenderError> for AppError {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::Cache(e) => e.into(),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<BackupError> for AppError {
    fn from(e: BackupError) -> Self {
        let status = match e {
            BackupError::NotFound(_) => StatusCode::NOT_FOUND,
            BackupError::InvalidName(_)
            | BackupError::MissingTable(_)
            | BackupError::InvalidData { .. } => StatusCode::BAD_REQUEST,
            BackupError::Io(e) => return e.into(),
            BackupError::Database(e) => return e.into(),
            BackupError::Settings(e) => return e.into(),
            BackupError::Json(e) => return e.into(),
            BackupError::Walk(e) => return AppError::Internal(e.to_string()),
        };
        AppError::rejected(status, &e, e.code(), Some("filename"))
    }
}

impl From<ImportError> for AppError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Post(e) => e.into(),
            ImportError::Tag(e) => e.into(),
            ImportError::User(e) => e.into(),
            ImportError::Database(e) => e.into(),
            other => AppError::rejected(StatusCode::BAD_REQUEST, &other, other.code(), None),
        }
    }
}

impl From<UpdateError> for AppError {
    fn from(e: UpdateError) -> Self {
        tracing::warn!("Update check failed: {}", e);
        AppError::rejected(StatusCode::BAD_GATEWAY, &e, e.code(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn response_status(err: AppError) -> StatusCode {
        let response = err.into_response();
        response.status()
    }

    async fn response_json(err: AppError) -> serde_json::Value {
        let body = to_bytes(err.into_response().into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn not_found_returns_404() {
        assert_eq!(response_status(AppError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            response_status(PostError::NotFound.into()),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn unauthorized_returns_401() {
        assert_eq!(
            response_status(AppError::Unauthorized),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            response_status(SessionError::NotAuthenticated.into()),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn bad_request_returns_400() {
        assert_eq!(
            response_status(AppError::BadRequest("oops".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            response_status(UserError::PasswordTooShort.into()),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn duplicates_return_409() {
        assert_eq!(
            response_status(TagError::AlreadyExists.into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            response_status(UserError::EmailInUse.into()),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn internal_returns_500() {
        assert_eq!(
            response_status(AppError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            response_status(PostError::Database(rusqlite::Error::InvalidQuery).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn nested_errors_keep_their_own_status() {
        let err: AppError = PostError::Tag(TagError::NotFound).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejection_body_names_the_invalid_field() {
        let body = response_json(UserError::InvalidEmail.into()).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], 3);
        assert_eq!(body["invalid"], json!(["email"]));
        assert_eq!(body["message"], "Invalid email address");
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let body = response_json(AppError::Internal("secret path /etc".into())).await;
        assert_eq!(body["message"], "Internal server error");
        assert_eq!(body["invalid"], json!([]));
    }
}
