//! Install mode: served while no config file exists. Every path redirects to
//! the install form; a successful install writes the config and asks the
//! server to restart in normal mode.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use askama::Template;
use axum::extract::State;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Form, Router};
use serde::Deserialize;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;

use super::Html;
use crate::auth::session;
use crate::config::Config;
use crate::datetime;
use crate::models::user::{self, UserError, UserInput};
use crate::settings::SettingsError;
use crate::state::{AppState, StartupError};

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("The passwords don't match")]
    PasswordMismatch,

    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("Table prefixes may only contain letters, numbers and underscores")]
    InvalidPrefix,

    #[error("{0}")]
    Startup(#[from] StartupError),

    #[error("{0}")]
    User(#[from] UserError),

    #[error("{0}")]
    Settings(#[from] SettingsError),

    #[error("Could not write the config file: {0}")]
    Save(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallForm {
    pub title: String,
    pub name: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
    pub timezone: String,
    pub db_prefix: String,
}

impl Default for InstallForm {
    fn default() -> Self {
        Self {
            title: "A Leafpub Blog".to_string(),
            name: String::new(),
            username: String::new(),
            email: String::new(),
            password: String::new(),
            password_confirm: String::new(),
            timezone: "UTC".to_string(),
            db_prefix: Config::default().database.prefix,
        }
    }
}

#[derive(Template)]
#[template(path = "install.html")]
pub struct InstallTemplate {
    pub form: InstallForm,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct InstallState {
    pub config: Arc<Config>,
    pub config_path: Arc<PathBuf>,
    pub restart: Arc<Notify>,
}

fn valid_prefix(prefix: &str) -> bool {
    prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Create the database, settings and owner, then write the config file.
/// The config is written last so a failed install can simply be retried.
pub fn install(
    mut config: Config,
    config_path: &Path,
    form: &InstallForm,
) -> Result<AppState, InstallError> {
    if form.password != form.password_confirm {
        return Err(InstallError::PasswordMismatch);
    }
    let timezone = match form.timezone.trim() {
        "" => "UTC",
        tz => tz,
    };
    datetime::timezone(timezone).map_err(|_| InstallError::InvalidTimezone(timezone.to_string()))?;
    if !valid_prefix(&form.db_prefix) {
        return Err(InstallError::InvalidPrefix);
    }
    config.database.prefix = form.db_prefix.clone();

    let state = AppState::init(config)?;
    let conn = state.db.conn().map_err(StartupError::from)?;

    let changes: BTreeMap<String, String> = [
        ("title".to_string(), form.title.clone()),
        ("timezone".to_string(), timezone.to_string()),
    ]
    .into_iter()
    .collect();
    state.settings.update(&conn, &changes)?;
    state
        .settings
        .set(&conn, "auth_key", &session::generate_key())?;

    user::add(
        &state.ctx(&conn),
        &UserInput {
            slug: Some(form.username.clone()),
            name: Some(form.name.clone()),
            email: Some(form.email.clone()),
            password: Some(form.password.clone()),
            role: Some("owner".to_string()),
            ..Default::default()
        },
    )?;

    state
        .config
        .save(config_path)
        .map_err(|e| InstallError::Save(e.to_string()))?;
    tracing::info!(config = %config_path.display(), owner = %form.username, "Installed");
    Ok(state)
}

pub fn router(config: Config, config_path: PathBuf, restart: Arc<Notify>) -> Router {
    let state = InstallState {
        config: Arc::new(config),
        config_path: Arc::new(config_path),
        restart,
    };
    Router::new()
        .route("/install", get(form).post(submit))
        .fallback(|| async { Redirect::to("/install") })
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn form() -> Html<InstallTemplate> {
    Html(InstallTemplate {
        form: InstallForm::default(),
        error: None,
    })
}

async fn submit(State(state): State<InstallState>, Form(form): Form<InstallForm>) -> Response {
    match install((*state.config).clone(), &state.config_path, &form) {
        Ok(installed) => {
            installed.shutdown();
            state.restart.notify_one();
            Redirect::to("/").into_response()
        }
        Err(e) => {
            tracing::warn!("Install failed: {}", e);
            Html(InstallTemplate {
                form: InstallForm {
                    password: String::new(),
                    password_confirm: String::new(),
                    ..form
                },
                error: Some(e.to_string()),
            })
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_config;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    fn filled() -> InstallForm {
        InstallForm {
            title: "My Blog".into(),
            name: "Jane Doe".into(),
            username: "jane".into(),
            email: "jane@example.com".into(),
            password: "correct horse".into(),
            password_confirm: "correct horse".into(),
            timezone: "Europe/Berlin".into(),
            db_prefix: "lp_".into(),
        }
    }

    #[test]
    fn install_seeds_everything_and_writes_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let state = install(test_config(tmp.path()), &path, &filled()).unwrap();

        assert!(path.is_file());
        assert_eq!(state.settings.get("title").as_deref(), Some("My Blog"));
        assert_eq!(state.settings.get("timezone").as_deref(), Some("Europe/Berlin"));
        assert_eq!(state.settings.get("auth_key").map(|k| k.len()), Some(64));

        let conn = state.db.conn().unwrap();
        let owner = user::get_owner(&state.ctx(&conn)).unwrap().unwrap();
        assert_eq!(owner.slug, "jane");

        let saved: Config = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.database.prefix, "lp_");
    }

    #[test]
    fn bad_forms_leave_no_config_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");

        let mismatch = InstallForm {
            password_confirm: "something else".into(),
            ..filled()
        };
        assert!(matches!(
            install(test_config(tmp.path()), &path, &mismatch),
            Err(InstallError::PasswordMismatch)
        ));

        let bad_tz = InstallForm {
            timezone: "Mars/Olympus".into(),
            ..filled()
        };
        assert!(matches!(
            install(test_config(tmp.path()), &path, &bad_tz),
            Err(InstallError::InvalidTimezone(_))
        ));

        let short = InstallForm {
            password: "short".into(),
            password_confirm: "short".into(),
            ..filled()
        };
        assert!(matches!(
            install(test_config(tmp.path()), &path, &short),
            Err(InstallError::User(UserError::PasswordTooShort))
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn every_path_redirects_to_the_form() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(
            test_config(tmp.path()),
            tmp.path().join("config.toml"),
            Arc::new(Notify::new()),
        );

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/some/post").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/install");

        let response = app
            .oneshot(Request::builder().uri("/install").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn successful_submit_requests_a_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let restart = Arc::new(Notify::new());
        let path = tmp.path().join("config.toml");
        let app = router(test_config(tmp.path()), path.clone(), restart.clone());

        let body = "title=Blog&name=Jane&username=jane&email=jane%40example.com\
                    &password=correct+horse&password_confirm=correct+horse\
                    &timezone=UTC&db_prefix=lp_";
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/install")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert!(path.is_file());
        // notify_one stores a permit, so this resolves immediately
        restart.notified().await;
    }
}
