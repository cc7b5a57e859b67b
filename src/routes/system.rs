//! The static page shown when the site can't start or a theme can't render
//! its own error page.

use askama::Template;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::Html;

#[derive(Template)]
#[template(path = "system_error.html")]
pub struct SystemErrorTemplate {
    pub title: String,
    pub message: String,
    pub detail: Option<String>,
    pub version: &'static str,
}

impl SystemErrorTemplate {
    pub fn new(title: &str, message: &str, detail: Option<String>) -> Self {
        Self {
            title: title.to_string(),
            message: message.to_string(),
            detail,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

pub fn page(status: StatusCode, title: &str, message: &str) -> Response {
    let mut response = Html(SystemErrorTemplate::new(title, message, None)).into_response();
    if response.status().is_success() {
        *response.status_mut() = status;
    }
    response
}

/// Answers every request with the startup failure. `detail` is shown to
/// whoever can reach the server, so it should not carry secrets.
pub fn router(detail: String) -> Router {
    Router::new()
        .fallback(move || {
            let detail = detail.clone();
            async move {
                let mut response = Html(SystemErrorTemplate::new(
                    "Leafpub could not start",
                    "The server hit an error while starting up. Check the logs and the configuration file, then restart.",
                    Some(detail),
                ))
                .into_response();
                *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                response
            }
        })
        .layer(TraceLayer::new_for_http())
}
