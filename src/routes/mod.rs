pub mod api;
pub mod blog;
pub mod install;
pub mod system;

use askama::Template;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Wrapper to render askama templates as axum responses
pub struct Html<T: Template>(pub T);

impl<T: Template> IntoResponse for Html<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                body,
            )
                .into_response(),
            Err(e) => {
                tracing::error!("Template render error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Template error").into_response()
            }
        }
    }
}

/// The full site: JSON API, uploaded files, theme assets and the themed
/// front end.
pub fn app(state: AppState) -> Router {
    // Uploaded files are user content: an SVG opened directly must not run
    // script with the site's origin.
    let uploads = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("sandbox"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .service(ServeDir::new(state.config.uploads_path()));
    let themes = ServeDir::new(state.config.themes_path());
    Router::new()
        .nest("/api", api::router())
        .nest_service("/content/uploads", uploads)
        .nest_service("/content/themes", themes)
        .merge(blog::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
