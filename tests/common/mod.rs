#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use leafpub::auth::session;
use leafpub::config::Config;
use leafpub::models::user::{self, UserInput};
use leafpub::routes;
use leafpub::state::AppState;

pub const PASSWORD: &str = "correct horse";

/// An installed site in a temp dir with an owner called `owner`.
pub struct Site {
    pub dir: TempDir,
    pub state: AppState,
}

impl Site {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.database.prefix = "test_".to_string();
        config.resolve_paths(dir.path());

        let state = AppState::init(config).expect("Failed to start site");
        let conn = state.db.conn().unwrap();
        state
            .settings
            .set(&conn, "auth_key", &session::generate_key())
            .unwrap();
        let site = Self { dir, state };
        site.add_user("owner", "owner");
        site
    }

    pub fn app(&self) -> Router {
        routes::app(self.state.clone())
    }

    pub fn add_user(&self, slug: &str, role: &str) {
        let conn = self.state.db.conn().unwrap();
        user::add(
            &self.state.ctx(&conn),
            &UserInput {
                slug: Some(slug.to_string()),
                name: Some(format!("{} name", slug)),
                email: Some(format!("{}@example.com", slug)),
                password: Some(PASSWORD.to_string()),
                role: Some(role.to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    }

    /// Sign in through the API and return the cookie to send back.
    pub async fn login(&self, slug: &str) -> String {
        let body = serde_json::json!({ "username": slug, "password": PASSWORD });
        let response = self
            .app()
            .oneshot(json_request("POST", "/api/login", None, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }
}

pub fn json_request(method: &str, uri: &str, cookie: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("response is not JSON")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn send(app: Router, request: Request<Body>) -> Reply {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    Reply {
        status,
        headers,
        body,
    }
}
