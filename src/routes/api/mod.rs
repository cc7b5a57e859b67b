//! JSON API used by the admin panel. Every response carries `success`;
//! failures come from `AppError` as `{success: false, message, code, invalid}`.

pub mod backups;
pub mod history;
pub mod import;
pub mod plugins;
pub mod posts;
pub mod session;
pub mod settings;
pub mod tags;
pub mod update;
pub mod uploads;
pub mod users;

use axum::Json;
use axum::Router;
use serde_json::{Map, Value};

use crate::models::user::Role;
use crate::state::AppState;

/// Owners and admins: site-wide configuration.
pub const MANAGERS: &[Role] = &[Role::Owner, Role::Admin];

/// Roles that may edit anyone's posts and manage tags.
pub const EDITORS: &[Role] = &[Role::Owner, Role::Admin, Role::Editor];

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(session::router())
        .merge(posts::router())
        .merge(history::router())
        .merge(tags::router())
        .merge(users::router())
        .merge(uploads::router())
        .merge(settings::router())
        .merge(backups::router())
        .merge(plugins::router())
        .merge(import::router())
        .merge(update::router())
}

/// `body` with `"success": true` added.
pub fn ok(body: Value) -> Json<Value> {
    let mut map = match body {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    map.insert("success".to_string(), Value::Bool(true));
    Json(Value::Object(map))
}
