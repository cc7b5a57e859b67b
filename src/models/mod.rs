pub mod history;
pub mod plugin;
pub mod post;
pub mod tag;
pub mod upload;
pub mod user;

use serde::{Deserialize, Deserializer, Serialize};

use crate::db::Conn;
use crate::events::EventBus;
use crate::settings::Settings;

/// What every model operation needs: a connection (possibly inside a
/// transaction), the loaded settings and the event bus.
#[derive(Clone, Copy)]
pub struct Ctx<'a> {
    pub conn: &'a Conn,
    pub settings: &'a Settings,
    pub events: &'a EventBus,
}

impl<'a> Ctx<'a> {
    pub fn new(conn: &'a Conn, settings: &'a Settings, events: &'a EventBus) -> Self {
        Self {
            conn,
            settings,
            events,
        }
    }
}

/// A boolean that also accepts the loose shapes forms send: `1`, `"on"`,
/// `"true"`, `"yes"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Flag(pub bool);

impl Flag {
    pub fn from_value(value: &serde_json::Value) -> bool {
        match value {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
            serde_json::Value::String(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "1" | "on" | "true" | "yes"
            ),
            _ => false,
        }
    }
}

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Flag(Flag::from_value(&value)))
    }
}

/// Comma-separated list from a query string or JSON field.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn default_page() -> i64 {
    1
}

pub(crate) fn default_items_per_page() -> i64 {
    10
}
