//! Site settings: a flat name → value table loaded wholesale into memory.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono_tz::Tz;
use rusqlite::params;

use crate::datetime;
use crate::db::Conn;
use crate::slug;

/// Defaults seeded at install and filled in for any missing row at boot.
pub const DEFAULTS: &[(&str, &str)] = &[
    ("auth_key", ""),
    ("cover", ""),
    ("favicon", ""),
    ("frag_admin", "admin"),
    ("frag_author", "author"),
    ("frag_blog", "blog"),
    ("frag_feed", "feed"),
    ("frag_page", "page"),
    ("frag_search", "search"),
    ("frag_tag", "tag"),
    ("generator", "on"),
    ("hbs_escaping", "on"),
    ("head_code", ""),
    ("foot_code", ""),
    ("homepage", ""),
    ("language", "en-us"),
    ("logo", ""),
    ("maintenance", "off"),
    ("maintenance_message", ""),
    ("navigation", "[]"),
    ("posts_per_page", "10"),
    ("tagline", "Go forth and create!"),
    ("theme", "default"),
    ("timezone", "UTC"),
    ("title", "A Leafpub Blog"),
    ("twitter_card", "summary_large_image"),
];

/// Setting names that are URL fragments.
pub const FRAGMENTS: &[&str] = &[
    "frag_admin",
    "frag_author",
    "frag_blog",
    "frag_feed",
    "frag_page",
    "frag_search",
    "frag_tag",
];

/// Slugs reserved regardless of configuration.
pub const RESERVED_SLUGS: &[&str] = &["api", "content", "install"];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("{0} must be a positive number")]
    InvalidNumber(String),

    #[error("{0} must be a unique, non-empty URL fragment")]
    InvalidFragment(String),

    #[error("Unknown setting: {0}")]
    Unknown(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl SettingsError {
    pub fn code(&self) -> u16 {
        match self {
            SettingsError::InvalidTimezone(_) => 1,
            SettingsError::InvalidNumber(_) => 2,
            SettingsError::InvalidFragment(_) => 3,
            SettingsError::Unknown(_) => 4,
            SettingsError::Database(_) => 100,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            SettingsError::InvalidTimezone(_) => Some("timezone"),
            SettingsError::InvalidNumber(name)
            | SettingsError::InvalidFragment(name)
            | SettingsError::Unknown(name) => Some(name),
            SettingsError::Database(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Settings {
    values: RwLock<BTreeMap<String, String>>,
}

impl Settings {
    /// Load every row, seeding any default that is missing.
    pub fn load(conn: &Conn) -> Result<Self, SettingsError> {
        let settings = Self::default();
        settings.reload(conn)?;

        let missing: Vec<(&str, &str)> = {
            let values = settings.read();
            DEFAULTS
                .iter()
                .filter(|(name, _)| !values.contains_key(*name))
                .copied()
                .collect()
        };
        for (name, value) in missing {
            conn.execute(
                "INSERT OR IGNORE INTO __settings (name, value) VALUES (?1, ?2)",
                params![name, value],
            )?;
            settings.write().insert(name.to_string(), value.to_string());
        }

        Ok(settings)
    }

    /// Replace the in-memory copy with what the database holds.
    pub fn reload(&self, conn: &Conn) -> Result<(), SettingsError> {
        let mut stmt = conn.prepare("SELECT name, value FROM __settings")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        *self.write() = rows;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.values.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.values.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.read().get(name).cloned()
    }

    pub fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    pub fn all(&self) -> BTreeMap<String, String> {
        self.read().clone()
    }

    /// Every setting except secrets, for templates and the API.
    pub fn public(&self) -> BTreeMap<String, String> {
        let mut values = self.all();
        values.remove("auth_key");
        values
    }

    pub fn is_on(&self, name: &str) -> bool {
        self.get(name).as_deref() == Some("on")
    }

    pub fn timezone(&self) -> Tz {
        self.get("timezone")
            .and_then(|name| datetime::timezone(&name).ok())
            .unwrap_or(Tz::UTC)
    }

    pub fn posts_per_page(&self) -> i64 {
        self.get("posts_per_page")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10)
    }

    pub fn fragment(&self, name: &str) -> String {
        let key = format!("frag_{}", name);
        self.get(&key).unwrap_or_else(|| {
            DEFAULTS
                .iter()
                .find(|(n, _)| *n == key)
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| name.to_string())
        })
    }

    /// Reserved slugs plus every configured fragment.
    pub fn protected_slugs(&self) -> Vec<String> {
        let values = self.read();
        RESERVED_SLUGS
            .iter()
            .map(|s| s.to_string())
            .chain(FRAGMENTS.iter().filter_map(|f| values.get(*f).cloned()))
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Validate and persist a batch of changes, then refresh memory.
    pub fn update(
        &self,
        conn: &Conn,
        changes: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, SettingsError> {
        let mut merged = self.all();
        for (name, value) in changes {
            if !merged.contains_key(name) && !DEFAULTS.iter().any(|(n, _)| n == name) {
                return Err(SettingsError::Unknown(name.clone()));
            }
            merged.insert(name.clone(), value.trim().to_string());
        }
        validate(&merged)?;

        conn.transaction(|c| {
            for name in changes.keys() {
                c.execute(
                    "INSERT INTO __settings (name, value) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                    params![name, merged[name]],
                )?;
            }
            Ok::<_, SettingsError>(())
        })?;

        *self.write() = merged;
        Ok(changes.keys().cloned().collect())
    }

    /// Write a single value without validation (install, internal keys).
    pub fn set(&self, conn: &Conn, name: &str, value: &str) -> Result<(), SettingsError> {
        conn.execute(
            "INSERT INTO __settings (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![name, value],
        )?;
        self.write().insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn delete(&self, conn: &Conn, name: &str) -> Result<bool, SettingsError> {
        let rows = conn.execute("DELETE FROM __settings WHERE name = ?1", params![name])?;
        self.write().remove(name);
        Ok(rows > 0)
    }
}

fn validate(values: &BTreeMap<String, String>) -> Result<(), SettingsError> {
    if let Some(tz) = values.get("timezone") {
        datetime::timezone(tz).map_err(|_| SettingsError::InvalidTimezone(tz.clone()))?;
    }

    if let Some(per_page) = values.get("posts_per_page") {
        match per_page.parse::<i64>() {
            Ok(n) if n >= 1 => {}
            _ => return Err(SettingsError::InvalidNumber("posts_per_page".into())),
        }
    }

    let mut seen = Vec::new();
    for name in FRAGMENTS {
        if let Some(value) = values.get(*name) {
            if value.is_empty() || slug::slugify(value) != *value || seen.contains(value) {
                return Err(SettingsError::InvalidFragment(name.to_string()));
            }
            seen.push(value.clone());
        }
    }

    Ok(())
}
