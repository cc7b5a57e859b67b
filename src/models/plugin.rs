//! Installed plugins. Manifests are read from `content/plugins/<dir>/plugin.json`;
//! install/enable state lives in the database.

use std::path::Path;

use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::datetime;
use crate::events::Event;
use crate::models::{default_items_per_page, default_page, Ctx};
use crate::plugins::{PluginError, PluginRegistry};
use crate::query::{self, Filter, Pagination};

pub const MANIFEST: &str = "plugin.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    /// Semver requirement on the application version, e.g. `>=0.1`.
    #[serde(default)]
    pub requires: String,
    #[serde(default)]
    pub license: String,
    #[serde(default, alias = "image")]
    pub img: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub is_admin_plugin: bool,
    #[serde(default)]
    pub is_middleware: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginRecord {
    pub id: i64,
    pub name: String,
    pub author: String,
    pub description: String,
    pub version: String,
    pub requires: String,
    pub license: String,
    pub dir: String,
    pub img: String,
    pub link: String,
    pub is_admin_plugin: bool,
    pub is_middleware: bool,
    pub install_date: String,
    pub enable_date: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginQuery {
    pub query: Option<String>,
    pub enabled: Option<bool>,
    pub page: i64,
    pub items_per_page: i64,
}

impl Default for PluginQuery {
    fn default() -> Self {
        Self {
            query: None,
            enabled: None,
            page: default_page(),
            items_per_page: default_items_per_page(),
        }
    }
}

const COLUMNS: &str = "id, name, author, description, version, requires, license, dir, img, \
                       link, is_admin_plugin, is_middleware, install_date, enable_date, enabled";

fn from_row(row: &Row<'_>) -> rusqlite::Result<PluginRecord> {
    Ok(PluginRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        author: row.get(2)?,
        description: row.get(3)?,
        version: row.get(4)?,
        requires: row.get(5)?,
        license: row.get(6)?,
        dir: row.get(7)?,
        img: row.get(8)?,
        link: row.get(9)?,
        is_admin_plugin: row.get(10)?,
        is_middleware: row.get(11)?,
        install_date: row.get(12)?,
        enable_date: row.get(13)?,
        enabled: row.get(14)?,
    })
}

fn normalize(ctx: &Ctx<'_>, mut record: PluginRecord) -> PluginRecord {
    let tz = ctx.settings.timezone();
    if let Ok(local) = datetime::utc_to_local(&record.install_date, tz) {
        record.install_date = local;
    }
    record.enable_date = record
        .enable_date
        .map(|d| datetime::utc_to_local(&d, tz).unwrap_or(d));
    record
}

pub fn read_manifest(plugins_dir: &Path, dir: &str) -> Result<Manifest, PluginError> {
    let invalid = |message: String| PluginError::InvalidManifest {
        dir: dir.to_string(),
        message,
    };
    if dir.is_empty() || dir.contains(['/', '\\']) || dir.starts_with('.') {
        return Err(PluginError::NotFound(dir.to_string()));
    }
    let path = plugins_dir.join(dir).join(MANIFEST);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PluginError::NotFound(dir.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;
    if manifest.name.trim().is_empty() {
        return Err(invalid("name is required".into()));
    }
    Ok(manifest)
}

/// Every directory under `plugins_dir` with a readable manifest. Broken
/// manifests are logged and skipped.
pub fn scan(plugins_dir: &Path) -> Result<Vec<(String, Manifest)>, PluginError> {
    let entries = match std::fs::read_dir(plugins_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let dir = entry.file_name().to_string_lossy().into_owned();
        match read_manifest(plugins_dir, &dir) {
            Ok(manifest) => found.push((dir, manifest)),
            Err(PluginError::NotFound(_)) => {}
            Err(e) => tracing::warn!(plugin = %dir, "Skipping plugin: {}", e),
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

fn check_requires(dir: &str, requires: &str) -> Result<(), PluginError> {
    let requires = requires.trim();
    if requires.is_empty() {
        return Ok(());
    }
    let incompatible = || PluginError::Incompatible {
        dir: dir.to_string(),
        requires: requires.to_string(),
    };
    let req = semver::VersionReq::parse(requires).map_err(|_| incompatible())?;
    let running = semver::Version::parse(env!("CARGO_PKG_VERSION")).map_err(|_| incompatible())?;
    if req.matches(&running) {
        Ok(())
    } else {
        Err(incompatible())
    }
}

pub fn get(ctx: &Ctx<'_>, dir: &str) -> Result<Option<PluginRecord>, PluginError> {
    let record = ctx
        .conn
        .query_row(
            &format!("SELECT {} FROM __plugins WHERE dir = ?1", COLUMNS),
            params![dir],
            from_row,
        )
        .optional()?;
    Ok(record.map(|r| normalize(ctx, r)))
}

pub fn get_many(
    ctx: &Ctx<'_>,
    q: &PluginQuery,
) -> Result<(Vec<PluginRecord>, Pagination), PluginError> {
    let mut filter = Filter::new();
    if let Some(text) = q.query.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = query::like_pattern(text);
        filter.push(
            "(name LIKE ? ESCAPE '\\' OR description LIKE ? ESCAPE '\\' OR author LIKE ? ESCAPE '\\')",
            [
                query::text(pattern.clone()),
                query::text(pattern.clone()),
                query::text(pattern),
            ],
        );
    }
    if let Some(enabled) = q.enabled {
        filter.push("enabled = ?", [query::int(enabled as i64)]);
    }

    let total: i64 = ctx.conn.query_row(
        &format!("SELECT COUNT(*) FROM __plugins{}", filter.sql()),
        params_from_iter(filter.params()),
        |row| row.get(0),
    )?;
    let pagination = Pagination::new(total, q.items_per_page, q.page);

    let mut stmt = ctx.conn.prepare(&format!(
        "SELECT {} FROM __plugins{} ORDER BY name ASC LIMIT ? OFFSET ?",
        COLUMNS,
        filter.sql()
    ))?;
    let plugins = stmt
        .query_map(params_from_iter(filter.paged_params(&pagination)), from_row)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|r| normalize(ctx, r))
        .collect();

    Ok((plugins, pagination))
}

/// Manifests on disk that aren't installed yet.
pub fn available(ctx: &Ctx<'_>, plugins_dir: &Path) -> Result<Vec<(String, Manifest)>, PluginError> {
    let mut available = Vec::new();
    for (dir, manifest) in scan(plugins_dir)? {
        if get(ctx, &dir)?.is_none() {
            available.push((dir, manifest));
        }
    }
    Ok(available)
}

pub fn install(ctx: &Ctx<'_>, plugins_dir: &Path, dir: &str) -> Result<i64, PluginError> {
    if get(ctx, dir)?.is_some() {
        return Err(PluginError::AlreadyInstalled(dir.to_string()));
    }
    let manifest = read_manifest(plugins_dir, dir)?;
    check_requires(dir, &manifest.requires)?;

    ctx.conn.execute(
        "INSERT INTO __plugins (name, author, description, version, requires, license, dir,
                                img, link, is_admin_plugin, is_middleware, install_date, enabled)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)",
        params![
            manifest.name,
            manifest.author,
            manifest.description,
            manifest.version,
            manifest.requires,
            manifest.license,
            dir,
            manifest.img,
            manifest.link,
            manifest.is_admin_plugin,
            manifest.is_middleware,
            datetime::now_utc(),
        ],
    )?;
    tracing::info!(plugin = %dir, version = %manifest.version, "Plugin installed");
    Ok(ctx.conn.last_insert_rowid())
}

pub fn enable(ctx: &Ctx<'_>, registry: &PluginRegistry, dir: &str) -> Result<(), PluginError> {
    let record = get(ctx, dir)?.ok_or_else(|| PluginError::NotInstalled(dir.to_string()))?;
    if record.enabled {
        return registry.activate(dir, ctx.events);
    }
    registry.activate(dir, ctx.events)?;
    if let Err(e) = ctx.conn.execute(
        "UPDATE __plugins SET enabled = 1, enable_date = ?1 WHERE dir = ?2",
        params![datetime::now_utc(), dir],
    ) {
        let _ = registry.deactivate(dir, ctx.events);
        return Err(e.into());
    }
    ctx.events.publish(Event::PluginEnabled {
        dir: dir.to_string(),
    });
    Ok(())
}

pub fn disable(ctx: &Ctx<'_>, registry: &PluginRegistry, dir: &str) -> Result<(), PluginError> {
    let record = get(ctx, dir)?.ok_or_else(|| PluginError::NotInstalled(dir.to_string()))?;
    if registry.is_registered(dir) {
        registry.deactivate(dir, ctx.events)?;
    }
    if record.enabled {
        ctx.conn.execute(
            "UPDATE __plugins SET enabled = 0, enable_date = NULL WHERE dir = ?1",
            params![dir],
        )?;
        ctx.events.publish(Event::PluginDisabled {
            dir: dir.to_string(),
        });
    }
    Ok(())
}

pub fn uninstall(ctx: &Ctx<'_>, registry: &PluginRegistry, dir: &str) -> Result<(), PluginError> {
    disable(ctx, registry, dir)?;
    ctx.conn
        .execute("DELETE FROM __plugins WHERE dir = ?1", params![dir])?;
    tracing::info!(plugin = %dir, "Plugin uninstalled");
    Ok(())
}

/// Activate every plugin the database marks enabled. Failures are logged
/// and leave the rest running.
pub fn activate_enabled(ctx: &Ctx<'_>, registry: &PluginRegistry) -> Result<usize, PluginError> {
    let (enabled, _) = get_many(
        ctx,
        &PluginQuery {
            enabled: Some(true),
            items_per_page: 10_000,
            ..Default::default()
        },
    )?;
    let mut activated = 0;
    for record in enabled {
        match registry.activate(&record.dir, ctx.events) {
            Ok(()) => activated += 1,
            Err(e) => tracing::warn!(plugin = %record.dir, "Enabled plugin not started: {}", e),
        }
    }
    Ok(activated)
}
