//! Site backups: every table dumped to `data/<table>.json` plus the content
//! directory, in one tar file.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use walkdir::WalkDir;

use crate::datetime;
use crate::db::TABLES;
use crate::events::Event;
use crate::models::Ctx;
use crate::slug;

pub const EXTENSION: &str = "tar";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Invalid backup name: {0}")]
    InvalidName(String),

    #[error("Backup is missing data for table {0}")]
    MissingTable(String),

    #[error("Backup data for {table} is invalid: {message}")]
    InvalidData { table: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not walk content directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] crate::settings::SettingsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackupError {
    pub fn code(&self) -> u16 {
        match self {
            BackupError::NotFound(_) => 1,
            BackupError::InvalidName(_) => 2,
            BackupError::MissingTable(_) => 3,
            BackupError::InvalidData { .. } => 4,
            _ => 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub filename: String,
    pub date: String,
    pub size: u64,
}

fn info(path: &Path) -> Result<BackupInfo, BackupError> {
    let meta = std::fs::metadata(path)?;
    let date: DateTime<Utc> = meta.modified()?.into();
    Ok(BackupInfo {
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        date: date.format(datetime::FORMAT).to_string(),
        size: meta.len(),
    })
}

/// Resolve `filename` inside `backups_dir`, refusing anything that could
/// point elsewhere.
fn resolve(backups_dir: &Path, filename: &str) -> Result<PathBuf, BackupError> {
    let valid = !filename.is_empty()
        && !filename.starts_with('.')
        && !filename.contains(['/', '\\'])
        && filename.ends_with(&format!(".{}", EXTENSION));
    if !valid {
        return Err(BackupError::InvalidName(filename.to_string()));
    }
    Ok(backups_dir.join(filename))
}

/// First free `<title-slug>.<YYYY_MM_DD>[_n].tar` in `backups_dir`.
pub fn next_filename(backups_dir: &Path, title: &str, date: &DateTime<Utc>) -> String {
    let base = match slug::slugify(title) {
        s if s.is_empty() => "backup".to_string(),
        s => s,
    };
    let stem = format!("{}.{}", base, date.format("%Y_%m_%d"));
    let mut name = format!("{}.{}", stem, EXTENSION);
    let mut n = 1;
    while backups_dir.join(&name).exists() {
        name = format!("{}_{}.{}", stem, n, EXTENSION);
        n += 1;
    }
    name
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Every row of `table` as a JSON object, in rowid order.
pub fn dump_table(ctx: &Ctx<'_>, table: &str) -> Result<Vec<Map<String, Value>>, BackupError> {
    let mut stmt = ctx
        .conn
        .prepare(&format!("SELECT * FROM {} ORDER BY rowid", ctx.conn.table(table)))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let rows = stmt
        .query_map([], |row| {
            let mut object = Map::new();
            for (i, column) in columns.iter().enumerate() {
                object.insert(column.clone(), sql_to_json(row.get_ref(i)?));
            }
            Ok(object)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn table_columns(ctx: &Ctx<'_>, table: &str) -> Result<Vec<String>, BackupError> {
    let mut stmt = ctx
        .conn
        .prepare(&format!("PRAGMA table_info({})", ctx.conn.table(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn append_bytes<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    bytes: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)
}

fn write_archive(ctx: &Ctx<'_>, content_dir: &Path, target: &Path) -> Result<(), BackupError> {
    let mut builder = tar::Builder::new(File::create(target)?);

    for table in TABLES {
        let rows = dump_table(ctx, table)?;
        let json = serde_json::to_vec_pretty(&rows)?;
        append_bytes(&mut builder, &format!("data/{}.json", table), &json)?;
    }

    if content_dir.is_dir() {
        let walker = WalkDir::new(content_dir).min_depth(1).into_iter();
        for entry in walker.filter_entry(|e| {
            let top_level_cache = e.depth() == 1 && e.file_name() == "cache";
            !top_level_cache && e.file_name() != ".DS_Store"
        }) {
            let entry = entry?;
            let Ok(relative) = entry.path().strip_prefix(content_dir) else {
                continue;
            };
            let name = Path::new("content").join(relative);
            if entry.file_type().is_dir() {
                builder.append_dir(&name, entry.path())?;
            } else if entry.file_type().is_file() {
                builder.append_path_with_name(entry.path(), &name)?;
            }
        }
    }

    builder.into_inner()?.sync_all()?;
    Ok(())
}

/// Write a new backup and return its details.
pub fn create(
    ctx: &Ctx<'_>,
    content_dir: &Path,
    backups_dir: &Path,
) -> Result<BackupInfo, BackupError> {
    std::fs::create_dir_all(backups_dir)?;
    let title = ctx.settings.get_or("title", "backup");
    let filename = next_filename(backups_dir, &title, &Utc::now());
    let target = backups_dir.join(&filename);

    if let Err(e) = write_archive(ctx, content_dir, &target) {
        let _ = std::fs::remove_file(&target);
        return Err(e);
    }

    let info = info(&target)?;
    tracing::info!(backup = %filename, size = info.size, "Backup created");
    ctx.events.publish(Event::BackupCreated { filename });
    Ok(info)
}

/// Newest first.
pub fn list(backups_dir: &Path) -> Result<Vec<BackupInfo>, BackupError> {
    let entries = match std::fs::read_dir(backups_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut backups = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == EXTENSION) {
            backups.push(info(&path)?);
        }
    }
    backups.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.filename.cmp(&a.filename)));
    Ok(backups)
}

/// Path of an existing backup, for download.
pub fn get(backups_dir: &Path, filename: &str) -> Result<PathBuf, BackupError> {
    let path = resolve(backups_dir, filename)?;
    if path.is_file() {
        Ok(path)
    } else {
        Err(BackupError::NotFound(filename.to_string()))
    }
}

pub fn delete(backups_dir: &Path, filename: &str) -> Result<bool, BackupError> {
    let path = resolve(backups_dir, filename)?;
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(backup = %filename, "Backup deleted");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_tables(extracted: &Path) -> Result<Vec<(&'static str, Vec<Map<String, Value>>)>, BackupError> {
    let mut tables = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        let path = extracted.join("data").join(format!("{}.json", table));
        let raw = std::fs::read(&path).map_err(|_| BackupError::MissingTable(table.to_string()))?;
        let rows: Vec<Map<String, Value>> =
            serde_json::from_slice(&raw).map_err(|e| BackupError::InvalidData {
                table: table.to_string(),
                message: e.to_string(),
            })?;
        tables.push((*table, rows));
    }
    Ok(tables)
}

/// Replace every table's rows with the backup's, in one transaction.
fn restore_tables(
    ctx: &Ctx<'_>,
    tables: &[(&'static str, Vec<Map<String, Value>>)],
) -> Result<(), BackupError> {
    ctx.conn.transaction(|c| {
        c.execute_batch("PRAGMA defer_foreign_keys = ON")?;
        for table in TABLES.iter().rev() {
            c.execute(&format!("DELETE FROM {}", c.table(table)), [])?;
        }
        for (table, rows) in tables {
            let known = table_columns(ctx, table)?;
            for row in rows {
                let (columns, values): (Vec<&String>, Vec<SqlValue>) = row
                    .iter()
                    .filter(|(column, _)| known.contains(column))
                    .map(|(column, value)| (column, json_to_sql(value)))
                    .unzip();
                if columns.is_empty() {
                    continue;
                }
                let placeholders = vec!["?"; columns.len()].join(", ");
                let names: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
                c.execute(
                    &format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        c.table(table),
                        names.join(", "),
                        placeholders
                    ),
                    rusqlite::params_from_iter(values),
                )?;
            }
        }
        Ok::<_, BackupError>(())
    })
}

/// Swap `content_dir` for the backup's copy, keeping an empty cache dir.
fn swap_content(extracted: &Path, content_dir: &Path) -> Result<(), BackupError> {
    let restored = extracted.join("content");
    if !restored.is_dir() {
        return Ok(());
    }
    let old = content_dir.with_extension("restore-old");
    if old.exists() {
        std::fs::remove_dir_all(&old)?;
    }
    if content_dir.exists() {
        std::fs::rename(content_dir, &old)?;
    }
    if let Err(e) = std::fs::rename(&restored, content_dir) {
        if old.exists() {
            let _ = std::fs::rename(&old, content_dir);
        }
        return Err(e.into());
    }
    std::fs::create_dir_all(content_dir.join("cache"))?;
    if old.exists() {
        std::fs::remove_dir_all(&old)?;
    }
    Ok(())
}

/// Restore `filename`: database first, then the content directory. The
/// extraction dir is removed whether or not this succeeds.
pub fn restore(
    ctx: &Ctx<'_>,
    content_dir: &Path,
    backups_dir: &Path,
    filename: &str,
) -> Result<(), BackupError> {
    let archive_path = get(backups_dir, filename)?;

    // Extract beside the content dir so the final swap is a rename
    let staging_parent = content_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&staging_parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".restore-")
        .tempdir_in(&staging_parent)?;

    tar::Archive::new(File::open(&archive_path)?).unpack(staging.path())?;
    let tables = read_tables(staging.path())?;

    restore_tables(ctx, &tables)?;
    ctx.settings.reload(ctx.conn)?;
    swap_content(staging.path(), content_dir)?;

    tracing::info!(backup = %filename, "Backup restored");
    ctx.events.publish(Event::BackupRestored {
        filename: filename.to_string(),
    });
    Ok(())
}
