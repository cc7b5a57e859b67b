//! Append-only post revisions. A snapshot is written on every create and
//! update; the first one is flagged `initial`.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::datetime;
use crate::events::Event;
use crate::models::post::Post;
use crate::models::Ctx;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Revision {
    pub id: i64,
    pub post: i64,
    pub rev_date: String,
    pub post_data: serde_json::Value,
    pub initial: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Revision not found")]
    NotFound,

    #[error("Invalid revision data: {0}")]
    Data(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl HistoryError {
    pub fn code(&self) -> u16 {
        match self {
            HistoryError::NotFound => 1,
            HistoryError::Data(_) => 2,
            HistoryError::Database(_) => 100,
        }
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, String, String, bool)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn build(
    ctx: &Ctx<'_>,
    (id, post, rev_date, data, initial): (i64, i64, String, String, bool),
) -> Result<Revision, HistoryError> {
    let rev_date = datetime::utc_to_local(&rev_date, ctx.settings.timezone()).unwrap_or(rev_date);
    Ok(Revision {
        id,
        post,
        rev_date,
        post_data: serde_json::from_str(&data)?,
        initial,
    })
}

/// Snapshot `post` as it now stands.
pub fn add(ctx: &Ctx<'_>, post: &Post, initial: bool) -> Result<i64, HistoryError> {
    let data = serde_json::to_string(post)?;
    ctx.conn.execute(
        "INSERT INTO __history (post, rev_date, post_data, initial) VALUES (?1, ?2, ?3, ?4)",
        params![post.id, datetime::now_utc(), data, initial],
    )?;
    Ok(ctx.conn.last_insert_rowid())
}

pub fn get(ctx: &Ctx<'_>, id: i64) -> Result<Option<Revision>, HistoryError> {
    let row = ctx
        .conn
        .query_row(
            "SELECT id, post, rev_date, post_data, initial FROM __history WHERE id = ?1",
            params![id],
            from_row,
        )
        .optional()?;
    row.map(|r| build(ctx, r)).transpose()
}

/// All revisions of a post, newest first.
pub fn get_many(ctx: &Ctx<'_>, post_id: i64) -> Result<Vec<Revision>, HistoryError> {
    let mut stmt = ctx.conn.prepare(
        "SELECT id, post, rev_date, post_data, initial FROM __history
         WHERE post = ?1 ORDER BY rev_date DESC, id DESC",
    )?;
    let rows = stmt
        .query_map(params![post_id], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(|r| build(ctx, r)).collect()
}

pub fn delete(ctx: &Ctx<'_>, id: i64) -> Result<bool, HistoryError> {
    let rows = ctx
        .conn
        .execute("DELETE FROM __history WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// Remove every revision of a post. Returns how many were deleted.
pub fn flush(ctx: &Ctx<'_>, post_id: i64) -> Result<usize, HistoryError> {
    let removed = ctx
        .conn
        .execute("DELETE FROM __history WHERE post = ?1", params![post_id])?;
    ctx.events.publish(Event::HistoryFlushed {
        post: post_id,
        removed,
    });
    Ok(removed)
}
