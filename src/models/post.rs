use std::sync::OnceLock;

use chrono_tz::Tz;
use regex::Regex;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::datetime;
use crate::events::Event;
use crate::models::{default_items_per_page, default_page, history, split_list, tag, Ctx, Flag};
use crate::query::{self, Filter, Pagination, Search};
use crate::slug;

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("Invalid slug")]
    InvalidSlug,

    #[error("A post with this slug already exists")]
    AlreadyExists,

    #[error("Invalid author")]
    InvalidUser,

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Post not found")]
    NotFound,

    #[error(transparent)]
    Tag(#[from] tag::TagError),

    #[error(transparent)]
    History(#[from] history::HistoryError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl PostError {
    pub fn code(&self) -> u16 {
        match self {
            PostError::InvalidSlug => 1,
            PostError::AlreadyExists => 2,
            PostError::InvalidUser => 3,
            PostError::InvalidDate(_) => 4,
            PostError::NotFound => 5,
            PostError::Tag(_) | PostError::History(_) | PostError::Database(_) => 100,
        }
    }

    pub fn field(&self) -> Option<&'static str> {
        match self {
            PostError::InvalidSlug | PostError::AlreadyExists => Some("slug"),
            PostError::InvalidUser => Some("author"),
            PostError::InvalidDate(_) => Some("pub_date"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Draft,
    Published,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Draft => "draft",
            Status::Published => "published",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Status::Draft),
            "published" => Some(Status::Published),
            _ => None,
        }
    }

    /// Anything that isn't exactly `published` is stored as a draft.
    pub fn coerce(value: &str) -> Self {
        Self::parse(value).unwrap_or(Status::Draft)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTag {
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Post {
    pub id: i64,
    pub slug: String,
    pub created: String,
    pub pub_date: String,
    pub author: i64,
    pub title: String,
    pub content: String,
    pub image: String,
    pub meta_title: String,
    pub meta_description: String,
    pub status: Status,
    pub page: bool,
    pub featured: bool,
    pub sticky: bool,
    pub tags: Vec<PostTag>,
}

/// Fields for `add`/`update`; `None` keeps the current value. Dates are in
/// the display timezone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostInput {
    pub slug: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub image: Option<String>,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
    pub pub_date: Option<String>,
    /// Author's user slug.
    pub author: Option<String>,
    pub status: Option<String>,
    pub page: Option<Flag>,
    pub featured: Option<Flag>,
    pub sticky: Option<Flag>,
    /// Tag slugs; unknown tags are ignored.
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sort {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostQuery {
    /// Author slug.
    pub author: Option<String>,
    /// Tag slug.
    pub tag: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Comma-separated set of statuses.
    pub status: String,
    pub query: Option<String>,
    pub ignore_featured: bool,
    pub ignore_sticky: bool,
    pub ignore_pages: bool,
    pub ignore_posts: bool,
    pub show_future: bool,
    pub page: i64,
    pub items_per_page: i64,
    pub sort: Sort,
}

impl Default for PostQuery {
    fn default() -> Self {
        Self {
            author: None,
            tag: None,
            start_date: None,
            end_date: None,
            status: Status::Published.as_str().to_string(),
            query: None,
            ignore_featured: false,
            ignore_sticky: false,
            ignore_pages: false,
            ignore_posts: false,
            show_future: false,
            page: default_page(),
            items_per_page: default_items_per_page(),
            sort: Sort::Desc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

const COLUMNS: &str = "p.id, p.slug, p.created, p.pub_date, p.author, p.title, p.content, \
                       p.image, p.meta_title, p.meta_description, p.status, p.page, \
                       p.featured, p.sticky";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    let status: String = row.get(10)?;
    Ok(Post {
        id: row.get(0)?,
        slug: row.get(1)?,
        created: row.get(2)?,
        pub_date: row.get(3)?,
        author: row.get(4)?,
        title: row.get(5)?,
        content: row.get(6)?,
        image: row.get(7)?,
        meta_title: row.get(8)?,
        meta_description: row.get(9)?,
        status: Status::coerce(&status),
        page: row.get::<_, i64>(11)? != 0,
        featured: row.get::<_, i64>(12)? != 0,
        sticky: row.get::<_, i64>(13)? != 0,
        tags: Vec::new(),
    })
}

fn tags_for(ctx: &Ctx<'_>, post_id: i64) -> Result<Vec<PostTag>, PostError> {
    let mut stmt = ctx.conn.prepare(
        "SELECT t.slug, t.name FROM __post_tags pt
         JOIN __tags t ON t.id = pt.tag
         WHERE pt.post = ?1 ORDER BY t.name ASC",
    )?;
    let tags = stmt
        .query_map(params![post_id], |row| {
            Ok(PostTag {
                slug: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tags)
}

/// Convert dates to the display timezone and attach tags.
fn normalize(ctx: &Ctx<'_>, mut post: Post) -> Result<Post, PostError> {
    let tz = ctx.settings.timezone();
    if let Ok(local) = datetime::utc_to_local(&post.created, tz) {
        post.created = local;
    }
    if let Ok(local) = datetime::utc_to_local(&post.pub_date, tz) {
        post.pub_date = local;
    }
    post.tags = tags_for(ctx, post.id)?;
    Ok(post)
}

fn fetch_one(
    ctx: &Ctx<'_>,
    clause: &str,
    params: impl rusqlite::Params,
) -> Result<Option<Post>, PostError> {
    let post = ctx
        .conn
        .query_row(
            &format!("SELECT {} FROM __posts p WHERE {}", COLUMNS, clause),
            params,
            from_row,
        )
        .optional()?;
    post.map(|p| normalize(ctx, p)).transpose()
}

pub fn get(ctx: &Ctx<'_>, slug: &str) -> Result<Option<Post>, PostError> {
    fetch_one(ctx, "p.slug = ?1", params![slug])
}

pub fn get_by_id(ctx: &Ctx<'_>, id: i64) -> Result<Option<Post>, PostError> {
    fetch_one(ctx, "p.id = ?1", params![id])
}

/// The stored UTC publication date. Display dates can't be mapped back
/// when the local time repeats at a DST change.
pub(crate) fn stored_pub_date(ctx: &Ctx<'_>, id: i64) -> Result<String, PostError> {
    ctx.conn
        .query_row(
            "SELECT pub_date FROM __posts WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(PostError::NotFound)
}

/// A post visitors may see: published and not scheduled for later.
pub fn get_published(ctx: &Ctx<'_>, slug: &str) -> Result<Option<Post>, PostError> {
    fetch_one(
        ctx,
        "p.slug = ?1 AND p.status = 'published' AND p.pub_date <= ?2",
        params![slug, datetime::now_utc()],
    )
}

/// The published post before or after `slug` by publication date.
pub fn get_adjacent(
    ctx: &Ctx<'_>,
    slug: &str,
    direction: Direction,
) -> Result<Option<Post>, PostError> {
    let (cmp, order) = match direction {
        Direction::Previous => ("<", "DESC"),
        Direction::Next => (">", "ASC"),
    };
    let post = ctx
        .conn
        .query_row(
            &format!(
                "SELECT {cols} FROM __posts p, __posts cur
                 WHERE cur.slug = ?1
                   AND p.status = 'published' AND p.page = 0 AND p.pub_date <= ?2
                   AND (p.pub_date {cmp} cur.pub_date
                        OR (p.pub_date = cur.pub_date AND p.id {cmp} cur.id))
                 ORDER BY p.pub_date {order}, p.id {order} LIMIT 1",
                cols = COLUMNS,
                cmp = cmp,
                order = order,
            ),
            params![slug, datetime::now_utc()],
            from_row,
        )
        .optional()?;
    post.map(|p| normalize(ctx, p)).transpose()
}

/// SQL for a `get_many` call, kept separate so the search switch can be
/// inspected without a database.
#[derive(Debug)]
pub struct ManyQuery {
    pub count_sql: String,
    pub select_sql: String,
    pub filter: Filter,
}

pub fn build_many(q: &PostQuery, tz: Tz, now_utc: &str) -> Result<ManyQuery, PostError> {
    let search = q.query.as_deref().and_then(Search::from_query);
    let mut filter = Filter::new();

    let statuses: Vec<_> = split_list(&q.status)
        .iter()
        .filter_map(|s| Status::parse(s))
        .map(|s| query::text(s.as_str()))
        .collect();
    filter.push_in("p.status", statuses);

    if let Some(author) = q.author.as_deref().filter(|a| !a.is_empty()) {
        filter.push(
            "p.author = (SELECT id FROM __users WHERE slug = ?)",
            [query::text(author)],
        );
    }
    if let Some(tag) = q.tag.as_deref().filter(|t| !t.is_empty()) {
        filter.push(
            "p.id IN (SELECT pt.post FROM __post_tags pt JOIN __tags t ON t.id = pt.tag \
             WHERE t.slug = ?)",
            [query::text(tag)],
        );
    }
    if let Some(start) = q.start_date.as_deref().filter(|d| !d.is_empty()) {
        let utc = datetime::local_to_utc(start, tz)
            .map_err(|_| PostError::InvalidDate(start.to_string()))?;
        filter.push("p.pub_date >= ?", [query::text(utc)]);
    }
    if let Some(end) = q.end_date.as_deref().filter(|d| !d.is_empty()) {
        let utc = datetime::local_to_utc(end, tz)
            .map_err(|_| PostError::InvalidDate(end.to_string()))?;
        filter.push("p.pub_date <= ?", [query::text(utc)]);
    }
    if !q.show_future {
        filter.push("p.pub_date <= ?", [query::text(now_utc)]);
    }
    if q.ignore_featured {
        filter.push("p.featured = 0", []);
    }
    if q.ignore_sticky {
        filter.push("p.sticky = 0", []);
    }
    if q.ignore_pages {
        filter.push("p.page = 0", []);
    }
    if q.ignore_posts {
        filter.push("p.page = 1", []);
    }

    let direction = match q.sort {
        Sort::Asc => "ASC",
        Sort::Desc => "DESC",
    };

    let (from, score, order) = match &search {
        Some(Search::Substring(text)) => {
            let pattern = query::like_pattern(text);
            filter.push(
                "(p.title LIKE ? ESCAPE '\\' OR p.content LIKE ? ESCAPE '\\')",
                [query::text(pattern.clone()), query::text(pattern)],
            );
            (
                "__posts p".to_string(),
                String::new(),
                format!("p.sticky DESC, p.pub_date {}", direction),
            )
        }
        Some(Search::FullText(text)) => {
            filter.push("__post_search MATCH ?", [query::text(query::fts_expression(text))]);
            (
                "__posts p JOIN __post_search ON __post_search.rowid = p.id".to_string(),
                // Title matches weigh five times content matches
                ", bm25(__post_search, 5.0, 1.0) AS score".to_string(),
                format!("score ASC, p.pub_date {}", direction),
            )
        }
        None => (
            "__posts p".to_string(),
            String::new(),
            format!("p.sticky DESC, p.pub_date {}", direction),
        ),
    };

    Ok(ManyQuery {
        count_sql: format!("SELECT COUNT(*) FROM {}{}", from, filter.sql()),
        select_sql: format!(
            "SELECT {}{} FROM {}{} ORDER BY {} LIMIT ? OFFSET ?",
            COLUMNS,
            score,
            from,
            filter.sql(),
            order
        ),
        filter,
    })
}

pub fn get_many(ctx: &Ctx<'_>, q: &PostQuery) -> Result<(Vec<Post>, Pagination), PostError> {
    let built = build_many(q, ctx.settings.timezone(), &datetime::now_utc())?;

    let total: i64 = ctx.conn.query_row(
        &built.count_sql,
        params_from_iter(built.filter.params()),
        |row| row.get(0),
    )?;
    let pagination = Pagination::new(total, q.items_per_page, q.page);

    let mut stmt = ctx.conn.prepare(&built.select_sql)?;
    let rows = stmt
        .query_map(
            params_from_iter(built.filter.paged_params(&pagination)),
            from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let posts = rows
        .into_iter()
        .map(|p| normalize(ctx, p))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((posts, pagination))
}

fn slug_taken(ctx: &Ctx<'_>, slug: &str, except: Option<i64>) -> Result<bool, PostError> {
    Ok(ctx.conn.query_row(
        "SELECT COUNT(*) > 0 FROM __posts WHERE slug = ?1 AND id != ?2",
        params![slug, except.unwrap_or(0)],
        |row| row.get(0),
    )?)
}

fn author_id(ctx: &Ctx<'_>, slug: &str) -> Result<i64, PostError> {
    ctx.conn
        .query_row(
            "SELECT id FROM __users WHERE slug = ?1",
            params![slug],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(PostError::InvalidUser)
}

fn set_tags(ctx: &Ctx<'_>, post_id: i64, slugs: &[String]) -> Result<(), PostError> {
    let ids = tag::ids_for(ctx, slugs)?;
    ctx.conn
        .execute("DELETE FROM __post_tags WHERE post = ?1", params![post_id])?;
    for id in ids {
        ctx.conn.execute(
            "INSERT INTO __post_tags (post, tag) VALUES (?1, ?2)",
            params![post_id, id],
        )?;
    }
    Ok(())
}

fn upload_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"/content/(uploads/[^"'\s)<>?#]+)"#).expect("static regex")
    })
}

/// Upload paths (relative to the content dir) referenced by `html`.
pub fn referenced_uploads(html: &str) -> Vec<String> {
    let mut found: Vec<String> = upload_pattern()
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect();
    found.dedup();
    found
}

/// Link the post to every known upload its content or image points at.
fn link_uploads(ctx: &Ctx<'_>, post_id: i64, content: &str, image: &str) -> Result<(), PostError> {
    ctx.conn
        .execute("DELETE FROM __post_uploads WHERE post = ?1", params![post_id])?;
    let html = format!("{} \"{}\"", content, image);
    for relative in referenced_uploads(&html) {
        let Some((dir, file)) = relative.rsplit_once('/') else {
            continue;
        };
        let Some((filename, extension)) = file.rsplit_once('.') else {
            continue;
        };
        let upload: Option<i64> = ctx
            .conn
            .query_row(
                "SELECT id FROM __uploads WHERE path = ?1 AND filename = ?2 AND extension = ?3",
                params![format!("{}/", dir), filename, extension.to_ascii_lowercase()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(upload) = upload {
            ctx.conn.execute(
                "INSERT OR IGNORE INTO __post_uploads (post, upload) VALUES (?1, ?2)",
                params![post_id, upload],
            )?;
        }
    }
    Ok(())
}

fn pub_date_utc(ctx: &Ctx<'_>, value: Option<&str>) -> Result<String, PostError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(local) => datetime::local_to_utc(local, ctx.settings.timezone())
            .map_err(|_| PostError::InvalidDate(local.to_string())),
        None => Ok(datetime::now_utc()),
    }
}

pub fn add(ctx: &Ctx<'_>, input: &PostInput) -> Result<i64, PostError> {
    let protected = ctx.settings.protected_slugs();
    let title = input.title.as_deref().map(str::trim).unwrap_or_default();
    let slug = slug::validate(input.slug.as_deref().unwrap_or(title), &protected)
        .ok_or(PostError::InvalidSlug)?;
    if slug_taken(ctx, &slug, None)? {
        return Err(PostError::AlreadyExists);
    }

    let author = author_id(ctx, input.author.as_deref().unwrap_or_default())?;
    let pub_date = pub_date_utc(ctx, input.pub_date.as_deref())?;
    let status = Status::coerce(input.status.as_deref().unwrap_or("draft"));
    let flag = |f: Option<Flag>| f.map_or(false, |f| f.0);
    let content = input.content.clone().unwrap_or_default();
    let image = input.image.clone().unwrap_or_default();

    let id = ctx.conn.transaction(|c| {
        let tx = Ctx { conn: c, ..*ctx };
        c.execute(
            "INSERT INTO __posts (slug, created, pub_date, author, title, content, image,
                                  meta_title, meta_description, status, page, featured, sticky)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                slug,
                datetime::now_utc(),
                pub_date,
                author,
                title,
                content,
                image,
                input.meta_title.as_deref().unwrap_or_default(),
                input.meta_description.as_deref().unwrap_or_default(),
                status.as_str(),
                flag(input.page),
                flag(input.featured),
                flag(input.sticky),
            ],
        )?;
        let id = c.last_insert_rowid();

        if let Some(tags) = &input.tags {
            set_tags(&tx, id, tags)?;
        }
        link_uploads(&tx, id, &content, &image)?;

        let post = get_by_id(&tx, id)?.ok_or(PostError::NotFound)?;
        history::add(&tx, &post, true)?;
        Ok::<_, PostError>(id)
    })?;

    tracing::info!(post = %slug, "Post created");
    ctx.events.publish(Event::PostCreated { id, slug });
    Ok(id)
}

pub fn update(ctx: &Ctx<'_>, slug: &str, input: &PostInput) -> Result<(), PostError> {
    let existing = get(ctx, slug)?.ok_or(PostError::NotFound)?;

    let new_slug = match input.slug.as_deref() {
        Some(s) if s != existing.slug => {
            let protected = ctx.settings.protected_slugs();
            let s = slug::validate(s, &protected).ok_or(PostError::InvalidSlug)?;
            if slug_taken(ctx, &s, Some(existing.id))? {
                return Err(PostError::AlreadyExists);
            }
            s
        }
        _ => existing.slug.clone(),
    };

    let author = match input.author.as_deref() {
        Some(a) => author_id(ctx, a)?,
        None => existing.author,
    };
    let pub_date = match input.pub_date.as_deref() {
        Some(d) => pub_date_utc(ctx, Some(d))?,
        None => stored_pub_date(ctx, existing.id)?,
    };
    let status = input
        .status
        .as_deref()
        .map_or(existing.status, Status::coerce);
    let pick = |new: &Option<String>, old: &str| new.clone().unwrap_or_else(|| old.to_string());
    let flag = |new: Option<Flag>, old: bool| new.map_or(old, |f| f.0);
    let content = pick(&input.content, &existing.content);
    let image = pick(&input.image, &existing.image);

    ctx.conn.transaction(|c| {
        let tx = Ctx { conn: c, ..*ctx };
        c.execute(
            "UPDATE __posts SET slug = ?1, pub_date = ?2, author = ?3, title = ?4, content = ?5,
                    image = ?6, meta_title = ?7, meta_description = ?8, status = ?9, page = ?10,
                    featured = ?11, sticky = ?12
             WHERE id = ?13",
            params![
                new_slug,
                pub_date,
                author,
                pick(&input.title, &existing.title),
                content,
                image,
                pick(&input.meta_title, &existing.meta_title),
                pick(&input.meta_description, &existing.meta_description),
                status.as_str(),
                flag(input.page, existing.page),
                flag(input.featured, existing.featured),
                flag(input.sticky, existing.sticky),
                existing.id,
            ],
        )?;

        if let Some(tags) = &input.tags {
            set_tags(&tx, existing.id, tags)?;
        }
        link_uploads(&tx, existing.id, &content, &image)?;

        let post = get_by_id(&tx, existing.id)?.ok_or(PostError::NotFound)?;
        history::add(&tx, &post, false)?;
        Ok::<_, PostError>(())
    })?;

    ctx.events.publish(Event::PostUpdated {
        id: existing.id,
        slug: new_slug,
    });
    Ok(())
}

/// Delete a post with its tag links, upload links and history.
pub fn delete(ctx: &Ctx<'_>, slug: &str) -> Result<bool, PostError> {
    let rows = ctx
        .conn
        .execute("DELETE FROM __posts WHERE slug = ?1", params![slug])?;
    if rows > 0 {
        tracing::info!(post = %slug, "Post deleted");
        ctx.events.publish(Event::PostDeleted {
            slug: slug.to_string(),
        });
    }
    Ok(rows > 0)
}

/// The parts of a history snapshot that can be written back.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Snapshot {
    title: String,
    content: String,
    image: String,
    meta_title: String,
    meta_description: String,
    pub_date: String,
    status: String,
    page: bool,
    featured: bool,
    sticky: bool,
    tags: Vec<SnapshotTag>,
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotTag {
    slug: String,
}

/// Write a revision's content back onto its post, keeping the current slug
/// and author. The restore itself becomes a new revision. Returns the slug.
pub fn restore_revision(ctx: &Ctx<'_>, revision_id: i64) -> Result<String, PostError> {
    let revision = history::get(ctx, revision_id)?.ok_or(history::HistoryError::NotFound)?;
    let current = get_by_id(ctx, revision.post)?.ok_or(PostError::NotFound)?;
    let snapshot: Snapshot = serde_json::from_value(revision.post_data)
        .map_err(history::HistoryError::from)?;

    let input = PostInput {
        title: Some(snapshot.title),
        content: Some(snapshot.content),
        image: Some(snapshot.image),
        meta_title: Some(snapshot.meta_title),
        meta_description: Some(snapshot.meta_description),
        pub_date: Some(snapshot.pub_date).filter(|d| !d.is_empty()),
        status: Some(snapshot.status).filter(|s| !s.is_empty()),
        page: Some(Flag(snapshot.page)),
        featured: Some(Flag(snapshot.featured)),
        sticky: Some(Flag(snapshot.sticky)),
        tags: Some(snapshot.tags.into_iter().map(|t| t.slug).collect()),
        ..Default::default()
    };
    update(ctx, &current.slug, &input)?;
    tracing::info!(post = %current.slug, revision = revision_id, "Revision restored");
    Ok(current.slug)
}
