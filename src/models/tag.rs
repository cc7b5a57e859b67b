use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::datetime;
use crate::events::Event;
use crate::models::{default_items_per_page, default_page, Ctx};
use crate::query::{self, Filter, Pagination};
use crate::slug;

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("Invalid slug")]
    InvalidSlug,

    #[error("A tag with this slug already exists")]
    AlreadyExists,

    #[error("Name is required")]
    MissingName,

    #[error("Invalid tag type: {0}")]
    InvalidType(String),

    #[error("Tag not found")]
    NotFound,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl TagError {
    pub fn code(&self) -> u16 {
        match self {
            TagError::InvalidSlug => 1,
            TagError::AlreadyExists => 2,
            TagError::MissingName => 3,
            TagError::InvalidType(_) => 4,
            TagError::NotFound => 5,
            TagError::Database(_) => 100,
        }
    }

    pub fn field(&self) -> Option<&'static str> {
        match self {
            TagError::InvalidSlug | TagError::AlreadyExists => Some("slug"),
            TagError::MissingName => Some("name"),
            TagError::InvalidType(_) => Some("type"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagType {
    Post,
    Upload,
}

impl TagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagType::Post => "post",
            TagType::Upload => "upload",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TagError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "post" | "" => Ok(TagType::Post),
            "upload" => Ok(TagType::Upload),
            _ => Err(TagError::InvalidType(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tag {
    pub id: i64,
    pub slug: String,
    pub created: String,
    pub name: String,
    pub description: String,
    pub cover: String,
    pub meta_title: String,
    pub meta_description: String,
    #[serde(rename = "type")]
    pub kind: TagType,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagInput {
    pub slug: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub cover: Option<String>,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TagQuery {
    pub query: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub page: i64,
    pub items_per_page: i64,
}

impl Default for TagQuery {
    fn default() -> Self {
        Self {
            query: None,
            kind: None,
            page: default_page(),
            items_per_page: default_items_per_page(),
        }
    }
}

const COLUMNS: &str = "id, slug, created, name, description, cover, meta_title, \
                       meta_description, type";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Tag> {
    let kind: String = row.get(8)?;
    Ok(Tag {
        id: row.get(0)?,
        slug: row.get(1)?,
        created: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        cover: row.get(5)?,
        meta_title: row.get(6)?,
        meta_description: row.get(7)?,
        kind: TagType::parse(&kind).unwrap_or(TagType::Post),
    })
}

fn normalize(ctx: &Ctx<'_>, mut tag: Tag) -> Tag {
    if let Ok(local) = datetime::utc_to_local(&tag.created, ctx.settings.timezone()) {
        tag.created = local;
    }
    tag
}

pub fn get(ctx: &Ctx<'_>, slug: &str) -> Result<Option<Tag>, TagError> {
    let tag = ctx
        .conn
        .query_row(
            &format!("SELECT {} FROM __tags WHERE slug = ?1", COLUMNS),
            params![slug],
            from_row,
        )
        .optional()?;
    Ok(tag.map(|t| normalize(ctx, t)))
}

/// Every tag, by name. Used for pickers and imports.
pub fn get_all(ctx: &Ctx<'_>) -> Result<Vec<Tag>, TagError> {
    let mut stmt = ctx
        .conn
        .prepare(&format!("SELECT {} FROM __tags ORDER BY name ASC", COLUMNS))?;
    let tags = stmt
        .query_map([], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tags.into_iter().map(|t| normalize(ctx, t)).collect())
}

pub fn get_many(ctx: &Ctx<'_>, q: &TagQuery) -> Result<(Vec<Tag>, Pagination), TagError> {
    let mut filter = Filter::new();
    if let Some(text) = q.query.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = query::like_pattern(text);
        filter.push(
            "(slug LIKE ? ESCAPE '\\' OR name LIKE ? ESCAPE '\\' OR description LIKE ? ESCAPE '\\')",
            [
                query::text(pattern.clone()),
                query::text(pattern.clone()),
                query::text(pattern),
            ],
        );
    }
    if let Some(kind) = q.kind.as_deref().filter(|k| !k.is_empty()) {
        filter.push("type = ?", [query::text(TagType::parse(kind)?.as_str())]);
    }

    let total: i64 = ctx.conn.query_row(
        &format!("SELECT COUNT(*) FROM __tags{}", filter.sql()),
        params_from_iter(filter.params()),
        |row| row.get(0),
    )?;
    let pagination = Pagination::new(total, q.items_per_page, q.page);

    let mut stmt = ctx.conn.prepare(&format!(
        "SELECT {} FROM __tags{} ORDER BY name ASC LIMIT ? OFFSET ?",
        COLUMNS,
        filter.sql()
    ))?;
    let tags = stmt
        .query_map(params_from_iter(filter.paged_params(&pagination)), from_row)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|t| normalize(ctx, t))
        .collect();

    Ok((tags, pagination))
}

/// Resolve slugs to ids, silently skipping tags that don't exist.
pub fn ids_for(ctx: &Ctx<'_>, slugs: &[String]) -> Result<Vec<i64>, TagError> {
    let mut ids = Vec::with_capacity(slugs.len());
    for slug in slugs {
        let id: Option<i64> = ctx
            .conn
            .query_row(
                "SELECT id FROM __tags WHERE slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) if !ids.contains(&id) => ids.push(id),
            Some(_) => {}
            None => tracing::debug!(tag = %slug, "Ignoring unknown tag"),
        }
    }
    Ok(ids)
}

fn slug_taken(ctx: &Ctx<'_>, slug: &str, except: Option<i64>) -> Result<bool, TagError> {
    Ok(ctx.conn.query_row(
        "SELECT COUNT(*) > 0 FROM __tags WHERE slug = ?1 AND id != ?2",
        params![slug, except.unwrap_or(0)],
        |row| row.get(0),
    )?)
}

pub fn add(ctx: &Ctx<'_>, input: &TagInput) -> Result<i64, TagError> {
    let name = input.name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(TagError::MissingName);
    }

    let protected = ctx.settings.protected_slugs();
    let slug = slug::validate(input.slug.as_deref().unwrap_or(name), &protected)
        .ok_or(TagError::InvalidSlug)?;
    if slug_taken(ctx, &slug, None)? {
        return Err(TagError::AlreadyExists);
    }
    let kind = TagType::parse(input.kind.as_deref().unwrap_or("post"))?;

    ctx.conn.execute(
        "INSERT INTO __tags (slug, created, name, description, cover, meta_title,
                             meta_description, type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            slug,
            datetime::now_utc(),
            name,
            input.description.as_deref().unwrap_or_default(),
            input.cover.as_deref().unwrap_or_default(),
            input.meta_title.as_deref().unwrap_or_default(),
            input.meta_description.as_deref().unwrap_or_default(),
            kind.as_str(),
        ],
    )?;
    let id = ctx.conn.last_insert_rowid();

    ctx.events.publish(Event::TagCreated { id, slug });
    Ok(id)
}

pub fn update(ctx: &Ctx<'_>, slug: &str, input: &TagInput) -> Result<(), TagError> {
    let existing = get(ctx, slug)?.ok_or(TagError::NotFound)?;

    let new_slug = match input.slug.as_deref() {
        Some(s) if s != existing.slug => {
            let protected = ctx.settings.protected_slugs();
            let s = slug::validate(s, &protected).ok_or(TagError::InvalidSlug)?;
            if slug_taken(ctx, &s, Some(existing.id))? {
                return Err(TagError::AlreadyExists);
            }
            s
        }
        _ => existing.slug.clone(),
    };

    let name = match input.name.as_deref().map(str::trim) {
        Some("") => return Err(TagError::MissingName),
        Some(n) => n.to_string(),
        None => existing.name.clone(),
    };
    let kind = match input.kind.as_deref() {
        Some(k) => TagType::parse(k)?,
        None => existing.kind,
    };
    let pick = |new: &Option<String>, old: &str| new.clone().unwrap_or_else(|| old.to_string());

    ctx.conn.execute(
        "UPDATE __tags SET slug = ?1, name = ?2, description = ?3, cover = ?4, meta_title = ?5,
                meta_description = ?6, type = ?7
         WHERE id = ?8",
        params![
            new_slug,
            name,
            pick(&input.description, &existing.description),
            pick(&input.cover, &existing.cover),
            pick(&input.meta_title, &existing.meta_title),
            pick(&input.meta_description, &existing.meta_description),
            kind.as_str(),
            existing.id,
        ],
    )?;

    ctx.events.publish(Event::TagUpdated {
        id: existing.id,
        slug: new_slug,
    });
    Ok(())
}

/// Delete a tag; post and upload links go with it.
pub fn delete(ctx: &Ctx<'_>, slug: &str) -> Result<bool, TagError> {
    let rows = ctx
        .conn
        .execute("DELETE FROM __tags WHERE slug = ?1", params![slug])?;
    if rows > 0 {
        ctx.events.publish(Event::TagDeleted {
            slug: slug.to_string(),
        });
    }
    Ok(rows > 0)
}
