use std::path::Path;

use chrono::Utc;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::datetime;
use crate::events::Event;
use crate::models::{default_items_per_page, default_page, tag, Ctx};
use crate::query::{self, Filter, Pagination};
use crate::slug;

/// Extensions accepted for upload. Images get their dimensions recorded.
pub const IMAGE_EXTENSIONS: &[&str] = &["gif", "jpeg", "jpg", "png", "svg", "webp"];
pub const OTHER_EXTENSIONS: &[&str] = &[
    "doc", "docx", "mp3", "mp4", "ogg", "pdf", "ppt", "pptx", "txt", "wav", "webm", "xls",
    "xlsx", "zip",
];

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("The file is empty")]
    Empty,

    #[error("Upload not found")]
    NotFound,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tag(#[from] tag::TagError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl UploadError {
    pub fn code(&self) -> u16 {
        match self {
            UploadError::UnsupportedType(_) => 1,
            UploadError::Empty => 2,
            UploadError::NotFound => 3,
            UploadError::Io(_) | UploadError::Tag(_) | UploadError::Database(_) => 100,
        }
    }

    pub fn field(&self) -> Option<&'static str> {
        match self {
            UploadError::UnsupportedType(_) | UploadError::Empty => Some("file"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadTag {
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Upload {
    pub id: i64,
    pub caption: String,
    pub created: String,
    /// Directory relative to the content dir, with a trailing slash.
    pub path: String,
    pub filename: String,
    pub extension: String,
    pub size: i64,
    pub width: i64,
    pub height: i64,
    pub url: String,
    pub tags: Vec<UploadTag>,
}

impl Upload {
    /// Path of the file relative to the content dir.
    pub fn relative_path(&self) -> String {
        format!("{}{}.{}", self.path, self.filename, self.extension)
    }

    pub fn is_image(&self) -> bool {
        IMAGE_EXTENSIONS.contains(&self.extension.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadInput {
    pub caption: Option<String>,
    /// Tag slugs; unknown tags are ignored.
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadQuery {
    pub query: Option<String>,
    /// Tag slug.
    pub tag: Option<String>,
    pub page: i64,
    pub items_per_page: i64,
}

impl Default for UploadQuery {
    fn default() -> Self {
        Self {
            query: None,
            tag: None,
            page: default_page(),
            items_per_page: default_items_per_page(),
        }
    }
}

const COLUMNS: &str = "u.id, u.caption, u.created, u.path, u.filename, u.extension, u.size, \
                       u.width, u.height";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Upload> {
    let path: String = row.get(3)?;
    let filename: String = row.get(4)?;
    let extension: String = row.get(5)?;
    Ok(Upload {
        id: row.get(0)?,
        caption: row.get(1)?,
        created: row.get(2)?,
        url: format!("/content/{}{}.{}", path, filename, extension),
        path,
        filename,
        extension,
        size: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        tags: Vec::new(),
    })
}

fn normalize(ctx: &Ctx<'_>, mut upload: Upload) -> Result<Upload, UploadError> {
    if let Ok(local) = datetime::utc_to_local(&upload.created, ctx.settings.timezone()) {
        upload.created = local;
    }
    let mut stmt = ctx.conn.prepare(
        "SELECT t.slug, t.name FROM __upload_tags ut
         JOIN __tags t ON t.id = ut.tag
         WHERE ut.upload = ?1 ORDER BY t.name ASC",
    )?;
    upload.tags = stmt
        .query_map(params![upload.id], |row| {
            Ok(UploadTag {
                slug: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(upload)
}

pub fn get(ctx: &Ctx<'_>, id: i64) -> Result<Option<Upload>, UploadError> {
    let upload = ctx
        .conn
        .query_row(
            &format!("SELECT {} FROM __uploads u WHERE u.id = ?1", COLUMNS),
            params![id],
            from_row,
        )
        .optional()?;
    upload.map(|u| normalize(ctx, u)).transpose()
}

pub fn get_many(
    ctx: &Ctx<'_>,
    q: &UploadQuery,
) -> Result<(Vec<Upload>, Pagination), UploadError> {
    let mut filter = Filter::new();
    if let Some(text) = q.query.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = query::like_pattern(text);
        filter.push(
            "(u.caption LIKE ? ESCAPE '\\' OR u.filename LIKE ? ESCAPE '\\')",
            [query::text(pattern.clone()), query::text(pattern)],
        );
    }
    if let Some(tag) = q.tag.as_deref().filter(|t| !t.is_empty()) {
        filter.push(
            "u.id IN (SELECT ut.upload FROM __upload_tags ut JOIN __tags t ON t.id = ut.tag \
             WHERE t.slug = ?)",
            [query::text(tag)],
        );
    }

    let total: i64 = ctx.conn.query_row(
        &format!("SELECT COUNT(*) FROM __uploads u{}", filter.sql()),
        params_from_iter(filter.params()),
        |row| row.get(0),
    )?;
    let pagination = Pagination::new(total, q.items_per_page, q.page);

    let mut stmt = ctx.conn.prepare(&format!(
        "SELECT {} FROM __uploads u{} ORDER BY u.created DESC, u.id DESC LIMIT ? OFFSET ?",
        COLUMNS,
        filter.sql()
    ))?;
    let rows = stmt
        .query_map(params_from_iter(filter.paged_params(&pagination)), from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let uploads = rows
        .into_iter()
        .map(|u| normalize(ctx, u))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((uploads, pagination))
}

fn split_name(original: &str) -> (String, String) {
    let name = original.rsplit(['/', '\\']).next().unwrap_or(original);
    match name.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), ext.to_ascii_lowercase()),
        None => (name.to_string(), String::new()),
    }
}

fn name_taken(
    ctx: &Ctx<'_>,
    content_dir: &Path,
    dir: &str,
    filename: &str,
    extension: &str,
) -> Result<bool, UploadError> {
    let in_db: bool = ctx.conn.query_row(
        "SELECT COUNT(*) > 0 FROM __uploads WHERE path = ?1 AND filename = ?2 AND extension = ?3",
        params![dir, filename, extension],
        |row| row.get(0),
    )?;
    Ok(in_db
        || content_dir
            .join(dir)
            .join(format!("{}.{}", filename, extension))
            .exists())
}

/// Store `bytes` under `content/uploads/YYYY/MM/` and record it. The
/// filename is slugified and suffixed `-1`, `-2`, … until unique.
pub fn add(
    ctx: &Ctx<'_>,
    content_dir: &Path,
    original_name: &str,
    bytes: &[u8],
) -> Result<i64, UploadError> {
    let (stem, extension) = split_name(original_name);
    if !IMAGE_EXTENSIONS.contains(&extension.as_str())
        && !OTHER_EXTENSIONS.contains(&extension.as_str())
    {
        return Err(UploadError::UnsupportedType(extension));
    }
    if bytes.is_empty() {
        return Err(UploadError::Empty);
    }

    let dir = format!("uploads/{}/", Utc::now().format("%Y/%m"));
    let base = match slug::slugify(&stem) {
        s if s.is_empty() => "upload".to_string(),
        s => s,
    };
    let mut filename = base.clone();
    let mut n = 1;
    while name_taken(ctx, content_dir, &dir, &filename, &extension)? {
        filename = format!("{}-{}", base, n);
        n += 1;
    }

    let (width, height) = if extension != "svg" && IMAGE_EXTENSIONS.contains(&extension.as_str())
    {
        match imagesize::blob_size(bytes) {
            Ok(size) => (size.width as i64, size.height as i64),
            Err(e) => {
                tracing::warn!(file = %original_name, "Could not read image size: {}", e);
                (0, 0)
            }
        }
    } else {
        (0, 0)
    };

    let target_dir = content_dir.join(&dir);
    std::fs::create_dir_all(&target_dir)?;
    let target = target_dir.join(format!("{}.{}", filename, extension));
    std::fs::write(&target, bytes)?;

    let inserted = ctx.conn.execute(
        "INSERT INTO __uploads (created, path, filename, extension, size, width, height)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            datetime::now_utc(),
            dir,
            filename,
            extension,
            bytes.len() as i64,
            width,
            height
        ],
    );
    if let Err(e) = inserted {
        let _ = std::fs::remove_file(&target);
        return Err(e.into());
    }
    let id = ctx.conn.last_insert_rowid();

    tracing::info!(upload = id, file = %target.display(), "Upload stored");
    ctx.events.publish(Event::UploadCreated {
        id,
        filename: format!("{}.{}", filename, extension),
    });
    Ok(id)
}

pub fn update(ctx: &Ctx<'_>, id: i64, input: &UploadInput) -> Result<(), UploadError> {
    if get(ctx, id)?.is_none() {
        return Err(UploadError::NotFound);
    }

    ctx.conn.transaction(|c| {
        let tx = Ctx { conn: c, ..*ctx };
        if let Some(caption) = &input.caption {
            c.execute(
                "UPDATE __uploads SET caption = ?1 WHERE id = ?2",
                params![caption.trim(), id],
            )?;
        }
        if let Some(tags) = &input.tags {
            let ids = tag::ids_for(&tx, tags)?;
            c.execute("DELETE FROM __upload_tags WHERE upload = ?1", params![id])?;
            for tag in ids {
                c.execute(
                    "INSERT INTO __upload_tags (upload, tag) VALUES (?1, ?2)",
                    params![id, tag],
                )?;
            }
        }
        Ok::<_, UploadError>(())
    })?;

    ctx.events.publish(Event::UploadUpdated { id });
    Ok(())
}

/// Delete the record and its file. A file already gone from disk is not an
/// error.
pub fn delete(ctx: &Ctx<'_>, content_dir: &Path, id: i64) -> Result<bool, UploadError> {
    let Some(upload) = get(ctx, id)? else {
        return Ok(false);
    };
    ctx.conn
        .execute("DELETE FROM __uploads WHERE id = ?1", params![id])?;

    match std::fs::remove_file(content_dir.join(upload.relative_path())) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    ctx.events.publish(Event::UploadDeleted { id });
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tag::TagInput;
    use crate::models::tests::Fixture;

    // 1x1 transparent GIF
    const GIF: &[u8] = &[
        0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00,
        0x00, 0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c,
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x44, 0x00, 0x3b,
    ];

    #[test]
    fn add_stores_file_and_dimensions() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        let content = f.dir.path().join("content");

        let id = add(&ctx, &content, "My Cat.GIF", GIF).unwrap();
        let upload = get(&ctx, id).unwrap().unwrap();
        assert_eq!(upload.filename, "my-cat");
        assert_eq!(upload.extension, "gif");
        assert_eq!((upload.width, upload.height), (1, 1));
        assert_eq!(upload.size, GIF.len() as i64);
        assert!(upload.url.starts_with("/content/uploads/"));
        assert!(upload.is_image());
        assert!(content.join(upload.relative_path()).is_file());
    }

    #[test]
    fn duplicate_names_get_suffixed() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        let content = f.dir.path().join("content");

        let a = add(&ctx, &content, "cat.gif", GIF).unwrap();
        let b = add(&ctx, &content, "cat.gif", GIF).unwrap();
        let c = add(&ctx, &content, "cat.gif", GIF).unwrap();
        let names: Vec<String> = [a, b, c]
            .iter()
            .map(|id| get(&ctx, *id).unwrap().unwrap().filename)
            .collect();
        assert_eq!(names, vec!["cat", "cat-1", "cat-2"]);
    }

    #[test]
    fn rejects_unknown_types_and_empty_files() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        let content = f.dir.path().join("content");

        assert!(matches!(
            add(&ctx, &content, "run.exe", b"MZ"),
            Err(UploadError::UnsupportedType(_))
        ));
        assert!(matches!(
            add(&ctx, &content, "empty.txt", b""),
            Err(UploadError::Empty)
        ));
        let id = add(&ctx, &content, "notes.txt", b"hello").unwrap();
        assert_eq!(get(&ctx, id).unwrap().unwrap().width, 0);
    }

    #[test]
    fn update_sets_caption_and_tags() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        let content = f.dir.path().join("content");
        tag::add(
            &ctx,
            &TagInput {
                name: Some("Photos".into()),
                kind: Some("upload".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let id = add(&ctx, &content, "cat.gif", GIF).unwrap();
        update(
            &ctx,
            id,
            &UploadInput {
                caption: Some(" A cat ".into()),
                tags: Some(vec!["photos".into()]),
            },
        )
        .unwrap();

        let upload = get(&ctx, id).unwrap().unwrap();
        assert_eq!(upload.caption, "A cat");
        assert_eq!(upload.tags.len(), 1);

        let (found, _) = get_many(
            &ctx,
            &UploadQuery {
                tag: Some("photos".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert!(matches!(
            update(&ctx, 999, &UploadInput::default()),
            Err(UploadError::NotFound)
        ));
    }

    #[test]
    fn delete_removes_file() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        let content = f.dir.path().join("content");

        let id = add(&ctx, &content, "cat.gif", GIF).unwrap();
        let path = content.join(get(&ctx, id).unwrap().unwrap().relative_path());
        assert!(delete(&ctx, &content, id).unwrap());
        assert!(!path.exists());
        assert!(!delete(&ctx, &content, id).unwrap());
    }
}
