//! Bulk import of tags and posts from a JSON document.

use serde::{Deserialize, Serialize};

use crate::models::post::{self, PostError, PostInput};
use crate::models::tag::{self, TagError, TagInput};
use crate::models::user::UserError;
use crate::models::Ctx;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Invalid import document: {0}")]
    InvalidDocument(#[from] serde_json::Error),

    #[error("The import document is empty")]
    Empty,

    #[error(transparent)]
    Post(#[from] PostError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    User(#[from] UserError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl ImportError {
    pub fn code(&self) -> u16 {
        match self {
            ImportError::InvalidDocument(_) => 1,
            ImportError::Empty => 2,
            ImportError::Post(e) => e.code(),
            ImportError::Tag(e) => e.code(),
            ImportError::User(e) => e.code(),
            ImportError::Database(_) => 100,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Document {
    pub tags: Vec<TagInput>,
    pub posts: Vec<PostInput>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub tags_created: usize,
    pub tags_skipped: usize,
    pub posts_created: usize,
    pub posts_skipped: usize,
}

pub fn parse(raw: &[u8]) -> Result<Document, ImportError> {
    let doc: Document = serde_json::from_slice(raw)?;
    if doc.tags.is_empty() && doc.posts.is_empty() {
        return Err(ImportError::Empty);
    }
    Ok(doc)
}

/// Create every tag and post in `doc`, skipping slugs that already exist.
/// Posts without an author are attributed to `default_author`. Any other
/// failure rolls the whole import back.
pub fn run(ctx: &Ctx<'_>, doc: &Document, default_author: &str) -> Result<Summary, ImportError> {
    let summary = ctx.conn.transaction(|c| {
        let tx = Ctx { conn: c, ..*ctx };
        let mut summary = Summary::default();

        for input in &doc.tags {
            match tag::add(&tx, input) {
                Ok(_) => summary.tags_created += 1,
                Err(TagError::AlreadyExists) => summary.tags_skipped += 1,
                Err(e) => return Err(e.into()),
            }
        }

        for input in &doc.posts {
            let mut input = input.clone();
            if input.author.as_deref().map_or(true, str::is_empty) {
                input.author = Some(default_author.to_string());
            }
            match post::add(&tx, &input) {
                Ok(_) => summary.posts_created += 1,
                Err(PostError::AlreadyExists) => summary.posts_skipped += 1,
                Err(e) => return Err(e.into()),
            }
        }

        Ok::<_, ImportError>(summary)
    })?;

    tracing::info!(
        tags = summary.tags_created,
        posts = summary.posts_created,
        skipped = summary.tags_skipped + summary.posts_skipped,
        "Import finished"
    );
    Ok(summary)
}
