use std::fmt;
use std::str::FromStr;

use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::datetime;
use crate::events::Event;
use crate::models::{default_items_per_page, default_page, Ctx};
use crate::query::{self, Filter, Pagination};
use crate::slug;

pub const MIN_PASSWORD_LEN: usize = 8;

#[cfg(not(test))]
const HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const HASH_COST: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Author,
    Editor,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::Author => "author",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "editor" => Ok(Role::Editor),
            "author" => Ok(Role::Author),
            _ => Err(UserError::InvalidRole(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("Invalid username")]
    InvalidSlug,

    #[error("A user with this username already exists")]
    AlreadyExists,

    #[error("Invalid email address")]
    InvalidEmail,

    #[error("This email address is already in use")]
    EmailInUse,

    #[error("Passwords must be at least 8 characters")]
    PasswordTooShort,

    #[error("Name is required")]
    MissingName,

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("There can only be one owner")]
    OwnerExists,

    #[error("The owner's role can only change by transferring ownership")]
    OwnerRoleChange,

    #[error("The owner can't be deleted")]
    CannotDeleteOwner,

    #[error("Invalid recipient for this user's posts")]
    InvalidRecipient,

    #[error("User not found")]
    NotFound,

    #[error("Password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl UserError {
    pub fn code(&self) -> u16 {
        match self {
            UserError::InvalidSlug => 1,
            UserError::AlreadyExists => 2,
            UserError::InvalidEmail => 3,
            UserError::EmailInUse => 4,
            UserError::PasswordTooShort => 5,
            UserError::MissingName => 6,
            UserError::InvalidRole(_) => 7,
            UserError::OwnerExists => 8,
            UserError::OwnerRoleChange => 9,
            UserError::CannotDeleteOwner => 10,
            UserError::InvalidRecipient => 11,
            UserError::NotFound => 12,
            UserError::Hash(_) | UserError::Database(_) => 100,
        }
    }

    pub fn field(&self) -> Option<&'static str> {
        match self {
            UserError::InvalidSlug | UserError::AlreadyExists => Some("slug"),
            UserError::InvalidEmail | UserError::EmailInUse => Some("email"),
            UserError::PasswordTooShort => Some("password"),
            UserError::MissingName => Some("name"),
            UserError::InvalidRole(_) | UserError::OwnerExists | UserError::OwnerRoleChange => {
                Some("role")
            }
            UserError::InvalidRecipient => Some("recipient"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub slug: String,
    pub created: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub bio: String,
    pub cover: String,
    pub avatar: String,
    pub twitter: String,
    pub location: String,
    pub website: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInput {
    pub slug: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub role: Option<String>,
    pub bio: Option<String>,
    pub cover: Option<String>,
    pub avatar: Option<String>,
    pub twitter: Option<String>,
    pub location: Option<String>,
    pub website: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserQuery {
    pub query: Option<String>,
    pub role: Option<String>,
    pub page: i64,
    pub items_per_page: i64,
}

impl Default for UserQuery {
    fn default() -> Self {
        Self {
            query: None,
            role: None,
            page: default_page(),
            items_per_page: default_items_per_page(),
        }
    }
}

const COLUMNS: &str = "id, slug, created, name, email, role, bio, cover, avatar, twitter, \
                       location, website";

fn from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let role: String = row.get(5)?;
    Ok(User {
        id: row.get(0)?,
        slug: row.get(1)?,
        created: row.get(2)?,
        name: row.get(3)?,
        email: row.get(4)?,
        role: role.parse().unwrap_or(Role::Author),
        bio: row.get(6)?,
        cover: row.get(7)?,
        avatar: row.get(8)?,
        twitter: row.get(9)?,
        location: row.get(10)?,
        website: row.get(11)?,
    })
}

fn normalize(ctx: &Ctx<'_>, mut user: User) -> User {
    let tz = ctx.settings.timezone();
    if let Ok(local) = datetime::utc_to_local(&user.created, tz) {
        user.created = local;
    }
    user
}

fn valid_email(email: &str) -> bool {
    let mut parts = email.splitn(2, '@');
    match (parts.next(), parts.next()) {
        (Some(local), Some(domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        _ => false,
    }
}

pub fn hash_password(password: &str) -> Result<String, UserError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(UserError::PasswordTooShort);
    }
    Ok(bcrypt::hash(password, HASH_COST)?)
}

pub fn get(ctx: &Ctx<'_>, slug: &str) -> Result<Option<User>, UserError> {
    let user = ctx
        .conn
        .query_row(
            &format!("SELECT {} FROM __users WHERE slug = ?1", COLUMNS),
            params![slug],
            from_row,
        )
        .optional()?;
    Ok(user.map(|u| normalize(ctx, u)))
}

pub fn get_by_id(ctx: &Ctx<'_>, id: i64) -> Result<Option<User>, UserError> {
    let user = ctx
        .conn
        .query_row(
            &format!("SELECT {} FROM __users WHERE id = ?1", COLUMNS),
            params![id],
            from_row,
        )
        .optional()?;
    Ok(user.map(|u| normalize(ctx, u)))
}

pub fn get_owner(ctx: &Ctx<'_>) -> Result<Option<User>, UserError> {
    let user = ctx
        .conn
        .query_row(
            &format!("SELECT {} FROM __users WHERE role = 'owner' LIMIT 1", COLUMNS),
            [],
            from_row,
        )
        .optional()?;
    Ok(user.map(|u| normalize(ctx, u)))
}

/// Look up by username or email and check the password.
pub fn verify_password(
    ctx: &Ctx<'_>,
    login: &str,
    password: &str,
) -> Result<Option<User>, UserError> {
    let found = ctx
        .conn
        .query_row(
            &format!(
                "SELECT {}, password FROM __users WHERE slug = ?1 OR email = ?1 LIMIT 1",
                COLUMNS
            ),
            params![login.trim()],
            |row| Ok((from_row(row)?, row.get::<_, String>(12)?)),
        )
        .optional()?;

    Ok(found.and_then(|(user, hash)| {
        if bcrypt::verify(password, &hash).unwrap_or(false) {
            Some(normalize(ctx, user))
        } else {
            None
        }
    }))
}

pub fn get_many(ctx: &Ctx<'_>, q: &UserQuery) -> Result<(Vec<User>, Pagination), UserError> {
    let mut filter = Filter::new();
    if let Some(text) = q.query.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = query::like_pattern(text);
        filter.push(
            "(slug LIKE ? ESCAPE '\\' OR name LIKE ? ESCAPE '\\' OR email LIKE ? ESCAPE '\\')",
            [
                query::text(pattern.clone()),
                query::text(pattern.clone()),
                query::text(pattern),
            ],
        );
    }
    if let Some(role) = &q.role {
        let roles = crate::models::split_list(role)
            .iter()
            .map(|r| r.parse::<Role>().map(|r| query::text(r.as_str())))
            .collect::<Result<Vec<_>, _>>()?;
        filter.push_in("role", roles);
    }

    let total: i64 = ctx.conn.query_row(
        &format!("SELECT COUNT(*) FROM __users{}", filter.sql()),
        params_from_iter(filter.params()),
        |row| row.get(0),
    )?;
    let pagination = Pagination::new(total, q.items_per_page, q.page);

    let mut stmt = ctx.conn.prepare(&format!(
        "SELECT {} FROM __users{} ORDER BY name ASC LIMIT ? OFFSET ?",
        COLUMNS,
        filter.sql()
    ))?;
    let users = stmt
        .query_map(params_from_iter(filter.paged_params(&pagination)), from_row)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|u| normalize(ctx, u))
        .collect();

    Ok((users, pagination))
}

fn slug_taken(ctx: &Ctx<'_>, slug: &str, except: Option<i64>) -> Result<bool, UserError> {
    Ok(ctx.conn.query_row(
        "SELECT COUNT(*) > 0 FROM __users WHERE slug = ?1 AND id != ?2",
        params![slug, except.unwrap_or(0)],
        |row| row.get(0),
    )?)
}

fn email_taken(ctx: &Ctx<'_>, email: &str, except: Option<i64>) -> Result<bool, UserError> {
    Ok(ctx.conn.query_row(
        "SELECT COUNT(*) > 0 FROM __users WHERE lower(email) = lower(?1) AND id != ?2",
        params![email, except.unwrap_or(0)],
        |row| row.get(0),
    )?)
}

pub fn add(ctx: &Ctx<'_>, input: &UserInput) -> Result<i64, UserError> {
    let protected = ctx.settings.protected_slugs();
    let slug = input
        .slug
        .as_deref()
        .and_then(|s| slug::validate(s, &protected))
        .ok_or(UserError::InvalidSlug)?;
    if slug_taken(ctx, &slug, None)? {
        return Err(UserError::AlreadyExists);
    }

    let name = input.name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(UserError::MissingName);
    }

    let email = input.email.as_deref().map(str::trim).unwrap_or_default();
    if !valid_email(email) {
        return Err(UserError::InvalidEmail);
    }
    if email_taken(ctx, email, None)? {
        return Err(UserError::EmailInUse);
    }

    let role = match input.role.as_deref() {
        Some(r) => r.parse()?,
        None => Role::Author,
    };
    if role == Role::Owner && get_owner(ctx)?.is_some() {
        return Err(UserError::OwnerExists);
    }

    let password = hash_password(input.password.as_deref().unwrap_or_default())?;

    ctx.conn.execute(
        "INSERT INTO __users (slug, created, name, email, password, role, bio, cover, avatar,
                              twitter, location, website)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            slug,
            datetime::now_utc(),
            name,
            email,
            password,
            role.as_str(),
            input.bio.as_deref().unwrap_or_default(),
            input.cover.as_deref().unwrap_or_default(),
            input.avatar.as_deref().unwrap_or_default(),
            input.twitter.as_deref().unwrap_or_default(),
            input.location.as_deref().unwrap_or_default(),
            input.website.as_deref().unwrap_or_default(),
        ],
    )?;
    let id = ctx.conn.last_insert_rowid();

    tracing::info!(user = %slug, role = %role, "User created");
    ctx.events.publish(Event::UserCreated { id, slug });
    Ok(id)
}

pub fn update(ctx: &Ctx<'_>, slug: &str, input: &UserInput) -> Result<(), UserError> {
    let existing = get(ctx, slug)?.ok_or(UserError::NotFound)?;

    let new_slug = match input.slug.as_deref() {
        Some(s) if s != existing.slug => {
            let protected = ctx.settings.protected_slugs();
            let s = slug::validate(s, &protected).ok_or(UserError::InvalidSlug)?;
            if slug_taken(ctx, &s, Some(existing.id))? {
                return Err(UserError::AlreadyExists);
            }
            s
        }
        _ => existing.slug.clone(),
    };

    let name = match input.name.as_deref().map(str::trim) {
        Some("") => return Err(UserError::MissingName),
        Some(n) => n.to_string(),
        None => existing.name.clone(),
    };

    let email = match input.email.as_deref().map(str::trim) {
        Some(e) => {
            if !valid_email(e) {
                return Err(UserError::InvalidEmail);
            }
            if email_taken(ctx, e, Some(existing.id))? {
                return Err(UserError::EmailInUse);
            }
            e.to_string()
        }
        None => existing.email.clone(),
    };

    let role = match input.role.as_deref() {
        Some(r) => r.parse()?,
        None => existing.role,
    };
    if existing.role == Role::Owner && role != Role::Owner {
        return Err(UserError::OwnerRoleChange);
    }

    let password = match input.password.as_deref().filter(|p| !p.is_empty()) {
        Some(p) => Some(hash_password(p)?),
        None => None,
    };

    let pick = |new: &Option<String>, old: &str| new.clone().unwrap_or_else(|| old.to_string());

    ctx.conn.transaction(|c| {
        // Promoting someone to owner demotes the current owner
        if role == Role::Owner && existing.role != Role::Owner {
            c.execute(
                "UPDATE __users SET role = 'admin' WHERE role = 'owner'",
                [],
            )?;
        }

        c.execute(
            "UPDATE __users SET slug = ?1, name = ?2, email = ?3, role = ?4, bio = ?5,
                    cover = ?6, avatar = ?7, twitter = ?8, location = ?9, website = ?10
             WHERE id = ?11",
            params![
                new_slug,
                name,
                email,
                role.as_str(),
                pick(&input.bio, &existing.bio),
                pick(&input.cover, &existing.cover),
                pick(&input.avatar, &existing.avatar),
                pick(&input.twitter, &existing.twitter),
                pick(&input.location, &existing.location),
                pick(&input.website, &existing.website),
                existing.id,
            ],
        )?;

        if let Some(hash) = &password {
            c.execute(
                "UPDATE __users SET password = ?1, reset_token = '' WHERE id = ?2",
                params![hash, existing.id],
            )?;
        }
        Ok::<_, UserError>(())
    })?;

    ctx.events.publish(Event::UserUpdated {
        id: existing.id,
        slug: new_slug,
    });
    Ok(())
}

/// Delete a user, handing their posts to `recipient` (the owner by default).
pub fn delete(ctx: &Ctx<'_>, slug: &str, recipient: Option<&str>) -> Result<(), UserError> {
    let user = get(ctx, slug)?.ok_or(UserError::NotFound)?;
    if user.role == Role::Owner {
        return Err(UserError::CannotDeleteOwner);
    }

    let recipient = match recipient {
        Some(r) => get(ctx, r)?,
        None => get_owner(ctx)?,
    }
    .ok_or(UserError::InvalidRecipient)?;
    if recipient.id == user.id {
        return Err(UserError::InvalidRecipient);
    }

    ctx.conn.transaction(|c| {
        c.execute(
            "UPDATE __posts SET author = ?1 WHERE author = ?2",
            params![recipient.id, user.id],
        )?;
        c.execute("DELETE FROM __users WHERE id = ?1", params![user.id])?;
        Ok::<_, UserError>(())
    })?;

    tracing::info!(user = %user.slug, recipient = %recipient.slug, "User deleted");
    ctx.events.publish(Event::UserDeleted {
        slug: user.slug,
        posts_reassigned_to: recipient.id,
    });
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::tests::Fixture;

    pub(crate) fn input(slug: &str, role: &str) -> UserInput {
        UserInput {
            slug: Some(slug.to_string()),
            name: Some(format!("{} name", slug)),
            email: Some(format!("{}@example.com", crate::slug::slugify(slug))),
            password: Some("correct horse".to_string()),
            role: Some(role.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn add_and_get_user() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);

        let id = add(&ctx, &input("Jane Doe", "editor")).unwrap();
        let user = get(&ctx, "jane-doe").unwrap().unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.role, Role::Editor);
        assert_eq!(user.email, "jane-doe@example.com");
        assert_eq!(get_by_id(&ctx, id).unwrap().unwrap().slug, "jane-doe");
    }

    #[test]
    fn validation_errors() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        add(&ctx, &input("jane", "owner")).unwrap();

        assert!(matches!(add(&ctx, &input("jane", "author")), Err(UserError::AlreadyExists)));
        assert!(matches!(add(&ctx, &input("api", "author")), Err(UserError::InvalidSlug)));
        assert!(matches!(add(&ctx, &input("tag", "author")), Err(UserError::InvalidSlug)));
        assert!(matches!(add(&ctx, &input("bob", "owner")), Err(UserError::OwnerExists)));
        assert!(matches!(add(&ctx, &input("bob", "king")), Err(UserError::InvalidRole(_))));

        let mut bad_email = input("bob", "author");
        bad_email.email = Some("not-an-email".into());
        assert!(matches!(add(&ctx, &bad_email), Err(UserError::InvalidEmail)));

        let mut dup_email = input("bob", "author");
        dup_email.email = Some("JANE@example.com".into());
        assert!(matches!(add(&ctx, &dup_email), Err(UserError::EmailInUse)));

        let mut short = input("bob", "author");
        short.password = Some("short".into());
        assert!(matches!(add(&ctx, &short), Err(UserError::PasswordTooShort)));
    }

    #[test]
    fn verify_password_by_slug_or_email() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        add(&ctx, &input("jane", "owner")).unwrap();

        assert!(verify_password(&ctx, "jane", "correct horse").unwrap().is_some());
        assert!(verify_password(&ctx, "jane@example.com", "correct horse")
            .unwrap()
            .is_some());
        assert!(verify_password(&ctx, "jane", "wrong password").unwrap().is_none());
        assert!(verify_password(&ctx, "nobody", "correct horse").unwrap().is_none());
    }

    #[test]
    fn ownership_transfers_on_promotion() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        add(&ctx, &input("jane", "owner")).unwrap();
        add(&ctx, &input("bob", "admin")).unwrap();

        let demote = UserInput {
            role: Some("admin".into()),
            ..Default::default()
        };
        assert!(matches!(update(&ctx, "jane", &demote), Err(UserError::OwnerRoleChange)));

        let promote = UserInput {
            role: Some("owner".into()),
            ..Default::default()
        };
        update(&ctx, "bob", &promote).unwrap();

        assert_eq!(get(&ctx, "bob").unwrap().unwrap().role, Role::Owner);
        assert_eq!(get(&ctx, "jane").unwrap().unwrap().role, Role::Admin);
        let owners: i64 = conn
            .query_row("SELECT COUNT(*) FROM __users WHERE role = 'owner'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(owners, 1);
    }

    #[test]
    fn update_changes_password_and_slug() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        add(&ctx, &input("jane", "owner")).unwrap();

        let change = UserInput {
            slug: Some("janet".into()),
            password: Some("new password!".into()),
            ..Default::default()
        };
        update(&ctx, "jane", &change).unwrap();

        assert!(get(&ctx, "jane").unwrap().is_none());
        assert!(verify_password(&ctx, "janet", "new password!").unwrap().is_some());
    }

    #[test]
    fn delete_reassigns_posts_to_owner() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        let owner = add(&ctx, &input("jane", "owner")).unwrap();
        let author = add(&ctx, &input("bob", "author")).unwrap();
        conn.execute(
            "INSERT INTO __posts (slug, author) VALUES ('hello', ?1)",
            params![author],
        )
        .unwrap();

        assert!(matches!(delete(&ctx, "jane", None), Err(UserError::CannotDeleteOwner)));
        assert!(matches!(delete(&ctx, "bob", Some("bob")), Err(UserError::InvalidRecipient)));

        delete(&ctx, "bob", None).unwrap();
        let post_author: i64 = conn
            .query_row("SELECT author FROM __posts WHERE slug = 'hello'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(post_author, owner);
        assert!(get(&ctx, "bob").unwrap().is_none());
    }

    #[test]
    fn get_many_filters_by_role_and_query() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        add(&ctx, &input("jane", "owner")).unwrap();
        add(&ctx, &input("bob", "author")).unwrap();
        add(&ctx, &input("bobby", "editor")).unwrap();

        let (users, pagination) = get_many(
            &ctx,
            &UserQuery {
                query: Some("bob".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(pagination.total_items, 2);

        let (users, _) = get_many(
            &ctx,
            &UserQuery {
                role: Some("owner,editor".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let slugs: Vec<_> = users.iter().map(|u| u.slug.as_str()).collect();
        assert_eq!(slugs, vec!["bobby", "jane"]);
    }
}
