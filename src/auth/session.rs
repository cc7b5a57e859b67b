use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::events::Event;
use crate::models::user::{self, Role, User, UserError};
use crate::models::Ctx;

/// Seconds of clock skew tolerated when checking `exp`.
pub const LEEWAY_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iat: i64,
    pub exp: i64,
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid username or password")]
    InvalidLogin,

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("You don't have permission to do that")]
    Forbidden,

    #[error("The signing key has not been generated")]
    MissingKey,

    #[error("Invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    User(#[from] UserError),
}

impl SessionError {
    pub fn code(&self) -> u16 {
        match self {
            SessionError::InvalidLogin => 1,
            SessionError::NotAuthenticated => 2,
            SessionError::Forbidden => 3,
            SessionError::Token(_) => 4,
            SessionError::MissingKey | SessionError::User(_) => 100,
        }
    }
}

/// 32 random bytes, hex encoded. Used for the `auth_key` setting.
pub fn generate_key() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

fn secret(ctx: &Ctx<'_>) -> Result<String, SessionError> {
    ctx.settings
        .get("auth_key")
        .filter(|k| !k.is_empty())
        .ok_or(SessionError::MissingKey)
}

pub fn issue(secret: &str, username: &str, lifetime: Duration) -> Result<String, SessionError> {
    let now = Utc::now();
    let claims = Claims {
        iat: now.timestamp(),
        exp: (now + lifetime).timestamp(),
        username: username.to_string(),
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

pub fn verify(secret: &str, token: &str) -> Result<Claims, SessionError> {
    let mut validation = Validation::default();
    validation.leeway = LEEWAY_SECS;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

/// Check credentials and issue a token valid for `lifetime`.
pub fn login(
    ctx: &Ctx<'_>,
    login: &str,
    password: &str,
    lifetime: Duration,
) -> Result<(User, String), SessionError> {
    let user = user::verify_password(ctx, login, password)?.ok_or_else(|| {
        tracing::warn!(login = %login, "Failed login attempt");
        SessionError::InvalidLogin
    })?;
    let token = issue(&secret(ctx)?, &user.slug, lifetime)?;

    tracing::info!(user = %user.slug, "Signed in");
    ctx.events.publish(Event::LoggedIn {
        username: user.slug.clone(),
    });
    Ok((user, token))
}

/// The user a token belongs to. Tokens for deleted users are rejected.
pub fn authenticate(ctx: &Ctx<'_>, token: &str) -> Result<User, SessionError> {
    let claims = verify(&secret(ctx)?, token)?;
    user::get(ctx, &claims.username)?.ok_or(SessionError::NotAuthenticated)
}

pub fn logout(ctx: &Ctx<'_>, user: &User) {
    tracing::info!(user = %user.slug, "Signed out");
    ctx.events.publish(Event::LoggedOut {
        username: user.slug.clone(),
    });
}

pub fn has_role(user: &User, roles: &[Role]) -> bool {
    roles.contains(&user.role)
}

pub fn require_role(user: &User, roles: &[Role]) -> Result<(), SessionError> {
    if has_role(user, roles) {
        Ok(())
    } else {
        Err(SessionError::Forbidden)
    }
}

/// `Set-Cookie` value carrying the token.
pub fn cookie(name: &str, token: &str, lifetime: Duration) -> String {
    format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        name,
        token,
        lifetime.num_seconds().max(0)
    )
}

pub fn clear_cookie(name: &str) -> String {
    format!("{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0", name)
}

/// All cookies sent with a request.
pub fn cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(';'))
        .filter_map(|cookie| {
            let (key, val) = cookie.trim().split_once('=')?;
            Some((key.trim().to_string(), val.trim().to_string()))
        })
        .collect()
}

pub fn token_from_headers(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    cookies(headers)
        .into_iter()
        .find(|(key, _)| key == cookie_name)
        .map(|(_, val)| val)
        .filter(|val| !val.is_empty())
}
