use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::{ok, MANAGERS};
use crate::auth::session;
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::models::user::{self, Role, User, UserInput, UserQuery};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    /// Who inherits the deleted user's posts; the owner when absent.
    pub recipient: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", get(list).post(create))
        .route("/users/{slug}", get(show).put(update).delete(remove))
}

/// Whether `actor` may apply `input` to `target`. Anyone may edit their own
/// profile but not their role; managers may edit others, except that only
/// the owner edits the owner or hands over ownership.
fn may_update(actor: &User, target: &User, input: &UserInput) -> bool {
    let role_change = input
        .role
        .as_deref()
        .is_some_and(|r| r.parse::<Role>().ok() != Some(target.role));
    let to_owner = input
        .role
        .as_deref()
        .is_some_and(|r| r.parse::<Role>().ok() == Some(Role::Owner));

    if actor.id == target.id && !role_change {
        return true;
    }
    if !session::has_role(actor, MANAGERS) {
        return false;
    }
    if (target.role == Role::Owner || to_owner) && actor.role != Role::Owner {
        return false;
    }
    true
}

async fn list(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(q): Query<UserQuery>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let (users, pagination) = user::get_many(&state.ctx(&conn), &q)?;
    Ok(ok(json!({ "users": users, "pagination": pagination })))
}

async fn create(
    State(state): State<AppState>,
    actor: CurrentUser,
    Json(input): Json<UserInput>,
) -> AppResult<impl IntoResponse> {
    actor.require(MANAGERS)?;
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    let id = user::add(&ctx, &input)?;
    let created = user::get_by_id(&ctx, id)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "user": created })))
}

async fn show(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(slug): Path<String>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let found = user::get(&state.ctx(&conn), &slug)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "user": found })))
}

async fn update(
    State(state): State<AppState>,
    CurrentUser(actor): CurrentUser,
    Path(slug): Path<String>,
    Json(input): Json<UserInput>,
) -> AppResult<impl IntoResponse> {
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    let target = user::get(&ctx, &slug)?.ok_or(AppError::NotFound)?;
    if !may_update(&actor, &target, &input) {
        return Err(AppError::Forbidden);
    }

    user::update(&ctx, &slug, &input)?;
    let updated = user::get_by_id(&ctx, target.id)?.ok_or(AppError::NotFound)?;
    Ok(ok(json!({ "user": updated })))
}

async fn remove(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(slug): Path<String>,
    Query(params): Query<DeleteParams>,
) -> AppResult<impl IntoResponse> {
    actor.require(MANAGERS)?;
    let conn = state.db.conn()?;
    user::delete(&state.ctx(&conn), &slug, params.recipient.as_deref())?;
    Ok(ok(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(id: i64, role: Role) -> User {
        User {
            id,
            slug: format!("user{}", id),
            created: String::new(),
            name: format!("User {}", id),
            email: format!("user{}@example.com", id),
            role,
            bio: String::new(),
            cover: String::new(),
            avatar: String::new(),
            twitter: String::new(),
            location: String::new(),
            website: String::new(),
        }
    }

    fn role(r: &str) -> UserInput {
        UserInput {
            role: Some(r.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn users_edit_themselves_but_not_their_role() {
        let author = person(2, Role::Author);
        assert!(may_update(&author, &author, &UserInput::default()));
        assert!(may_update(&author, &author, &role("author")));
        assert!(!may_update(&author, &author, &role("editor")));
        assert!(!may_update(&author, &person(3, Role::Author), &UserInput::default()));
    }

    #[test]
    fn only_the_owner_touches_ownership() {
        let owner = person(1, Role::Owner);
        let admin = person(2, Role::Admin);
        let editor = person(3, Role::Editor);

        assert!(may_update(&admin, &editor, &role("admin")));
        assert!(!may_update(&admin, &owner, &UserInput::default()));
        assert!(!may_update(&admin, &editor, &role("owner")));
        assert!(may_update(&owner, &editor, &role("owner")));
    }
}
