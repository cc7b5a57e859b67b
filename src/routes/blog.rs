//! The themed front end. Paths are matched against the URL fragments in
//! settings at request time, so renaming a fragment needs no restart.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::session;
use crate::error::AppError;
use crate::extractors::MaybeUser;
use crate::feed::{self, FeedQuery};
use crate::models::post::{self, Direction, PostQuery};
use crate::models::user::{self, User};
use crate::models::{tag, Ctx, Flag};
use crate::query::Pagination;
use crate::render::helpers::Urls;
use crate::render::{RequestContext, RequestInfo};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(front))
        .route("/{*path}", get(front))
}

/// What a front-end path points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    Blog(i64),
    Post(String),
    Tag(String, i64),
    Author(String, i64),
    Search,
    Feed,
}

fn page_number(value: &str) -> Option<i64> {
    value.parse().ok().filter(|n| *n >= 1)
}

/// Match `path` against the configured fragments. `homepage` is the slug of
/// a page shown at `/`, which moves the blog index to `/<frag_blog>`.
pub fn resolve(path: &str, urls: &Urls, homepage: Option<&str>) -> Option<Page> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let frag = |name: &str| urls.fragment(name).to_string();

    match segments.as_slice() {
        [] => Some(match homepage {
            Some(slug) => Page::Post(slug.to_string()),
            None => Page::Blog(1),
        }),
        [blog] if homepage.is_some() && *blog == frag("blog") => Some(Page::Blog(1)),
        [p, n] if *p == frag("page") => page_number(n).map(Page::Blog),
        [t, slug] if *t == frag("tag") => Some(Page::Tag(slug.to_string(), 1)),
        [t, slug, p, n] if *t == frag("tag") && *p == frag("page") => {
            page_number(n).map(|n| Page::Tag(slug.to_string(), n))
        }
        [a, slug] if *a == frag("author") => Some(Page::Author(slug.to_string(), 1)),
        [a, slug, p, n] if *a == frag("author") && *p == frag("page") => {
            page_number(n).map(|n| Page::Author(slug.to_string(), n))
        }
        [s] if *s == frag("search") => Some(Page::Search),
        [f] if *f == frag("feed") => Some(Page::Feed),
        [slug] => Some(Page::Post(slug.to_string())),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FrontParams {
    pub s: Option<String>,
    pub page: Option<i64>,
    pub tag: Option<String>,
    pub author: Option<String>,
    pub editable: Option<Flag>,
}

fn request_context(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
    user: Option<&User>,
) -> RequestContext {
    RequestContext {
        cookies: session::cookies(headers)
            .into_iter()
            .filter(|(name, _)| *name != state.config.auth.cookie_name)
            .collect(),
        request: RequestInfo {
            path: uri.path().to_string(),
            query: uri.query().unwrap_or_default().to_string(),
            host: host(headers),
        },
        settings: state.settings.public(),
        user: user.and_then(|u| serde_json::to_value(u).ok()),
    }
}

fn host(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost")
        .to_string()
}

fn base_url(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .filter(|s| *s == "https")
        .unwrap_or("http");
    format!("{}://{}", scheme, host(headers))
}

/// A user as themes see them: no email address.
fn public_user(user: &User) -> Value {
    let mut value = serde_json::to_value(user).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("email");
    }
    value
}

fn pagination_value(p: &Pagination, url: impl Fn(i64) -> String) -> Value {
    let mut value = serde_json::to_value(p).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert(
            "previous_url".to_string(),
            p.previous_page.map(&url).map_or(Value::Null, Value::String),
        );
        map.insert(
            "next_url".to_string(),
            p.next_page.map(&url).map_or(Value::Null, Value::String),
        );
    }
    value
}

fn html(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Render a theme template. Failures are logged and answered with the
/// error page instead.
fn render_page(
    state: &AppState,
    rctx: &RequestContext,
    name: &str,
    data: Value,
    editable: bool,
    status: StatusCode,
) -> Response {
    let theme = state.settings.get_or("theme", "default");
    match state.renderer.render(&theme, name, data, rctx, editable) {
        Ok(body) => html(status, body),
        Err(e) => {
            tracing::error!(theme = %theme, template = %name, "Render failed: {}", e);
            error_page(
                state,
                rctx,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong",
                "This page could not be displayed.",
            )
        }
    }
}

/// The theme's error template, or the built-in page if the theme can't
/// render one either.
fn error_page(
    state: &AppState,
    rctx: &RequestContext,
    status: StatusCode,
    title: &str,
    message: &str,
) -> Response {
    let theme = state.settings.get_or("theme", "default");
    let data = json!({
        "meta": { "title": title },
        "error": { "title": title, "message": message, "status": status.as_u16() },
    });
    match state.renderer.render(&theme, "error", data, rctx, false) {
        Ok(body) => html(status, body),
        Err(e) => {
            tracing::error!(theme = %theme, "Error template failed: {}", e);
            super::system::page(status, title, message)
        }
    }
}

fn not_found(state: &AppState, rctx: &RequestContext) -> Response {
    error_page(
        state,
        rctx,
        StatusCode::NOT_FOUND,
        "Not found",
        "The page you're looking for doesn't exist.",
    )
}

pub async fn front(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Query(params): Query<FrontParams>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let rctx = request_context(&state, &headers, &uri, user.as_ref());

    if state.settings.is_on("maintenance") && user.is_none() {
        return render_page(
            &state,
            &rctx,
            "maintenance",
            json!({ "meta": { "title": "Maintenance" } }),
            false,
            StatusCode::SERVICE_UNAVAILABLE,
        );
    }

    let urls = Urls::from_settings(&rctx.settings);
    let homepage = state.settings.get("homepage").filter(|h| !h.is_empty());
    let Some(page) = resolve(uri.path(), &urls, homepage.as_deref()) else {
        return not_found(&state, &rctx);
    };

    match serve(&state, &rctx, &urls, page, &params, user.as_ref(), &headers) {
        Ok(Some(response)) => response,
        Ok(None) => not_found(&state, &rctx),
        Err(e) => {
            tracing::error!(path = %uri.path(), "Front page failed: {}", e);
            error_page(
                &state,
                &rctx,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong",
                "This page could not be displayed.",
            )
        }
    }
}

/// `Ok(None)` means the thing named in the path doesn't exist.
fn serve(
    state: &AppState,
    rctx: &RequestContext,
    urls: &Urls,
    page: Page,
    params: &FrontParams,
    user: Option<&User>,
    headers: &HeaderMap,
) -> Result<Option<Response>, AppError> {
    let conn = state.db.conn()?;
    let ctx = state.ctx(&conn);
    let per_page = state.settings.posts_per_page();
    let listing = |page: i64| PostQuery {
        page,
        items_per_page: per_page,
        ignore_pages: true,
        ..Default::default()
    };

    let response = match page {
        Page::Blog(n) => {
            let (posts, pagination) = post::get_many(&ctx, &listing(n))?;
            let data = json!({
                "posts": posts,
                "pagination": pagination_value(&pagination, |p| urls.blog_page(p)),
            });
            render_page(state, rctx, "blog", data, false, StatusCode::OK)
        }
        Page::Post(slug) => return show_post(state, rctx, &ctx, &slug, params, user),
        Page::Tag(slug, n) => {
            let Some(tag) = tag::get(&ctx, &slug)? else {
                return Ok(None);
            };
            let (posts, pagination) = post::get_many(
                &ctx,
                &PostQuery {
                    tag: Some(slug.clone()),
                    ..listing(n)
                },
            )?;
            let title = if tag.meta_title.is_empty() {
                tag.name.clone()
            } else {
                tag.meta_title.clone()
            };
            let meta = json!({ "title": title, "description": tag.meta_description });
            let data = json!({
                "tag": tag,
                "posts": posts,
                "pagination": pagination_value(&pagination, |p| urls.tag(&slug, p)),
                "meta": meta,
            });
            render_page(state, rctx, "tag", data, false, StatusCode::OK)
        }
        Page::Author(slug, n) => {
            let Some(author) = user::get(&ctx, &slug)? else {
                return Ok(None);
            };
            let (posts, pagination) = post::get_many(
                &ctx,
                &PostQuery {
                    author: Some(slug.clone()),
                    ..listing(n)
                },
            )?;
            let data = json!({
                "author": public_user(&author),
                "posts": posts,
                "pagination": pagination_value(&pagination, |p| urls.author(&slug, p)),
                "meta": { "title": author.name, "description": author.bio },
            });
            render_page(state, rctx, "author", data, false, StatusCode::OK)
        }
        Page::Search => {
            let query = params.s.clone().unwrap_or_default().trim().to_string();
            let data = if query.is_empty() {
                json!({ "search": { "query": "" }, "posts": [] })
            } else {
                let (posts, pagination) = post::get_many(
                    &ctx,
                    &PostQuery {
                        query: Some(query.clone()),
                        ..listing(params.page.unwrap_or(1))
                    },
                )?;
                json!({
                    "search": { "query": query },
                    "posts": posts,
                    "pagination": pagination_value(&pagination, |p| urls.search(&query, p)),
                    "meta": { "title": format!("Search: {}", query) },
                })
            };
            render_page(state, rctx, "search", data, false, StatusCode::OK)
        }
        Page::Feed => {
            let xml = feed::build(
                &ctx,
                &base_url(headers),
                &FeedQuery {
                    tag: params.tag.clone(),
                    author: params.author.clone(),
                },
            )?;
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/rss+xml; charset=utf-8")],
                xml,
            )
                .into_response()
        }
    };
    Ok(Some(response))
}

/// A post or page. Signed-in users also see drafts and scheduled posts, and
/// may ask for the editable rendering.
fn show_post(
    state: &AppState,
    rctx: &RequestContext,
    ctx: &Ctx<'_>,
    slug: &str,
    params: &FrontParams,
    user: Option<&User>,
) -> Result<Option<Response>, AppError> {
    let found = match user {
        Some(_) => post::get(ctx, slug)?,
        None => post::get_published(ctx, slug)?,
    };
    let Some(found) = found else {
        return Ok(None);
    };
    let author = user::get_by_id(ctx, found.author)?;
    let editable = user.is_some() && params.editable.is_some_and(|f| f.0);

    let (template, prev, next) = if found.page {
        ("page", None, None)
    } else {
        (
            "post",
            post::get_adjacent(ctx, slug, Direction::Previous)?,
            post::get_adjacent(ctx, slug, Direction::Next)?,
        )
    };
    let title = if found.meta_title.is_empty() {
        found.title.clone()
    } else {
        found.meta_title.clone()
    };

    let meta = json!({ "title": title, "description": found.meta_description });
    let data = json!({
        "post": found,
        "author": author.as_ref().map(public_user),
        "prev": prev,
        "next": next,
        "meta": meta,
    });
    Ok(Some(render_page(
        state,
        rctx,
        template,
        data,
        editable,
        StatusCode::OK,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn urls(overrides: &[(&str, &str)]) -> Urls {
        let settings: BTreeMap<String, String> = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Urls::from_settings(&settings)
    }

    #[test]
    fn paths_resolve_against_default_fragments() {
        let u = urls(&[]);
        assert_eq!(resolve("/", &u, None), Some(Page::Blog(1)));
        assert_eq!(resolve("/page/3", &u, None), Some(Page::Blog(3)));
        assert_eq!(resolve("/page/0", &u, None), None);
        assert_eq!(resolve("/hello-world", &u, None), Some(Page::Post("hello-world".into())));
        assert_eq!(resolve("/tag/rust", &u, None), Some(Page::Tag("rust".into(), 1)));
        assert_eq!(
            resolve("/tag/rust/page/2", &u, None),
            Some(Page::Tag("rust".into(), 2))
        );
        assert_eq!(
            resolve("/author/jane/page/4", &u, None),
            Some(Page::Author("jane".into(), 4))
        );
        assert_eq!(resolve("/search", &u, None), Some(Page::Search));
        assert_eq!(resolve("/feed", &u, None), Some(Page::Feed));
        assert_eq!(resolve("/a/b/c", &u, None), None);
    }

    #[test]
    fn renamed_fragments_take_effect() {
        let u = urls(&[("frag_tag", "topic"), ("frag_page", "p")]);
        assert_eq!(
            resolve("/topic/rust/p/2", &u, None),
            Some(Page::Tag("rust".into(), 2))
        );
        assert_eq!(resolve("/tag", &u, None), Some(Page::Post("tag".into())));
        assert_eq!(resolve("/p/2", &u, None), Some(Page::Blog(2)));
    }

    #[test]
    fn homepage_moves_the_blog_index() {
        let u = urls(&[]);
        assert_eq!(resolve("/", &u, Some("welcome")), Some(Page::Post("welcome".into())));
        assert_eq!(resolve("/blog", &u, Some("welcome")), Some(Page::Blog(1)));
        assert_eq!(resolve("/blog", &u, None), Some(Page::Post("blog".into())));
    }

    #[test]
    fn pagination_carries_urls() {
        let p = Pagination::new(25, 10, 2);
        let value = pagination_value(&p, |n| format!("/page/{}", n));
        assert_eq!(value["previous_url"], "/page/1");
        assert_eq!(value["next_url"], "/page/3");
        assert_eq!(value["total_pages"], 3);

        let last = pagination_value(&Pagination::new(25, 10, 3), |n| format!("/page/{}", n));
        assert!(last["next_url"].is_null());
    }
}
