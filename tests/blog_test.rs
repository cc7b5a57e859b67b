mod common;

use axum::http::{header, StatusCode};
use serde_json::json;

use common::{get, json_request, send, Site};
use leafpub::models::post::{self, PostInput};

fn publish(site: &Site, title: &str, status: &str) {
    let conn = site.state.db.conn().unwrap();
    post::add(
        &site.state.ctx(&conn),
        &PostInput {
            title: Some(title.to_string()),
            content: Some(format!("<p>{} body</p>", title)),
            author: Some("owner".to_string()),
            status: Some(status.to_string()),
            ..Default::default()
        },
    )
    .unwrap();
}

#[tokio::test]
async fn home_lists_published_posts() {
    let site = Site::new();
    publish(&site, "Visible Post", "published");
    publish(&site, "Secret Draft", "draft");

    let reply = send(site.app(), get("/", None)).await;
    assert_eq!(reply.status, StatusCode::OK);
    let html = reply.text();
    assert!(html.contains("Visible Post"));
    assert!(!html.contains("Secret Draft"));
    assert!(html.contains("A Leafpub Blog"));
}

#[tokio::test]
async fn drafts_are_only_visible_when_signed_in() {
    let site = Site::new();
    publish(&site, "Secret Draft", "draft");

    let reply = send(site.app(), get("/secret-draft", None)).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    let cookie = site.login("owner").await;
    let reply = send(site.app(), get("/secret-draft", Some(&cookie))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.text().contains("Secret Draft body"));
}

#[tokio::test]
async fn unknown_paths_get_the_theme_error_page() {
    let site = Site::new();
    let reply = send(site.app(), get("/no/such/thing", None)).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert!(reply.headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
}

#[tokio::test]
async fn feed_is_rss() {
    let site = Site::new();
    publish(&site, "Feed Item", "published");

    let reply = send(site.app(), get("/feed", None)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("application/rss+xml"));
    let xml = reply.text();
    assert!(xml.contains("<rss"));
    assert!(xml.contains("Feed Item"));
}

#[tokio::test]
async fn search_finds_posts_by_content() {
    let site = Site::new();
    publish(&site, "Gardening Notes", "published");
    publish(&site, "Cooking Notes", "published");

    let reply = send(site.app(), get("/search?s=gardening", None)).await;
    assert_eq!(reply.status, StatusCode::OK);
    let html = reply.text();
    assert!(html.contains("Gardening Notes"));
    assert!(!html.contains("Cooking Notes"));
}

#[tokio::test]
async fn maintenance_mode_blocks_visitors_only() {
    let site = Site::new();
    publish(&site, "Still Here", "published");
    let cookie = site.login("owner").await;

    let change = json!({ "maintenance": "on" });
    let reply = send(
        site.app(),
        json_request("PUT", "/api/settings", Some(&cookie), &change),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let reply = send(site.app(), get("/", None)).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);

    let reply = send(site.app(), get("/", Some(&cookie))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.text().contains("Still Here"));
}

#[tokio::test]
async fn renamed_fragments_move_the_routes() {
    let site = Site::new();
    publish(&site, "Tagged", "published");
    let cookie = site.login("owner").await;

    let change = json!({ "frag_feed": "rss" });
    send(
        site.app(),
        json_request("PUT", "/api/settings", Some(&cookie), &change),
    )
    .await;

    let reply = send(site.app(), get("/rss", None)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.text().contains("<rss"));
}
