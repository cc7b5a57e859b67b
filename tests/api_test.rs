mod common;

use axum::http::{header, StatusCode};
use serde_json::json;

use common::{get, json_request, send, Site};

#[tokio::test]
async fn login_sets_a_cookie_and_session_reports_the_user() {
    let site = Site::new();
    let cookie = site.login("owner").await;
    assert!(cookie.starts_with("authToken="));

    let reply = send(site.app(), get("/api/session", Some(&cookie))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["user"]["slug"], "owner");
    assert_eq!(body["user"]["role"], "owner");
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let site = Site::new();
    let body = json!({ "username": "owner", "password": "wrong password" });
    let reply = send(site.app(), json_request("POST", "/api/login", None, &body)).await;

    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    let body = reply.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["invalid"], json!(["password"]));
    assert!(reply.headers.get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn api_requires_a_session() {
    let site = Site::new();
    for uri in ["/api/posts", "/api/session", "/api/settings", "/api/backups"] {
        let reply = send(site.app(), get(uri, None)).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED, "{}", uri);
    }

    let reply = send(site.app(), get("/api/posts", Some("authToken=garbage"))).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn post_lifecycle_through_the_api() {
    let site = Site::new();
    let cookie = site.login("owner").await;
    let app = site.app();

    let tag = json!({ "name": "Rust" });
    let reply = send(app.clone(), json_request("POST", "/api/tags", Some(&cookie), &tag)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["tag"]["slug"], "rust");

    let post = json!({
        "title": "Hello World",
        "content": "<p>First post</p>",
        "status": "published",
        "tags": ["rust"],
    });
    let reply = send(app.clone(), json_request("POST", "/api/posts", Some(&cookie), &post)).await;
    assert_eq!(reply.status, StatusCode::OK);
    let created = reply.json();
    assert_eq!(created["post"]["slug"], "hello-world");
    assert_eq!(created["post"]["tags"][0]["slug"], "rust");

    let reply = send(app.clone(), json_request("POST", "/api/posts", Some(&cookie), &post)).await;
    assert_eq!(reply.status, StatusCode::CONFLICT);

    let change = json!({ "title": "Hello Again" });
    let reply = send(
        app.clone(),
        json_request("PUT", "/api/posts/hello-world", Some(&cookie), &change),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["post"]["title"], "Hello Again");

    let reply = send(app.clone(), get("/api/posts/hello-world/history", Some(&cookie))).await;
    let history = reply.json()["history"].as_array().unwrap().clone();
    assert_eq!(history.len(), 2);

    let reply = send(app.clone(), get("/api/posts?tag=rust", Some(&cookie))).await;
    let body = reply.json();
    assert_eq!(body["pagination"]["total_items"], 1);
    assert_eq!(body["posts"][0]["title"], "Hello Again");

    let reply = send(
        app.clone(),
        json_request("DELETE", "/api/posts/hello-world", Some(&cookie), &json!({})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let reply = send(app, get("/api/posts/hello-world", Some(&cookie))).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn authors_only_touch_their_own_posts() {
    let site = Site::new();
    site.add_user("alice", "author");
    site.add_user("bob", "author");
    let alice = site.login("alice").await;
    let bob = site.login("bob").await;
    let app = site.app();

    // Authors can't publish under someone else's name
    let post = json!({ "title": "Alice Writes", "author": "owner" });
    let reply = send(app.clone(), json_request("POST", "/api/posts", Some(&alice), &post)).await;
    assert_eq!(reply.status, StatusCode::OK);
    let author_id = reply.json()["post"]["author"].clone();

    let reply = send(app.clone(), get("/api/users/alice", Some(&alice))).await;
    assert_eq!(reply.json()["user"]["id"], author_id);

    let change = json!({ "title": "Bob Was Here" });
    let reply = send(
        app.clone(),
        json_request("PUT", "/api/posts/alice-writes", Some(&bob), &change),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);

    let tag = json!({ "name": "Nope" });
    let reply = send(app.clone(), json_request("POST", "/api/tags", Some(&bob), &tag)).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);

    let reply = send(app, get("/api/settings", Some(&bob))).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn settings_update_validates_and_hides_the_key() {
    let site = Site::new();
    let cookie = site.login("owner").await;
    let app = site.app();

    let reply = send(app.clone(), get("/api/settings", Some(&cookie))).await;
    let body = reply.json();
    assert_eq!(body["settings"]["title"], "A Leafpub Blog");
    assert!(body["settings"].get("auth_key").is_none());

    let change = json!({ "title": "Renamed", "posts_per_page": 3 });
    let reply = send(app.clone(), json_request("PUT", "/api/settings", Some(&cookie), &change)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(site.state.settings.get("title").as_deref(), Some("Renamed"));
    assert_eq!(site.state.settings.posts_per_page(), 3);

    let bad = json!({ "timezone": "Mars/Olympus" });
    let reply = send(app.clone(), json_request("PUT", "/api/settings", Some(&cookie), &bad)).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    let key = json!({ "auth_key": "stolen" });
    let reply = send(app.clone(), json_request("PUT", "/api/settings", Some(&cookie), &key)).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    let theme = json!({ "theme": "missing" });
    let reply = send(app, json_request("PUT", "/api/settings", Some(&cookie), &theme)).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(site.state.settings.get("theme").as_deref(), Some("default"));
}

#[tokio::test]
async fn backups_can_be_created_downloaded_and_restored() {
    let site = Site::new();
    let cookie = site.login("owner").await;
    let app = site.app();

    let post = json!({ "title": "Keep Me", "status": "published" });
    send(app.clone(), json_request("POST", "/api/posts", Some(&cookie), &post)).await;

    let reply = send(app.clone(), json_request("POST", "/api/backups", Some(&cookie), &json!({}))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let filename = reply.json()["backup"]["filename"].as_str().unwrap().to_string();
    assert!(filename.ends_with(".tar"));

    let reply = send(app.clone(), get(&format!("/api/backups/{}", filename), Some(&cookie))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers[header::CONTENT_TYPE], "application/x-tar");
    assert!(!reply.body.is_empty());

    send(
        app.clone(),
        json_request("DELETE", "/api/posts/keep-me", Some(&cookie), &json!({})),
    )
    .await;

    let reply = send(
        app.clone(),
        json_request(
            "POST",
            &format!("/api/backups/{}/restore", filename),
            Some(&cookie),
            &json!({}),
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let reply = send(app.clone(), get("/api/posts/keep-me", Some(&cookie))).await;
    assert_eq!(reply.status, StatusCode::OK);

    let reply = send(app, get("/api/backups/..%2Fconfig.toml", Some(&cookie))).await;
    assert!(reply.status.is_client_error());
}

#[tokio::test]
async fn import_creates_tags_and_posts() {
    let site = Site::new();
    let cookie = site.login("owner").await;
    let doc = json!({
        "tags": [{ "name": "News" }],
        "posts": [
            { "title": "Imported One", "status": "published", "tags": ["news"] },
            { "title": "Imported Two" },
        ],
    });
    let reply = send(site.app(), json_request("POST", "/api/import", Some(&cookie), &doc)).await;
    assert_eq!(reply.status, StatusCode::OK);
    let summary = &reply.json()["summary"];
    assert_eq!(summary["tags_created"], 1);
    assert_eq!(summary["posts_created"], 2);

    let reply = send(site.app(), get("/api/posts/imported-two", Some(&cookie))).await;
    assert_eq!(reply.json()["post"]["status"], "draft");
}

#[tokio::test]
async fn uploaded_files_are_served_sandboxed() {
    let site = Site::new();
    let dir = site.state.config.uploads_path().join("2016/01");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("logo.svg"),
        r#"<svg xmlns="http://www.w3.org/2000/svg"><script>alert(1)</script></svg>"#,
    )
    .unwrap();

    let reply = send(site.app(), get("/content/uploads/2016/01/logo.svg", None)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["content-type"], "image/svg+xml");
    assert_eq!(reply.headers["content-security-policy"], "sandbox");
    assert_eq!(reply.headers["x-content-type-options"], "nosniff");
}
