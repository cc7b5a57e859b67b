//! RSS 2.0 feed of the latest published posts.

use rss::{ChannelBuilder, Guid, Item};
use serde::Deserialize;

use crate::datetime;
use crate::models::post::{self, PostError, PostQuery};
use crate::models::Ctx;
use crate::render::helpers::Urls;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedQuery {
    pub tag: Option<String>,
    pub author: Option<String>,
}

/// Render the feed. `base_url` is the scheme and host links are built on,
/// without a trailing slash.
pub fn build(ctx: &Ctx<'_>, base_url: &str, q: &FeedQuery) -> Result<String, PostError> {
    let settings = ctx.settings.all();
    let urls = Urls::from_settings(&settings);
    let base = base_url.trim_end_matches('/');

    let (posts, _) = post::get_many(
        ctx,
        &PostQuery {
            tag: q.tag.clone().filter(|t| !t.is_empty()),
            author: q.author.clone().filter(|a| !a.is_empty()),
            ignore_pages: true,
            items_per_page: ctx.settings.posts_per_page(),
            ..Default::default()
        },
    )?;

    let items: Vec<Item> = posts
        .iter()
        .map(|post| {
            let link = format!("{}{}", base, urls.post(&post.slug));
            let mut item = Item::default();
            item.set_title(post.title.clone());
            item.set_link(link.clone());
            item.set_guid(Guid {
                value: link,
                permalink: true,
            });
            // Posts come back in display time; the feed wants the stored UTC
            let pub_date = post::stored_pub_date(ctx, post.id)
                .ok()
                .and_then(|utc| datetime::rfc2822(&utc).ok());
            if let Some(date) = pub_date {
                item.set_pub_date(date);
            }
            item.set_description(post.content.clone());
            item
        })
        .collect();

    let title = settings.get("title").cloned().unwrap_or_default();
    let description = settings.get("tagline").cloned().unwrap_or_default();
    let channel = ChannelBuilder::default()
        .title(title)
        .link(format!("{}{}", base, urls.home()))
        .description(description)
        .language(settings.get("language").cloned())
        .generator(Some(format!("Leafpub {}", env!("CARGO_PKG_VERSION"))))
        .items(items)
        .build();

    Ok(channel.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::post::PostInput;
    use crate::models::tag::{self, TagInput};
    use crate::models::tests::Fixture;
    use crate::models::user;
    use std::collections::BTreeMap;

    fn publish(ctx: &Ctx<'_>, title: &str, content: &str, tags: &[&str], author: &str) {
        post::add(
            ctx,
            &PostInput {
                title: Some(title.into()),
                content: Some(content.into()),
                author: Some(author.into()),
                status: Some("published".into()),
                pub_date: Some("2016-01-02 03:04:05".into()),
                tags: Some(tags.iter().map(|t| t.to_string()).collect()),
                ..Default::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn feed_lists_published_posts_with_escaped_content() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        user::add(&ctx, &user::tests::input("jane", "owner")).unwrap();
        publish(&ctx, "Fish & Chips", "<p>Tasty</p>", &[], "jane");
        post::add(
            &ctx,
            &PostInput {
                title: Some("Secret draft".into()),
                author: Some("jane".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let xml = build(&ctx, "http://example.com/", &FeedQuery::default()).unwrap();
        let channel: rss::Channel = xml.parse().unwrap();
        assert_eq!(channel.title(), "A Leafpub Blog");
        assert_eq!(channel.link(), "http://example.com/");
        assert_eq!(channel.items().len(), 1);

        let item = &channel.items()[0];
        assert_eq!(item.title(), Some("Fish & Chips"));
        assert_eq!(item.link(), Some("http://example.com/fish-chips"));
        assert_eq!(item.description(), Some("<p>Tasty</p>"));
        assert_eq!(item.pub_date(), Some("Sat, 2 Jan 2016 03:04:05 +0000"));
        assert!(!xml.contains("Fish & Chips"));
    }

    #[test]
    fn feed_dates_come_from_the_stored_utc_value() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        f.settings
            .update(
                &conn,
                &BTreeMap::from([("timezone".to_string(), "America/New_York".to_string())]),
            )
            .unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        user::add(&ctx, &user::tests::input("jane", "owner")).unwrap();
        publish(&ctx, "Fall Back", "a", &[], "jane");
        // Shown as 01:30 local, an hour New York passes through twice
        conn.execute(
            "UPDATE __posts SET pub_date = '2016-11-06 06:30:00' WHERE slug = 'fall-back'",
            [],
        )
        .unwrap();

        let xml = build(&ctx, "http://example.com", &FeedQuery::default()).unwrap();
        let channel: rss::Channel = xml.parse().unwrap();
        assert_eq!(
            channel.items()[0].pub_date(),
            Some("Sun, 6 Nov 2016 06:30:00 +0000")
        );
    }

    #[test]
    fn feed_filters_by_tag_and_author() {
        let f = Fixture::new();
        let conn = f.db.conn().unwrap();
        let ctx = Ctx::new(&conn, &f.settings, &f.events);
        user::add(&ctx, &user::tests::input("jane", "owner")).unwrap();
        user::add(&ctx, &user::tests::input("bob", "author")).unwrap();
        tag::add(
            &ctx,
            &TagInput {
                name: Some("Rust".into()),
                ..Default::default()
            },
        )
        .unwrap();
        publish(&ctx, "Tagged", "a", &["rust"], "jane");
        publish(&ctx, "By Bob", "b", &[], "bob");

        let tagged = build(
            &ctx,
            "http://example.com",
            &FeedQuery {
                tag: Some("rust".into()),
                author: None,
            },
        )
        .unwrap();
        let channel: rss::Channel = tagged.parse().unwrap();
        assert_eq!(channel.items().len(), 1);
        assert_eq!(channel.items()[0].title(), Some("Tagged"));

        let by_bob = build(
            &ctx,
            "http://example.com",
            &FeedQuery {
                tag: None,
                author: Some("bob".into()),
            },
        )
        .unwrap();
        let channel: rss::Channel = by_bob.parse().unwrap();
        assert_eq!(channel.items().len(), 1);
        assert_eq!(channel.items()[0].title(), Some("By Bob"));
    }
}
