//! Theme helpers: `date`, `url`, `title`, `content` and `widget`. Equality
//! checks use Handlebars' built-in `eq`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
};
use serde_json::{Map, Value};

use crate::datetime;
use crate::plugins::PluginRegistry;
use crate::settings::DEFAULTS;

const DEFAULT_DATE_FORMAT: &str = "%B %-d, %Y";

/// Canonical URLs built from the configured fragments.
#[derive(Debug, Clone)]
pub struct Urls {
    fragments: BTreeMap<String, String>,
}

impl Urls {
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Self {
        let fragments = DEFAULTS
            .iter()
            .filter_map(|(name, default)| {
                let frag = name.strip_prefix("frag_")?;
                let value = settings
                    .get(*name)
                    .filter(|v| !v.is_empty())
                    .cloned()
                    .unwrap_or_else(|| default.to_string());
                Some((frag.to_string(), value))
            })
            .collect();
        Self { fragments }
    }

    pub fn fragment<'a>(&'a self, name: &'a str) -> &'a str {
        self.fragments.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn home(&self) -> String {
        "/".to_string()
    }

    pub fn post(&self, slug: &str) -> String {
        format!("/{}", slug)
    }

    /// `/page/2` for the blog index; page 1 is the index itself.
    pub fn blog_page(&self, page: i64) -> String {
        if page <= 1 {
            self.home()
        } else {
            format!("/{}/{}", self.fragment("page"), page)
        }
    }

    pub fn tag(&self, slug: &str, page: i64) -> String {
        self.paged(&format!("/{}/{}", self.fragment("tag"), slug), page)
    }

    pub fn author(&self, slug: &str, page: i64) -> String {
        self.paged(&format!("/{}/{}", self.fragment("author"), slug), page)
    }

    pub fn search(&self, query: &str, page: i64) -> String {
        let base = format!("/{}", self.fragment("search"));
        let query: String = query
            .bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    (b as char).to_string()
                }
                b' ' => "+".to_string(),
                b => format!("%{:02X}", b),
            })
            .collect();
        if page <= 1 {
            format!("{}?s={}", base, query)
        } else {
            format!("{}?s={}&page={}", base, query, page)
        }
    }

    pub fn feed(&self) -> String {
        format!("/{}", self.fragment("feed"))
    }

    pub fn admin(&self) -> String {
        format!("/{}", self.fragment("admin"))
    }

    fn paged(&self, base: &str, page: i64) -> String {
        if page <= 1 {
            base.to_string()
        } else {
            format!("{}/{}/{}", base, self.fragment("page"), page)
        }
    }

    /// `{{url "<kind>" arg}}` dispatch.
    pub fn for_kind(&self, kind: &str, arg: &str) -> String {
        let page = arg.parse().unwrap_or(1);
        match kind {
            "post" => self.post(arg),
            "page" => self.blog_page(page),
            "tag" => self.tag(arg, 1),
            "author" => self.author(arg, 1),
            "search" => self.search(arg, 1),
            "feed" => self.feed(),
            "admin" => self.admin(),
            _ => self.home(),
        }
    }
}

/// Per-render state the helpers close over.
pub struct HelperEnv {
    tz: Tz,
    urls: Urls,
    plugins: Arc<PluginRegistry>,
    editable: bool,
}

impl HelperEnv {
    pub fn new(
        settings: &BTreeMap<String, String>,
        plugins: Arc<PluginRegistry>,
        editable: bool,
    ) -> Self {
        let tz = settings
            .get("timezone")
            .and_then(|name| datetime::timezone(name).ok())
            .unwrap_or(Tz::UTC);
        Self {
            tz,
            urls: Urls::from_settings(settings),
            plugins,
            editable,
        }
    }
}

pub fn register(hbs: &mut Handlebars<'static>, env: HelperEnv) {
    hbs.register_helper("date", Box::new(DateHelper { tz: env.tz }));
    hbs.register_helper("url", Box::new(UrlHelper { urls: env.urls }));
    hbs.register_helper(
        "title",
        Box::new(TitleHelper {
            editable: env.editable,
        }),
    );
    hbs.register_helper(
        "content",
        Box::new(ContentHelper {
            editable: env.editable,
        }),
    );
    hbs.register_helper(
        "widget",
        Box::new(WidgetHelper {
            plugins: env.plugins,
        }),
    );
}

fn param_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `{{date post.pub_date format="%Y"}}`; without a value, today. Dates
/// reaching templates are already in the display timezone.
struct DateHelper {
    tz: Tz,
}

impl HelperDef for DateHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let pattern = h
            .hash_get("format")
            .and_then(|v| v.value().as_str())
            .unwrap_or(DEFAULT_DATE_FORMAT);

        let mut text = String::new();
        let written = match h.param(0).and_then(|p| p.value().as_str()) {
            Some(value) => match datetime::parse(value) {
                Ok(dt) => write!(text, "{}", dt.format(pattern)),
                Err(_) => Ok(()),
            },
            None => write!(text, "{}", Utc::now().with_timezone(&self.tz).format(pattern)),
        };
        if written.is_err() {
            tracing::debug!(format = %pattern, "Invalid date format");
            text.clear();
        }
        out.write(&text)?;
        Ok(())
    }
}

struct UrlHelper {
    urls: Urls,
}

impl HelperDef for UrlHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let kind = h
            .param(0)
            .and_then(|p| p.value().as_str())
            .unwrap_or("home");
        let arg = h
            .param(1)
            .and_then(|p| param_text(p.value()))
            .unwrap_or_default();
        out.write(&self.urls.for_kind(kind, &arg))?;
        Ok(())
    }
}

fn post_field(h: &Helper<'_>, ctx: &Context, field: &str) -> String {
    h.param(0)
        .and_then(|p| param_text(p.value()))
        .or_else(|| {
            ctx.data()
                .pointer(&format!("/post/{}", field))
                .and_then(param_text)
        })
        .unwrap_or_default()
}

struct TitleHelper {
    editable: bool,
}

impl HelperDef for TitleHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let title = handlebars::html_escape(&post_field(h, ctx, "title"));
        if self.editable {
            out.write(&format!(
                "<div {} data-leafpub-type=\"post-title\">{}</div>",
                super::TITLE_MARKER,
                title
            ))?;
        } else {
            out.write(&title)?;
        }
        Ok(())
    }
}

/// Post HTML, unescaped.
struct ContentHelper {
    editable: bool,
}

impl HelperDef for ContentHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let content = post_field(h, ctx, "content");
        if self.editable {
            out.write(&format!(
                "<div {} data-leafpub-type=\"post-content\">{}</div>",
                super::CONTENT_MARKER,
                content
            ))?;
        } else {
            out.write(&content)?;
        }
        Ok(())
    }
}

/// `{{widget "name" key=value}}`: output of the first active plugin that
/// knows the widget, or nothing.
struct WidgetHelper {
    plugins: Arc<PluginRegistry>,
}

impl HelperDef for WidgetHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let Some(name) = h.param(0).and_then(|p| p.value().as_str()) else {
            return Ok(());
        };
        let options: Map<String, Value> = h
            .hash()
            .iter()
            .map(|(k, v)| (k.to_string(), v.value().clone()))
            .collect();
        match self.plugins.render_widget(name, &Value::Object(options)) {
            Some(html) => out.write(&html)?,
            None => tracing::debug!(widget = %name, "No plugin renders this widget"),
        }
        Ok(())
    }
}
