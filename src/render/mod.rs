//! Theme rendering. Templates are resolved once per theme revision, validated
//! with Handlebars and stored in the file cache under
//! `template.<name>.<hash>`, where the hash covers the theme and the mtimes
//! of its directory and `partials/` subdirectory.

pub mod helpers;
pub mod theme;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::UNIX_EPOCH;

use handlebars::Handlebars;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::cache::Cache;
use crate::plugins::PluginRegistry;

pub const TEMPLATE_EXTENSION: &str = "hbs";

/// Attributes the editor looks for when a post is rendered for editing.
pub const TITLE_MARKER: &str = "data-leafpub-id=\"post:title\"";
pub const CONTENT_MARKER: &str = "data-leafpub-id=\"post:content\"";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Template not found: {0}")]
    TemplateMissing(String),

    #[error("Template compile error: {0}")]
    Compile(String),

    #[error("Template render error: {0}")]
    Execution(String),

    #[error("Editable output is missing the title or content marker")]
    MissingMarkers,

    #[error("Cache error: {0}")]
    Cache(#[from] std::io::Error),
}

impl RenderError {
    pub fn code(&self) -> u16 {
        match self {
            RenderError::TemplateMissing(_) => 1,
            RenderError::Compile(_) => 2,
            RenderError::Execution(_) => 3,
            RenderError::MissingMarkers => 4,
            RenderError::Cache(_) => 100,
        }
    }
}

/// Request-scoped values merged into every render.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    pub cookies: BTreeMap<String, String>,
    pub request: RequestInfo,
    pub settings: BTreeMap<String, String>,
    pub user: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestInfo {
    pub path: String,
    pub query: String,
    pub host: String,
}

/// What gets cached: the entry template plus every partial it reaches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Compiled {
    template: String,
    partials: BTreeMap<String, String>,
}

pub struct Renderer {
    cache: Cache,
    themes_dir: PathBuf,
    plugins: Arc<PluginRegistry>,
    dev_mode: bool,
    compilations: AtomicUsize,
}

fn partial_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{~?#?>\s*([A-Za-z0-9_\-/.]+)").expect("static regex")
    })
}

/// Names of the partials `source` includes directly.
pub fn partial_names(source: &str) -> Vec<String> {
    let mut names: Vec<String> = partial_pattern()
        .captures_iter(source)
        .map(|c| c[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

fn mtime_nanos(path: &Path) -> u128 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos())
}

impl Renderer {
    pub fn new(
        cache: Cache,
        themes_dir: impl Into<PathBuf>,
        plugins: Arc<PluginRegistry>,
        dev_mode: bool,
    ) -> Self {
        Self {
            cache,
            themes_dir: themes_dir.into(),
            plugins,
            dev_mode,
            compilations: AtomicUsize::new(0),
        }
    }

    pub fn themes_dir(&self) -> &Path {
        &self.themes_dir
    }

    /// How many times a template was compiled rather than served from cache.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    fn theme_dir(&self, theme: &str) -> PathBuf {
        self.themes_dir.join(theme)
    }

    /// Hash identifying the current revision of `theme`.
    pub fn theme_hash(&self, theme: &str) -> String {
        let dir = self.theme_dir(theme);
        let mut hasher = Sha256::new();
        hasher.update(theme.as_bytes());
        hasher.update(mtime_nanos(&dir).to_le_bytes());
        hasher.update(mtime_nanos(&dir.join("partials")).to_le_bytes());
        hex::encode(&hasher.finalize()[..8])
    }

    pub fn cache_key(&self, theme: &str, name: &str) -> String {
        format!("template.{}.{}", name, self.theme_hash(theme))
    }

    pub fn template_exists(&self, theme: &str, name: &str) -> bool {
        self.theme_dir(theme)
            .join(format!("{}.{}", name, TEMPLATE_EXTENSION))
            .is_file()
    }

    fn find_partial(&self, theme: &str, name: &str) -> Option<PathBuf> {
        if name.contains("..") {
            return None;
        }
        let dir = self.theme_dir(theme);
        let file = format!("{}.{}", name, TEMPLATE_EXTENSION);
        [dir.join(&file), dir.join("partials").join(&file)]
            .into_iter()
            .find(|p| p.is_file())
    }

    /// Read the template and, recursively, every partial it includes.
    fn compile(&self, theme: &str, name: &str) -> Result<Compiled, RenderError> {
        let path = self
            .theme_dir(theme)
            .join(format!("{}.{}", name, TEMPLATE_EXTENSION));
        let template = std::fs::read_to_string(&path)
            .map_err(|_| RenderError::TemplateMissing(format!("{}/{}", theme, name)))?;

        let mut partials = BTreeMap::new();
        let mut pending = partial_names(&template);
        while let Some(partial) = pending.pop() {
            if partials.contains_key(&partial) {
                continue;
            }
            let path = self
                .find_partial(theme, &partial)
                .ok_or_else(|| RenderError::TemplateMissing(format!("{}/{}", theme, partial)))?;
            let source = std::fs::read_to_string(&path)?;
            pending.extend(partial_names(&source));
            partials.insert(partial, source);
        }

        let compiled = Compiled { template, partials };
        // Parse everything once so syntax errors surface at compile time
        self.registry(name, &compiled)?;
        self.compilations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(theme = %theme, template = %name, "Template compiled");
        Ok(compiled)
    }

    fn registry(&self, name: &str, compiled: &Compiled) -> Result<Handlebars<'static>, RenderError> {
        let mut hbs = Handlebars::new();
        hbs.register_template_string(name, &compiled.template)
            .map_err(|e| RenderError::Compile(e.to_string()))?;
        for (partial, source) in &compiled.partials {
            hbs.register_partial(partial, source)
                .map_err(|e| RenderError::Compile(format!("{}: {}", partial, e)))?;
        }
        Ok(hbs)
    }

    /// The compiled artifact for `name`, from cache when the theme hasn't
    /// changed. A fresh compile evicts older artifacts of the same template.
    fn load(&self, theme: &str, name: &str) -> Result<Compiled, RenderError> {
        let key = self.cache_key(theme, name);
        if !self.dev_mode {
            if let Some(raw) = self.cache.get(&key) {
                match serde_json::from_str(&raw) {
                    Ok(compiled) => return Ok(compiled),
                    Err(e) => tracing::warn!(key = %key, "Discarding unreadable cache entry: {}", e),
                }
            }
        }

        let compiled = self.compile(theme, name)?;
        let raw = serde_json::to_string(&compiled)
            .map_err(|e| RenderError::Compile(e.to_string()))?;
        self.cache.put(&key, &raw)?;
        self.cache
            .flush(Some(&format!("template.{}.", name)), Some(&key))?;
        Ok(compiled)
    }

    /// Render `name` from `theme` with `data` merged over the request
    /// context. `editable` renders editor markers and requires them.
    pub fn render(
        &self,
        theme: &str,
        name: &str,
        data: Value,
        context: &RequestContext,
        editable: bool,
    ) -> Result<String, RenderError> {
        let compiled = self.load(theme, name)?;
        let mut hbs = self.registry(name, &compiled)?;

        let env = helpers::HelperEnv::new(&context.settings, self.plugins.clone(), editable);
        helpers::register(&mut hbs, env);
        if context.settings.get("hbs_escaping").map(String::as_str) == Some("off") {
            hbs.register_escape_fn(handlebars::no_escape);
        }

        let mut merged = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        if let Value::Object(ctx) =
            serde_json::to_value(context).map_err(|e| RenderError::Execution(e.to_string()))?
        {
            for (k, v) in ctx {
                merged.entry(k).or_insert(v);
            }
        }
        merged.insert("editable".to_string(), Value::Bool(editable));

        let html = hbs
            .render(name, &Value::Object(merged))
            .map_err(|e| RenderError::Execution(e.to_string()))?;

        if editable && !(html.contains(TITLE_MARKER) && html.contains(CONTENT_MARKER)) {
            return Err(RenderError::MissingMarkers);
        }
        Ok(html)
    }

    /// Drop every cached template artifact.
    pub fn clear_cache(&self) -> std::io::Result<usize> {
        self.cache.flush(Some("template."), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    struct Setup {
        renderer: Renderer,
        themes: PathBuf,
        cache: Cache,
        _dir: tempfile::TempDir,
    }

    fn setup(dev_mode: bool) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let themes = dir.path().join("themes");
        let theme = themes.join("plain");
        std::fs::create_dir_all(theme.join("partials")).unwrap();
        std::fs::write(
            theme.join("post.hbs"),
            "{{> header}}<article>{{title}}{{content}}</article>",
        )
        .unwrap();
        std::fs::write(theme.join("header.hbs"), "<h1>{{settings.title}}</h1>{{> nav}}").unwrap();
        std::fs::write(theme.join("partials/nav.hbs"), "<nav>{{request.path}}</nav>").unwrap();
        std::fs::write(theme.join("bare.hbs"), "<p>{{post.title}}</p>").unwrap();
        std::fs::write(theme.join("broken.hbs"), "{{#if x}}unclosed").unwrap();
        std::fs::write(theme.join("orphan.hbs"), "{{> nowhere}}").unwrap();

        let cache = Cache::new(dir.path().join("cache"));
        Setup {
            renderer: Renderer::new(
                cache.clone(),
                &themes,
                Arc::new(PluginRegistry::new()),
                dev_mode,
            ),
            themes,
            cache,
            _dir: dir,
        }
    }

    fn context() -> RequestContext {
        RequestContext {
            request: RequestInfo {
                path: "/hello".into(),
                ..Default::default()
            },
            settings: BTreeMap::from([("title".to_string(), "My Blog".to_string())]),
            ..Default::default()
        }
    }

    fn post() -> Value {
        serde_json::json!({ "post": { "title": "Hello", "content": "<p>Body</p>" } })
    }

    fn touch(path: &Path) {
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::open(path)
            .unwrap()
            .set_modified(later)
            .unwrap();
    }

    #[test]
    fn renders_with_partials_from_both_locations() {
        let s = setup(false);
        let html = s
            .renderer
            .render("plain", "post", post(), &context(), false)
            .unwrap();
        assert_eq!(
            html,
            "<h1>My Blog</h1><nav>/hello</nav><article>Hello<p>Body</p></article>"
        );
    }

    #[test]
    fn second_render_hits_the_cache() {
        let s = setup(false);
        s.renderer.render("plain", "post", post(), &context(), false).unwrap();
        s.renderer.render("plain", "post", post(), &context(), false).unwrap();
        assert_eq!(s.renderer.compilations(), 1);
        assert!(s.cache.has(&s.renderer.cache_key("plain", "post")));
    }

    #[test]
    fn theme_change_recompiles_and_evicts_old_entry() {
        let s = setup(false);
        s.renderer.render("plain", "post", post(), &context(), false).unwrap();
        let old_key = s.renderer.cache_key("plain", "post");

        touch(&s.themes.join("plain"));
        s.renderer.render("plain", "post", post(), &context(), false).unwrap();
        let new_key = s.renderer.cache_key("plain", "post");

        assert_ne!(old_key, new_key);
        assert_eq!(s.renderer.compilations(), 2);
        assert!(!s.cache.has(&old_key));
        assert!(s.cache.has(&new_key));
    }

    #[test]
    fn touching_partials_dir_changes_the_hash() {
        let s = setup(false);
        let before = s.renderer.theme_hash("plain");
        touch(&s.themes.join("plain/partials"));
        assert_ne!(before, s.renderer.theme_hash("plain"));
    }

    #[test]
    fn dev_mode_always_compiles() {
        let s = setup(true);
        s.renderer.render("plain", "post", post(), &context(), false).unwrap();
        s.renderer.render("plain", "post", post(), &context(), false).unwrap();
        assert_eq!(s.renderer.compilations(), 2);
    }

    #[test]
    fn missing_template_and_partial() {
        let s = setup(false);
        assert!(matches!(
            s.renderer.render("plain", "nope", Value::Null, &context(), false),
            Err(RenderError::TemplateMissing(_))
        ));
        assert!(matches!(
            s.renderer.render("plain", "orphan", Value::Null, &context(), false),
            Err(RenderError::TemplateMissing(_))
        ));
        assert!(matches!(
            s.renderer.render("ghost-theme", "post", Value::Null, &context(), false),
            Err(RenderError::TemplateMissing(_))
        ));
    }

    #[test]
    fn syntax_error_is_a_compile_error() {
        let s = setup(false);
        assert!(matches!(
            s.renderer.render("plain", "broken", Value::Null, &context(), false),
            Err(RenderError::Compile(_))
        ));
    }

    #[test]
    fn editable_mode_requires_markers() {
        let s = setup(false);
        let html = s
            .renderer
            .render("plain", "post", post(), &context(), true)
            .unwrap();
        assert!(html.contains(TITLE_MARKER));
        assert!(html.contains(CONTENT_MARKER));

        assert!(matches!(
            s.renderer.render("plain", "bare", post(), &context(), true),
            Err(RenderError::MissingMarkers)
        ));
        assert!(s.renderer.render("plain", "bare", post(), &context(), false).is_ok());
    }

    #[test]
    fn caller_data_wins_over_context() {
        let s = setup(false);
        let data = serde_json::json!({
            "post": { "title": "T", "content": "" },
            "settings": { "title": "Overridden" }
        });
        let html = s
            .renderer
            .render("plain", "post", data, &context(), false)
            .unwrap();
        assert!(html.starts_with("<h1>Overridden</h1>"));
    }

    #[test]
    fn partial_names_are_collected() {
        assert_eq!(
            partial_names("{{> a}} {{~> b/c }} {{#> layout}}x{{/layout}} {{> a}}"),
            vec!["a", "b/c", "layout"]
        );
    }
}
