use std::sync::Arc;

use crate::cache::Cache;
use crate::config::Config;
use crate::db::{Conn, Database, DbError};
use crate::events::EventBus;
use crate::models::{self, Ctx};
use crate::plugins::{PluginError, PluginRegistry};
use crate::render::{theme, Renderer};
use crate::settings::{Settings, SettingsError};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Plugin error: {0}")]
    Plugins(#[from] PluginError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub settings: Arc<Settings>,
    pub cache: Cache,
    pub renderer: Arc<Renderer>,
    pub events: EventBus,
    pub plugins: Arc<PluginRegistry>,
}

impl AppState {
    /// Open the database, load settings and bring plugins up.
    pub fn init(config: Config) -> Result<Self, StartupError> {
        Self::with_plugins(config, PluginRegistry::builtin())
    }

    pub fn with_plugins(config: Config, plugins: PluginRegistry) -> Result<Self, StartupError> {
        let content = config.content_path();
        std::fs::create_dir_all(&content)?;
        std::fs::create_dir_all(config.uploads_path())?;
        theme::install_bundled(&content)?;

        let db = Database::open(&config.db_path(), &config.database.prefix)?;
        db.run_migrations()?;

        let conn = db.conn()?;
        let settings = Settings::load(&conn)?;

        let cache = Cache::new(config.cache_path());
        let plugins = Arc::new(plugins);
        let renderer = Renderer::new(
            cache.clone(),
            config.themes_path(),
            plugins.clone(),
            config.dev_mode,
        );

        let events = EventBus::new();
        events.subscribe(|event| tracing::debug!(event = event.name(), "{:?}", event));

        let state = Self {
            db: db.clone(),
            config: Arc::new(config),
            settings: Arc::new(settings),
            cache,
            renderer: Arc::new(renderer),
            events,
            plugins,
        };

        let ctx = state.ctx(&conn);
        let active = models::plugin::activate_enabled(&ctx, &state.plugins)?;
        tracing::info!("{} plugin(s) active", active);

        Ok(state)
    }

    pub fn ctx<'a>(&'a self, conn: &'a Conn) -> Ctx<'a> {
        Ctx::new(conn, &self.settings, &self.events)
    }

    /// Deactivate plugins before the process exits.
    pub fn shutdown(&self) {
        for dir in self.plugins.active() {
            if let Err(e) = self.plugins.deactivate(&dir, &self.events) {
                tracing::warn!(plugin = %dir, "Plugin did not stop cleanly: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;

    pub(crate) fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.database.prefix = "test_".to_string();
        config.resolve_paths(dir);
        config
    }

    #[test]
    fn init_prepares_content_and_database() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::init(test_config(tmp.path())).unwrap();

        assert!(state.config.themes_path().join("default/blog.hbs").is_file());
        assert!(state.config.uploads_path().is_dir());
        assert_eq!(state.settings.get("theme").as_deref(), Some("default"));

        let conn = state.db.conn().unwrap();
        let ctx = state.ctx(&conn);
        assert!(crate::models::user::get_owner(&ctx).unwrap().is_none());
        state.shutdown();
    }
}
