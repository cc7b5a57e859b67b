//! Compiled-in plugins. Each implementation is registered under the
//! directory name its `plugin.json` lives in; the database decides which
//! ones are enabled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::events::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin {0} is not installed")]
    NotInstalled(String),

    #[error("Plugin {0} is already installed")]
    AlreadyInstalled(String),

    #[error("No implementation is registered for plugin {0}")]
    NotRegistered(String),

    #[error("Invalid plugin.json in {dir}: {message}")]
    InvalidManifest { dir: String, message: String },

    #[error("Plugin {dir} requires version {requires}")]
    Incompatible { dir: String, requires: String },

    #[error("Plugin {dir} failed to start: {message}")]
    Activation { dir: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl PluginError {
    pub fn code(&self) -> u16 {
        match self {
            PluginError::NotFound(_) => 1,
            PluginError::NotInstalled(_) => 2,
            PluginError::AlreadyInstalled(_) => 3,
            PluginError::NotRegistered(_) => 4,
            PluginError::InvalidManifest { .. } => 5,
            PluginError::Incompatible { .. } => 6,
            PluginError::Activation { .. } => 7,
            PluginError::Io(_) | PluginError::Database(_) => 100,
        }
    }
}

pub trait Plugin: Send + Sync {
    /// Called when the plugin is enabled or at boot when already enabled.
    fn activate(&self, _events: &EventBus) -> Result<(), String> {
        Ok(())
    }

    fn deactivate(&self, _events: &EventBus) -> Result<(), String> {
        Ok(())
    }

    /// HTML for the named widget, or `None` if this plugin doesn't provide it.
    fn render_widget(&self, _name: &str, _options: &Value) -> Option<String> {
        None
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<BTreeMap<String, Arc<dyn Plugin>>>,
    active: RwLock<BTreeSet<String>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every plugin shipped in the binary.
    pub fn builtin() -> Self {
        let registry = Self::new();
        registry.register("reading-time", ReadingTime);
        registry
    }

    pub fn register(&self, dir: &str, plugin: impl Plugin + 'static) {
        self.plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dir.to_string(), Arc::new(plugin));
    }

    pub fn is_registered(&self, dir: &str) -> bool {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(dir)
    }

    pub fn is_active(&self, dir: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(dir)
    }

    pub fn active(&self) -> Vec<String> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn get(&self, dir: &str) -> Result<Arc<dyn Plugin>, PluginError> {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dir)
            .cloned()
            .ok_or_else(|| PluginError::NotRegistered(dir.to_string()))
    }

    pub fn activate(&self, dir: &str, events: &EventBus) -> Result<(), PluginError> {
        if self.is_active(dir) {
            return Ok(());
        }
        self.get(dir)?
            .activate(events)
            .map_err(|message| PluginError::Activation {
                dir: dir.to_string(),
                message,
            })?;
        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dir.to_string());
        tracing::info!(plugin = %dir, "Plugin activated");
        Ok(())
    }

    pub fn deactivate(&self, dir: &str, events: &EventBus) -> Result<(), PluginError> {
        if !self.is_active(dir) {
            return Ok(());
        }
        if let Err(message) = self.get(dir)?.deactivate(events) {
            tracing::warn!(plugin = %dir, "Plugin deactivation failed: {}", message);
        }
        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(dir);
        tracing::info!(plugin = %dir, "Plugin deactivated");
        Ok(())
    }

    /// Ask each active plugin, in directory order, for the widget.
    pub fn render_widget(&self, name: &str, options: &Value) -> Option<String> {
        let active = self.active();
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        active
            .iter()
            .filter_map(|dir| plugins.get(dir))
            .find_map(|plugin| plugin.render_widget(name, options))
    }
}

/// `{{widget "reading_time" content=post.content}}`: estimated minutes to
/// read at 200 words per minute.
pub struct ReadingTime;

const WORDS_PER_MINUTE: usize = 200;

impl Plugin for ReadingTime {
    fn render_widget(&self, name: &str, options: &Value) -> Option<String> {
        if name != "reading_time" {
            return None;
        }
        let content = options.get("content").and_then(Value::as_str).unwrap_or("");
        let mut in_tag = false;
        let text: String = content
            .chars()
            .map(|c| match c {
                '<' => {
                    in_tag = true;
                    ' '
                }
                '>' => {
                    in_tag = false;
                    ' '
                }
                _ if in_tag => ' ',
                c => c,
            })
            .collect();
        let words = text.split_whitespace().count();
        let minutes = ((words + WORDS_PER_MINUTE - 1) / WORDS_PER_MINUTE).max(1);
        Some(format!(
            "<span class=\"reading-time\">{} min read</span>",
            minutes
        ))
    }
}
