use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "leafpub", about = "A self-hosted blogging platform")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Recompile templates on every request
    #[arg(long)]
    pub dev: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub dev_mode: bool,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub content: ContentConfig,
    pub auth: AuthConfig,
    pub update: UpdateConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
    pub prefix: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ContentConfig {
    pub path: Option<PathBuf>,
    pub backups: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub cookie_name: String,
    pub session_hours: i64,
    pub remember_days: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UpdateConfig {
    pub repository: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            prefix: "leafpub_".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cookie_name: "authToken".to_string(),
            session_hours: 24,
            remember_days: 30,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            repository: "Leafpub/leafpub".to_string(),
        }
    }
}

/// A loaded config plus whether it came from disk. A missing file means the
/// site has not been installed yet.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: Config,
    pub path: PathBuf,
    pub installed: bool,
}

impl Config {
    pub fn load(cli: &Cli) -> anyhow::Result<Loaded> {
        let data_dir = Self::data_dir(cli);
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join("config.toml"));

        let installed = config_path.exists();
        let mut config = if installed {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        // CLI overrides
        if let Some(ref host) = cli.host {
            config.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if cli.dev {
            config.dev_mode = true;
        }

        config.resolve_paths(&data_dir);

        Ok(Loaded {
            config,
            path: config_path,
            installed,
        })
    }

    /// Fill unset paths relative to the data directory.
    pub fn resolve_paths(&mut self, data_dir: &Path) {
        if self.database.path.is_none() {
            self.database.path = Some(data_dir.join("leafpub.db"));
        }
        if self.content.path.is_none() {
            self.content.path = Some(data_dir.join("content"));
        }
        if self.content.backups.is_none() {
            self.content.backups = Some(data_dir.join("backups"));
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn data_dir(cli: &Cli) -> PathBuf {
        cli.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".leafpub")
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("leafpub.db"))
    }

    pub fn content_path(&self) -> PathBuf {
        self.content
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("content"))
    }

    pub fn backups_path(&self) -> PathBuf {
        self.content
            .backups
            .clone()
            .unwrap_or_else(|| PathBuf::from("backups"))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.content_path().join("cache")
    }

    pub fn themes_path(&self) -> PathBuf {
        self.content_path().join("themes")
    }

    pub fn plugins_path(&self) -> PathBuf {
        self.content_path().join("plugins")
    }

    pub fn uploads_path(&self) -> PathBuf {
        self.content_path().join("uploads")
    }
}
