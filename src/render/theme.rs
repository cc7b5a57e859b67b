//! Bundled content: the default theme and the manifests of compiled-in
//! plugins, copied into the content directory at install and boot.

use std::path::Path;

use rust_embed::Embed;
use serde::{Deserialize, Serialize};

#[derive(Embed)]
#[folder = "assets/"]
struct Bundled;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeInfo {
    pub dir: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
}

/// Write bundled files under `content_dir`, leaving files that already exist
/// untouched. Returns how many were written.
pub fn install_bundled(content_dir: &Path) -> std::io::Result<usize> {
    let mut written = 0;
    for path in Bundled::iter() {
        let target = content_dir.join(path.as_ref());
        if target.exists() {
            continue;
        }
        let Some(file) = Bundled::get(&path) else {
            continue;
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, file.data.as_ref())?;
        written += 1;
    }
    if written > 0 {
        tracing::info!("Installed {} bundled theme and plugin files", written);
    }
    Ok(written)
}

/// Themes under `themes_dir` that carry a `theme.json`.
pub fn list(themes_dir: &Path) -> std::io::Result<Vec<ThemeInfo>> {
    let entries = match std::fs::read_dir(themes_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut themes = Vec::new();
    for entry in entries {
        let entry = entry?;
        let dir = entry.file_name().to_string_lossy().into_owned();
        let Ok(raw) = std::fs::read_to_string(entry.path().join("theme.json")) else {
            continue;
        };
        #[derive(Deserialize)]
        struct Manifest {
            name: String,
            #[serde(default)]
            version: String,
            #[serde(default)]
            author: String,
        }
        match serde_json::from_str::<Manifest>(&raw) {
            Ok(m) => themes.push(ThemeInfo {
                dir,
                name: m.name,
                version: m.version,
                author: m.author,
            }),
            Err(e) => tracing::warn!(theme = %dir, "Invalid theme.json: {}", e),
        }
    }
    themes.sort_by(|a, b| a.dir.cmp(&b.dir));
    Ok(themes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_files_are_installed_once() {
        let tmp = tempfile::tempdir().unwrap();
        let written = install_bundled(tmp.path()).unwrap();
        assert!(written > 0);
        assert!(tmp.path().join("themes/default/post.hbs").is_file());
        assert!(tmp.path().join("plugins/reading-time/plugin.json").is_file());

        std::fs::write(tmp.path().join("themes/default/post.hbs"), "custom").unwrap();
        assert_eq!(install_bundled(tmp.path()).unwrap(), 0);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("themes/default/post.hbs")).unwrap(),
            "custom"
        );
    }

    #[test]
    fn list_reads_theme_manifests() {
        let tmp = tempfile::tempdir().unwrap();
        install_bundled(tmp.path()).unwrap();
        std::fs::create_dir_all(tmp.path().join("themes/no-manifest")).unwrap();

        let themes = list(&tmp.path().join("themes")).unwrap();
        assert_eq!(themes.len(), 1);
        assert_eq!(themes[0].dir, "default");
    }
}
