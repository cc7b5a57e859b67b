//! Check the configured GitHub repository for a newer release.

use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};

pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const API_BASE: &str = "https://api.github.com";

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("Could not reach the release server: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Release tag {tag} is not a version: {source}")]
    Version {
        tag: String,
        source: semver::Error,
    },

    #[error("Invalid repository: {0}")]
    InvalidRepository(String),
}

impl UpdateError {
    pub fn code(&self) -> u16 {
        match self {
            UpdateError::Http(_) => 1,
            UpdateError::Version { .. } => 2,
            UpdateError::InvalidRepository(_) => 3,
        }
    }
}

/// The fields we use from GitHub's release payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    pub html_url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateStatus {
    pub current: String,
    pub latest: String,
    pub available: bool,
    pub url: String,
    pub notes: String,
    pub published: String,
}

pub fn parse_version(tag: &str) -> Result<Version, UpdateError> {
    let trimmed = tag.trim().trim_start_matches(['v', 'V']);
    Version::parse(trimmed).map_err(|source| UpdateError::Version {
        tag: tag.to_string(),
        source,
    })
}

pub fn compare(current: &str, release: &Release) -> Result<UpdateStatus, UpdateError> {
    let running = parse_version(current)?;
    let latest = parse_version(&release.tag_name)?;
    Ok(UpdateStatus {
        current: running.to_string(),
        latest: latest.to_string(),
        available: latest > running,
        url: release.html_url.clone(),
        notes: release.body.clone().unwrap_or_default(),
        published: release.published_at.clone().unwrap_or_default(),
    })
}

fn valid_repository(repository: &str) -> bool {
    let mut parts = repository.split('/');
    let valid_part = |p: &str| {
        !p.is_empty()
            && p.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(owner), Some(name), None) if valid_part(owner) && valid_part(name)
    )
}

pub fn latest_release_url(repository: &str) -> Result<String, UpdateError> {
    if !valid_repository(repository) {
        return Err(UpdateError::InvalidRepository(repository.to_string()));
    }
    Ok(format!("{}/repos/{}/releases/latest", API_BASE, repository))
}

/// Ask GitHub for `repository`'s latest release and compare it with the
/// running version.
pub async fn check(repository: &str) -> Result<UpdateStatus, UpdateError> {
    let url = latest_release_url(repository)?;
    let client = reqwest::Client::builder()
        .user_agent(format!("leafpub/{}", CURRENT_VERSION))
        .timeout(Duration::from_secs(10))
        .build()?;

    let release: Release = client
        .get(&url)
        .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let status = compare(CURRENT_VERSION, &release)?;
    tracing::info!(
        current = %status.current,
        latest = %status.latest,
        available = status.available,
        "Checked for updates"
    );
    Ok(status)
}
