//! Runtime configuration: a TOML file, then environment overrides.
//!
//! ```toml
//! database_path = "data/concerts.sqlite"
//!
//! [extraction]
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//!
//! [fetch]
//! backend = "spider"
//!
//! [mail]
//! maildir = "/home/me/Maildir"
//! newsletter_domain = "shows.example.org"
//!
//! [pipeline]
//! sources = ["website", "listing", "newsletter", "inbox"]
//! merge_policy = "keep_first"
//!
//! [[artists]]
//! name = "Men I Trust"
//! website = "https://menitrust.com"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dates::{DEFAULT_YEAR_WINDOW, MAX_YEAR_WINDOW};
use crate::db::{ArtistSeed, DEFAULT_DB_PATH};
use crate::error::ConfigError;
use crate::fetch::MAX_RETRIES;
use crate::reconcile::MergePolicy;
use crate::sources::SourceKind;

pub const DEFAULT_CONFIG_PATH: &str = "concerts.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub extraction: ExtractionSettings,
    pub fetch: FetchSettings,
    pub mail: MailSettings,
    pub pipeline: PipelineSettings,
    pub artists: Vec<ArtistEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DB_PATH),
            extraction: ExtractionSettings::default(),
            fetch: FetchSettings::default(),
            mail: MailSettings::default(),
            pipeline: PipelineSettings::default(),
            artists: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Any OpenAI-compatible chat completions endpoint.
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature: f32,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 120,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchBackend {
    /// spider.cloud, returns markdown. Needs `SPIDER_API_KEY`.
    Spider,
    /// Plain GET, returns the page as served.
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub backend: FetchBackend,
    pub timeout_secs: u64,
    /// Tour pages checked per artist website, on top of the base URL.
    pub max_pages_per_site: usize,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            backend: FetchBackend::Spider,
            timeout_secs: 30,
            max_pages_per_site: 5,
            max_retries: 3,
            user_agent: concat!("concert_checker/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    /// Root of a Maildir++ tree.
    pub maildir: Option<PathBuf>,
    pub mailboxes: Vec<String>,
    /// Newsletter addresses are `<artist-slug>@<newsletter_domain>`.
    pub newsletter_domain: Option<String>,
    /// Inbox messages must be addressed to one of these; empty means any.
    pub to_addresses: Vec<String>,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            maildir: None,
            mailboxes: vec!["INBOX".to_string()],
            newsletter_domain: None,
            to_addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub sources: Vec<SourceKind>,
    /// Artists processed at the same time.
    pub max_concurrency: usize,
    pub merge_policy: MergePolicy,
    /// Years searched either way when placing a date without a year.
    pub year_search_window: i32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sources: vec![SourceKind::ArtistWebsite, SourceKind::ListingSite],
            max_concurrency: 4,
            merge_policy: MergePolicy::KeepFirst,
            year_search_window: DEFAULT_YEAR_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistEntry {
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub listing_url: Option<String>,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl AppConfig {
    /// Reads `path` if it exists (defaults otherwise), applies the
    /// environment and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_toml_str(&raw)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = lookup("CONCERTS_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("MAILDIR") {
            self.mail.maildir = Some(PathBuf::from(dir));
        }
        if let Some(domain) = lookup("NEWSLETTER_DOMAIN") {
            self.mail.newsletter_domain = Some(domain.trim().to_string());
        }
        if let Some(addresses) = lookup("IMAP_TO_ADDRESSES") {
            self.mail.to_addresses = split_list(&addresses);
        }
        if let Some(mailboxes) = lookup("IMAP_MAILBOXES") {
            self.mail.mailboxes = split_list(&mailboxes);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.pipeline.max_concurrency == 0 {
            return invalid("pipeline.max_concurrency must be at least 1");
        }
        if !(1..=MAX_YEAR_WINDOW).contains(&self.pipeline.year_search_window) {
            return Err(ConfigError::Invalid(format!(
                "pipeline.year_search_window must be between 1 and {}",
                MAX_YEAR_WINDOW
            )));
        }
        if self.fetch.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "fetch.max_retries must be at most {}",
                MAX_RETRIES
            )));
        }
        if self.extraction.model.trim().is_empty() {
            return invalid("extraction.model must not be empty");
        }
        let uses = |kind: SourceKind| self.pipeline.sources.contains(&kind);
        let uses_mail = uses(SourceKind::Newsletter) || uses(SourceKind::Inbox);
        if uses_mail && self.mail.maildir.is_none() {
            return invalid("newsletter and inbox sources need mail.maildir (or MAILDIR)");
        }
        if uses_mail && self.mail.mailboxes.is_empty() {
            return invalid("mail.mailboxes must not be empty");
        }
        if uses(SourceKind::Newsletter)
            && self
                .mail
                .newsletter_domain
                .as_deref()
                .map_or(true, |d| d.trim().is_empty())
        {
            return invalid("the newsletter source needs mail.newsletter_domain (or NEWSLETTER_DOMAIN)");
        }
        if let Some(entry) = self.artists.iter().find(|a| a.name.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "artist entry with an empty name: {:?}",
                entry
            )));
        }
        Ok(())
    }

    pub fn artist_seeds(&self) -> Vec<ArtistSeed<'_>> {
        self.artists
            .iter()
            .map(|a| ArtistSeed {
                name: a.name.trim(),
                website: a.website.as_deref(),
                listing_url: a.listing_url.as_deref(),
            })
            .collect()
    }
}
