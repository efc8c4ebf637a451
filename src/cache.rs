use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::db::{self, Db};
use crate::error::PipelineError;
use crate::fetch::PageFetcher;

/// Result of checking one URL: the fresh content and whether it differs from
/// the last fingerprint on record.
#[derive(Debug, Clone)]
pub struct PageCheck {
    pub url: String,
    pub changed: bool,
    pub content: String,
}

/// Change detection keyed strictly by URL.
#[derive(Clone)]
pub struct ContentCache {
    db: Db,
    fetcher: Arc<dyn PageFetcher>,
}

pub fn fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

impl ContentCache {
    pub fn new(db: Db, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { db, fetcher }
    }

    /// Fetches `url` and records the check. A failed fetch is returned as an
    /// error and leaves the entry untouched.
    pub async fn check(&self, url: &str) -> Result<PageCheck, PipelineError> {
        let content = self.fetcher.fetch(url).await?;
        let changed = self.record(url, &content, Utc::now())?;
        debug!(url = %url, changed, "page checked");
        Ok(PageCheck {
            url: url.to_string(),
            changed,
            content,
        })
    }

    /// The read-modify-write half of `check`: `last_fetched_at` always
    /// advances, the fingerprint and `last_changed_at` only on a difference.
    pub fn record(&self, url: &str, content: &str, now: DateTime<Utc>) -> rusqlite::Result<bool> {
        let current = fingerprint(content);
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            let stored = db::touch_page_cache(&tx, url, now)?;
            let changed = stored.as_deref() != Some(current.as_str());
            if changed {
                db::store_page_hash(&tx, url, &current, now)?;
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    /// Drops the stored fingerprint so the next check reports a change. Used
    /// when content was consumed but its processing failed.
    pub fn forget(&self, url: &str) -> rusqlite::Result<()> {
        self.db.with(|conn| db::clear_page_hash(conn, url))
    }

    /// `forget` for each URL on a path that is already failing; errors are
    /// logged so the original failure is the one reported.
    pub fn forget_all<'a>(&self, urls: impl IntoIterator<Item = &'a str>) {
        for url in urls {
            if let Err(e) = self.forget(url) {
                warn!(url = %url, "Could not forget cache entry: {}", e);
            }
        }
    }
}
