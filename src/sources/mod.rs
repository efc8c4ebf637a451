//! Sources: one origin of show announcements each.
//!
//! Every source resolves an endpoint first and fetches second. Fetching
//! yields batches of raw candidates, each carrying a receipt of what it
//! consumed so the caller can acknowledge or roll back once the batch is
//! merged.

mod inbox;
mod listing;
mod newsletter;
mod website;

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::cache::ContentCache;
use crate::config::MailSettings;
use crate::dates::DateBias;
use crate::db::Db;
use crate::error::{ConfigError, PipelineError};
use crate::extract::{EndpointResolver, RawShowCandidate, ShowExtractor};
use crate::fetch::PageFetcher;
use crate::mail::{Mailbox, MessageId, RawMessage};

pub use inbox::InboxSource;
pub use listing::{calendar_url, ListingSource};
pub use newsletter::NewsletterSource;
pub use website::WebsiteSource;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[serde(alias = "website")]
    #[value(name = "website")]
    ArtistWebsite,
    #[serde(alias = "listing")]
    #[value(name = "listing")]
    ListingSite,
    #[value(name = "newsletter")]
    Newsletter,
    #[value(name = "inbox")]
    Inbox,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::ArtistWebsite,
        SourceKind::ListingSite,
        SourceKind::Newsletter,
        SourceKind::Inbox,
    ];

    /// Inbox messages name their own artist; every other kind runs per artist.
    pub fn is_artist_bound(self) -> bool {
        !matches!(self, SourceKind::Inbox)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::ArtistWebsite => "website",
            SourceKind::ListingSite => "listing",
            SourceKind::Newsletter => "newsletter",
            SourceKind::Inbox => "inbox",
        })
    }
}

/// Where a source is in its lifecycle, with the endpoint it resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase<E> {
    Unresolved,
    Resolved(E),
    Fetched(E),
}

impl<E> Phase<E> {
    pub fn endpoint(&self) -> Option<&E> {
        match self {
            Phase::Unresolved => None,
            Phase::Resolved(e) | Phase::Fetched(e) => Some(e),
        }
    }

    fn require(&self, kind: SourceKind) -> Result<&E, PipelineError> {
        self.endpoint().ok_or(PipelineError::NotResolved { kind })
    }

    fn into_fetched(self) -> Self {
        match self {
            Phase::Resolved(e) => Phase::Fetched(e),
            other => other,
        }
    }
}

/// What a batch consumed: cache entries to forget on failure, messages to
/// mark seen on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    pub cache_urls: Vec<String>,
    pub messages: Vec<MessageId>,
}

/// Candidates for one artist from one extraction call.
#[derive(Debug, Clone)]
pub struct ShowBatch {
    pub artist_name: String,
    pub kind: SourceKind,
    pub bias: DateBias,
    pub candidates: Vec<RawShowCandidate>,
    pub receipt: Receipt,
}

#[derive(Debug, Default)]
pub struct Fetched {
    pub batches: Vec<ShowBatch>,
    /// Parts of the fetch that failed on their own (a page, a message),
    /// keyed by URL or message id.
    pub failures: Vec<(String, PipelineError)>,
    /// Consumed without producing a batch; safe to acknowledge right away.
    pub settled: Receipt,
}

/// Collaborators and settings shared by all sources in a run.
#[derive(Clone)]
pub struct SourceContext {
    pub db: Db,
    pub cache: ContentCache,
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Arc<dyn ShowExtractor>,
    pub endpoints: Arc<dyn EndpointResolver>,
    pub mailbox: Option<Arc<dyn Mailbox>>,
    pub mail: MailSettings,
    pub max_pages_per_site: usize,
    pub today: NaiveDate,
}

impl SourceContext {
    fn mailbox(&self) -> Result<&Arc<dyn Mailbox>, PipelineError> {
        self.mailbox
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("no mailbox configured (mail.maildir)".into()).into())
    }

    /// Unseen messages across the configured mailboxes, once each.
    async fn unseen_messages(&self, filters: &[Option<&str>]) -> Result<Vec<RawMessage>, PipelineError> {
        let mailbox = self.mailbox()?;
        let mut messages: Vec<RawMessage> = Vec::new();
        for name in &self.mail.mailboxes {
            for filter in filters {
                for message in mailbox.fetch_unseen(name, *filter).await? {
                    if !messages.iter().any(|m| m.id == message.id) {
                        messages.push(message);
                    }
                }
            }
        }
        Ok(messages)
    }
}

pub enum Source {
    ArtistWebsite(WebsiteSource),
    ListingSite(ListingSource),
    Newsletter(NewsletterSource),
    Inbox(InboxSource),
}

impl Source {
    /// The artist-bound source of `kind`; `None` for the inbox.
    pub fn for_artist(kind: SourceKind, artist: &str) -> Option<Self> {
        match kind {
            SourceKind::ArtistWebsite => Some(Source::ArtistWebsite(WebsiteSource::new(artist))),
            SourceKind::ListingSite => Some(Source::ListingSite(ListingSource::new(artist))),
            SourceKind::Newsletter => Some(Source::Newsletter(NewsletterSource::new(artist))),
            SourceKind::Inbox => None,
        }
    }

    pub fn inbox() -> Self {
        Source::Inbox(InboxSource::new())
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Source::ArtistWebsite(_) => SourceKind::ArtistWebsite,
            Source::ListingSite(_) => SourceKind::ListingSite,
            Source::Newsletter(_) => SourceKind::Newsletter,
            Source::Inbox(_) => SourceKind::Inbox,
        }
    }

    pub async fn resolve(&mut self, ctx: &SourceContext) -> Result<(), PipelineError> {
        match self {
            Source::ArtistWebsite(s) => s.resolve(ctx).await,
            Source::ListingSite(s) => s.resolve(ctx).await,
            Source::Newsletter(s) => s.resolve(ctx),
            Source::Inbox(s) => s.resolve(ctx),
        }
    }

    pub async fn fetch_shows(&mut self, ctx: &SourceContext) -> Result<Fetched, PipelineError> {
        match self {
            Source::ArtistWebsite(s) => s.fetch_shows(ctx).await,
            Source::ListingSite(s) => s.fetch_shows(ctx).await,
            Source::Newsletter(s) => s.fetch_shows(ctx).await,
            Source::Inbox(s) => s.fetch_shows(ctx).await,
        }
    }
}

/// Lowercase ASCII words joined by dashes: "Men I Trust" -> "men-i-trust".
pub fn slugify(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Fills in `source_url` where the extractor left it out.
fn default_source(candidates: &mut [RawShowCandidate], source: &str) {
    for c in candidates.iter_mut().filter(|c| c.source_url.is_none()) {
        c.source_url = Some(source.to_string());
    }
}

fn message_text(message: &RawMessage, include_from: bool) -> String {
    let mut text = format!("Subject: {}\n", message.subject);
    if include_from {
        text.push_str(&format!("From: {}\n", message.from));
    }
    text.push_str(&format!("Date: {}\n\n{}", message.date, message.body));
    text
}

#[cfg(test)]
pub(crate) mod testing {
    //! Canned collaborators shared by the source and pipeline tests.

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{ExtractionError, FetchError, MailError};
    use crate::extract::ExtractionRequest;

    #[derive(Default)]
    pub struct FakeWeb {
        pub pages: Mutex<HashMap<String, String>>,
        pub fetched: Mutex<Vec<String>>,
    }

    impl FakeWeb {
        pub fn set(&self, url: &str, content: &str) {
            self.pages
                .lock()
                .unwrap()
                .insert(url.to_string(), content.to_string());
        }
    }

    #[async_trait]
    impl PageFetcher for FakeWeb {
        async fn fetch(&self, url: &str) -> Result<String, FetchError> {
            self.fetched.lock().unwrap().push(url.to_string());
            self.pages
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                })
        }
    }

    /// Returns the candidates registered for the first marker found in the
    /// text; fails when the text contains "EXPLODE".
    #[derive(Default)]
    pub struct CannedExtractor {
        pub shows: Mutex<Vec<(String, Vec<RawShowCandidate>)>>,
        pub artists: Mutex<Vec<(String, String)>>,
        pub calls: Mutex<Vec<(String, SourceKind)>>,
        pub sites: Mutex<HashMap<String, String>>,
        pub listings: Mutex<HashMap<String, String>>,
        pub lookups: Mutex<usize>,
    }

    impl CannedExtractor {
        pub fn on(&self, marker: &str, shows: Vec<RawShowCandidate>) {
            self.shows.lock().unwrap().push((marker.to_string(), shows));
        }

        pub fn artist_for(&self, marker: &str, artist: &str) {
            self.artists
                .lock()
                .unwrap()
                .push((marker.to_string(), artist.to_string()));
        }

        pub fn site(&self, artist: &str, url: &str) {
            self.sites
                .lock()
                .unwrap()
                .insert(artist.to_string(), url.to_string());
        }

        pub fn listing(&self, artist: &str, url: &str) {
            self.listings
                .lock()
                .unwrap()
                .insert(artist.to_string(), url.to_string());
        }
    }

    #[async_trait]
    impl ShowExtractor for CannedExtractor {
        async fn extract(
            &self,
            request: &ExtractionRequest<'_>,
        ) -> Result<Vec<RawShowCandidate>, ExtractionError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.artist_name.to_string(), request.source_kind));
            if request.text.contains("EXPLODE") {
                return Err(ExtractionError::Api {
                    status: 500,
                    message: "model overloaded".into(),
                });
            }
            Ok(self
                .shows
                .lock()
                .unwrap()
                .iter()
                .find(|(marker, _)| request.text.contains(marker.as_str()))
                .map(|(_, shows)| shows.clone())
                .unwrap_or_default())
        }

        async fn identify_artist(
            &self,
            text: &str,
            _known: &[String],
        ) -> Result<Option<String>, ExtractionError> {
            if text.contains("EXPLODE") {
                return Err(ExtractionError::Timeout);
            }
            Ok(self
                .artists
                .lock()
                .unwrap()
                .iter()
                .find(|(marker, _)| text.contains(marker.as_str()))
                .map(|(_, artist)| artist.clone()))
        }
    }

    #[async_trait]
    impl EndpointResolver for CannedExtractor {
        async fn find_official_site(&self, artist: &str) -> Result<Option<String>, ExtractionError> {
            *self.lookups.lock().unwrap() += 1;
            Ok(self.sites.lock().unwrap().get(artist).cloned())
        }

        async fn find_listing_page(&self, artist: &str) -> Result<Option<String>, ExtractionError> {
            *self.lookups.lock().unwrap() += 1;
            Ok(self.listings.lock().unwrap().get(artist).cloned())
        }
    }

    #[derive(Default)]
    pub struct MemoryMailbox {
        pub messages: Mutex<Vec<(String, RawMessage)>>,
        pub seen: Mutex<HashSet<MessageId>>,
    }

    impl MemoryMailbox {
        pub fn deliver(&self, mailbox: &str, id: &str, to: &str, subject: &str, body: &str) {
            self.messages.lock().unwrap().push((
                mailbox.to_string(),
                RawMessage {
                    id: MessageId(id.to_string()),
                    subject: subject.to_string(),
                    from: "news@example.com".to_string(),
                    to: to.to_string(),
                    date: "Wed, 10 Jan 2024 09:00:00 +0000".to_string(),
                    body: body.to_string(),
                },
            ));
        }

        pub fn is_seen(&self, id: &str) -> bool {
            self.seen.lock().unwrap().contains(&MessageId(id.to_string()))
        }
    }

    #[async_trait]
    impl Mailbox for MemoryMailbox {
        async fn fetch_unseen(
            &self,
            mailbox: &str,
            address_filter: Option<&str>,
        ) -> Result<Vec<RawMessage>, MailError> {
            let seen = self.seen.lock().unwrap();
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(folder, m)| {
                    folder == mailbox
                        && !seen.contains(&m.id)
                        && address_filter.map_or(true, |a| m.to.eq_ignore_ascii_case(a))
                })
                .map(|(_, m)| m.clone())
                .collect())
        }

        async fn mark_seen(&self, id: &MessageId) -> Result<(), MailError> {
            self.seen.lock().unwrap().insert(id.clone());
            Ok(())
        }
    }

    pub struct Fixture {
        pub web: Arc<FakeWeb>,
        pub extractor: Arc<CannedExtractor>,
        pub mailbox: Arc<MemoryMailbox>,
        pub ctx: SourceContext,
    }

    pub fn fixture(today: NaiveDate) -> Fixture {
        let db = Db::in_memory().unwrap();
        let web = Arc::new(FakeWeb::default());
        let extractor = Arc::new(CannedExtractor::default());
        let mailbox = Arc::new(MemoryMailbox::default());
        let ctx = SourceContext {
            db: db.clone(),
            cache: ContentCache::new(db, web.clone()),
            fetcher: web.clone(),
            extractor: extractor.clone(),
            endpoints: extractor.clone(),
            mailbox: Some(mailbox.clone()),
            mail: MailSettings {
                maildir: None,
                mailboxes: vec!["INBOX".to_string()],
                newsletter_domain: Some("shows.example.org".to_string()),
                to_addresses: Vec::new(),
            },
            max_pages_per_site: 5,
            today,
        };
        Fixture {
            web,
            extractor,
            mailbox,
            ctx,
        }
    }
}
