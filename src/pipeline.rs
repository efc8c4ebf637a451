//! Runs every configured source for every tracked artist and merges what
//! they find.
//!
//! Artists run concurrently, bounded by `max_concurrency`; the sources of
//! one artist run one after another. The inbox runs last, once, since its
//! messages name their own artists. A failing pairing is logged and
//! reported without stopping the rest of the run.

use std::sync::Arc;

use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::cache::ContentCache;
use crate::config::{AppConfig, FetchBackend, MailSettings, PipelineSettings};
use crate::dates::DateResolver;
use crate::db::{self, Db};
use crate::error::PipelineError;
use crate::extract::{EndpointResolver, LlmExtractor, ShowExtractor};
use crate::fetch::{HttpFetcher, PageFetcher, SpiderFetcher};
use crate::mail::{Mailbox, Maildir, MessageId};
use crate::reconcile::{MergeReport, Reconciler};
use crate::sources::{Source, SourceContext, SourceKind};

/// Stands in for the artist name on the inbox outcome.
pub const INBOX_LABEL: &str = "(inbox)";

pub struct Pipeline {
    db: Db,
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn ShowExtractor>,
    endpoints: Arc<dyn EndpointResolver>,
    mailbox: Option<Arc<dyn Mailbox>>,
    mail: MailSettings,
    settings: PipelineSettings,
    max_pages_per_site: usize,
    show_progress: bool,
}

#[derive(Debug)]
pub enum PairingStatus {
    Completed {
        report: MergeReport,
        batches: usize,
        /// Pages, messages or batches that failed without failing the pairing.
        failures: Vec<(String, PipelineError)>,
    },
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct PairingOutcome {
    pub artist: String,
    pub source: SourceKind,
    pub status: PairingStatus,
}

impl PairingOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, PairingStatus::Failed(_))
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub artists: usize,
    pub outcomes: Vec<PairingOutcome>,
}

impl RunSummary {
    /// Merge counts over every completed pairing.
    pub fn totals(&self) -> MergeReport {
        let mut total = MergeReport::default();
        for outcome in &self.outcomes {
            if let PairingStatus::Completed { report, .. } = &outcome.status {
                total.absorb(report.clone());
            }
        }
        total
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    pub fn partial_failures(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match &o.status {
                PairingStatus::Completed { failures, .. } => failures.len(),
                PairingStatus::Failed(_) => 0,
            })
            .sum()
    }
}

impl Pipeline {
    pub fn new(
        db: Db,
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn ShowExtractor>,
        endpoints: Arc<dyn EndpointResolver>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            fetcher,
            extractor,
            endpoints,
            mailbox: None,
            mail: MailSettings::default(),
            settings,
            max_pages_per_site: 5,
            show_progress: false,
        }
    }

    /// Wires the fetcher, extractor and mailbox the config asks for.
    pub fn from_config(config: &AppConfig, db: Db) -> Result<Self, PipelineError> {
        let fetcher: Arc<dyn PageFetcher> = match config.fetch.backend {
            FetchBackend::Spider => Arc::new(SpiderFetcher::from_env(config.fetch.max_retries)?),
            FetchBackend::Http => Arc::new(HttpFetcher::new(&config.fetch)?),
        };
        let llm = Arc::new(LlmExtractor::from_settings(&config.extraction));
        let mut pipeline = Self::new(db, fetcher, llm.clone(), llm, config.pipeline.clone())
            .with_mail(config.mail.clone())
            .with_max_pages(config.fetch.max_pages_per_site);
        if let Some(root) = &config.mail.maildir {
            pipeline = pipeline.with_mailbox(Arc::new(Maildir::new(root)));
        }
        Ok(pipeline)
    }

    pub fn with_mailbox(mut self, mailbox: Arc<dyn Mailbox>) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    pub fn with_mail(mut self, mail: MailSettings) -> Self {
        self.mail = mail;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages_per_site = max_pages;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn context(&self, today: NaiveDate) -> SourceContext {
        SourceContext {
            db: self.db.clone(),
            cache: ContentCache::new(self.db.clone(), self.fetcher.clone()),
            fetcher: self.fetcher.clone(),
            extractor: self.extractor.clone(),
            endpoints: self.endpoints.clone(),
            mailbox: self.mailbox.clone(),
            mail: self.mail.clone(),
            max_pages_per_site: self.max_pages_per_site,
            today,
        }
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            DateResolver::new(self.settings.year_search_window),
            self.settings.merge_policy,
        )
    }

    /// Runs the named artists (registering any that are new), or every
    /// tracked artist when `artists` is `None`.
    pub async fn run(
        &self,
        artists: Option<&[String]>,
        today: NaiveDate,
    ) -> Result<RunSummary, PipelineError> {
        let names: Vec<String> = match artists {
            Some(names) => self.db.with(|c| {
                names
                    .iter()
                    .map(|n| db::get_or_create_artist(c, n).map(|a| a.into_inner().name))
                    .collect()
            })?,
            None => self
                .db
                .with(db::list_artists)?
                .into_iter()
                .map(|a| a.name)
                .collect(),
        };

        let mut kinds: Vec<SourceKind> = self
            .settings
            .sources
            .iter()
            .copied()
            .filter(|k| k.is_artist_bound())
            .collect();
        kinds.sort();
        kinds.dedup();
        let run_inbox = self.settings.sources.contains(&SourceKind::Inbox);

        let ctx = self.context(today);
        let reconciler = self.reconciler();
        info!(
            artists = names.len(),
            sources = ?kinds,
            inbox = run_inbox,
            "Starting run"
        );

        let mut outcomes = Vec::new();
        if !kinds.is_empty() && !names.is_empty() {
            outcomes = self.run_artists(&ctx, reconciler, &names, &kinds).await;
        }
        if run_inbox {
            outcomes.push(run_pairing(&ctx, reconciler, Source::inbox(), INBOX_LABEL).await);
        }
        outcomes.sort_by(|a, b| (&a.artist, a.source).cmp(&(&b.artist, b.source)));

        let summary = RunSummary {
            artists: names.len(),
            outcomes,
        };
        let totals = summary.totals();
        info!(
            created = totals.created,
            existing = totals.already_existed,
            updated = totals.updated,
            skipped = totals.skipped_unparseable_date,
            failed = summary.failed(),
            "Run finished"
        );
        Ok(summary)
    }

    async fn run_artists(
        &self,
        ctx: &SourceContext,
        reconciler: Reconciler,
        names: &[String],
        kinds: &[SourceKind],
    ) -> Vec<PairingOutcome> {
        let concurrency = self.settings.max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let pb = if self.show_progress {
            let pb = ProgressBar::new((names.len() * kinds.len()) as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let (tx, mut rx) = mpsc::channel::<PairingOutcome>(concurrency * 2);

        for artist in names {
            let sem = semaphore.clone();
            let tx = tx.clone();
            let ctx = ctx.clone();
            let artist = artist.clone();
            let kinds = kinds.to_vec();
            tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return;
                };
                for kind in kinds {
                    let Some(source) = Source::for_artist(kind, &artist) else {
                        continue;
                    };
                    let outcome = run_pairing(&ctx, reconciler, source, &artist).await;
                    if tx.send(outcome).await.is_err() {
                        return;
                    }
                }
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(names.len() * kinds.len());
        while let Some(outcome) = rx.recv().await {
            pb.inc(1);
            outcomes.push(outcome);
        }
        pb.finish_and_clear();
        outcomes
    }
}

async fn run_pairing(
    ctx: &SourceContext,
    reconciler: Reconciler,
    mut source: Source,
    artist: &str,
) -> PairingOutcome {
    let kind = source.kind();
    let status = match drive(ctx, reconciler, &mut source).await {
        Ok(status) => status,
        Err(e) => {
            if e.is_recoverable() {
                warn!(artist, source = %kind, "Pairing failed: {}", e);
            } else {
                warn!(artist, source = %kind, "Pairing failed, needs attention: {}", e);
            }
            PairingStatus::Failed(e)
        }
    };
    PairingOutcome {
        artist: artist.to_string(),
        source: kind,
        status,
    }
}

/// Resolve, fetch, then merge batch by batch. Messages are acknowledged
/// only once their batch has committed; the cache entries of a batch that
/// did not commit are forgotten so the pages are extracted again next run.
async fn drive(
    ctx: &SourceContext,
    reconciler: Reconciler,
    source: &mut Source,
) -> Result<PairingStatus, PipelineError> {
    source.resolve(ctx).await?;
    let fetched = source.fetch_shows(ctx).await?;

    let mut report = MergeReport::default();
    let mut failures = fetched.failures;
    let batches = fetched.batches.len();

    for batch in fetched.batches {
        match reconciler.merge(&ctx.db, &batch, ctx.today) {
            Ok(merged) => {
                report.absorb(merged);
                acknowledge(ctx, &batch.receipt.messages, &mut failures).await;
            }
            Err(e) => {
                warn!(artist = %batch.artist_name, source = %batch.kind, "Merge failed: {}", e);
                ctx.cache
                    .forget_all(batch.receipt.cache_urls.iter().map(String::as_str));
                failures.push((batch.artist_name.clone(), PipelineError::Store(e)));
            }
        }
    }
    acknowledge(ctx, &fetched.settled.messages, &mut failures).await;

    Ok(PairingStatus::Completed {
        report,
        batches,
        failures,
    })
}

async fn acknowledge(
    ctx: &SourceContext,
    messages: &[MessageId],
    failures: &mut Vec<(String, PipelineError)>,
) {
    if messages.is_empty() {
        return;
    }
    let Some(mailbox) = &ctx.mailbox else {
        return;
    };
    for id in messages {
        if let Err(e) = mailbox.mark_seen(id).await {
            warn!(message = %id, "Could not mark message seen: {}", e);
            failures.push((id.to_string(), e.into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::RawShowCandidate;
    use crate::sources::testing::{fixture, Fixture};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn pipeline(f: &Fixture, sources: Vec<SourceKind>) -> Pipeline {
        Pipeline::new(
            f.ctx.db.clone(),
            f.web.clone(),
            f.extractor.clone(),
            f.extractor.clone(),
            PipelineSettings {
                sources,
                max_concurrency: 2,
                ..PipelineSettings::default()
            },
        )
        .with_mailbox(f.mailbox.clone())
        .with_mail(f.ctx.mail.clone())
    }

    fn concerts(f: &Fixture) -> Vec<(String, NaiveDate, String)> {
        f.ctx
            .db
            .with(|c| db::fetch_concerts(c, None, None, 100))
            .unwrap()
            .into_iter()
            .map(|c| (c.artist, c.date, c.city))
            .collect()
    }

    #[tokio::test]
    async fn second_run_changes_nothing() {
        let f = fixture(date(2024, 6, 1));
        f.extractor.site("Men I Trust", "https://menitrust.com/");
        f.extractor.listing("Men I Trust", "https://listings.example.com/a/men-i-trust");
        f.web.set("https://menitrust.com/", "HOME [Tour](/tour)");
        f.web.set("https://menitrust.com/tour", "TOURPAGE");
        f.web.set("https://listings.example.com/a/men-i-trust/calendar", "LISTING");
        f.extractor.on(
            "TOURPAGE",
            vec![
                RawShowCandidate::new("December 15", "Berlin").at_venue("Astra"),
                RawShowCandidate::new("sometime in the fall", "Paris"),
            ],
        );
        f.extractor.on(
            "LISTING",
            vec![RawShowCandidate::new("December 15", "Berlin").at_venue("Astra Kulturhaus")],
        );

        let p = pipeline(&f, vec![SourceKind::ArtistWebsite, SourceKind::ListingSite]);
        let artists = vec!["Men I Trust".to_string()];
        let first = p.run(Some(&artists), date(2024, 6, 1)).await.unwrap();
        assert_eq!(first.failed(), 0);
        let totals = first.totals();
        assert_eq!(totals.created, 1);
        assert_eq!(totals.already_existed, 1);
        assert_eq!(totals.skipped_unparseable_date, 1);
        let stored = concerts(&f);
        assert_eq!(stored, vec![("Men I Trust".into(), date(2024, 12, 15), "Berlin".into())]);

        let second = p.run(None, date(2024, 6, 1)).await.unwrap();
        assert_eq!(second.totals().created, 0);
        assert_eq!(second.totals().venues_created, 0);
        assert_eq!(concerts(&f), stored);
    }

    #[tokio::test]
    async fn inbox_registers_artist_and_acks_after_commit() {
        let f = fixture(date(2024, 1, 10));
        f.mailbox.deliver(
            "INBOX",
            "x1",
            "me@example.com",
            "Artist X live",
            "ARTISTX plays July 4 in Montreal",
        );
        f.extractor.artist_for("ARTISTX", "Artist X");
        f.extractor.on("ARTISTX", vec![RawShowCandidate::new("July 4", "Montreal")]);

        let p = pipeline(&f, vec![SourceKind::Inbox]);
        let summary = p.run(None, date(2024, 1, 10)).await.unwrap();

        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.outcomes[0].artist, INBOX_LABEL);
        assert_eq!(concerts(&f), vec![("Artist X".into(), date(2024, 7, 4), "Montreal".into())]);
        assert!(f.mailbox.is_seen("x1"));
    }

    #[tokio::test]
    async fn newsletters_stay_unseen_until_merged() {
        let f = fixture(date(2024, 6, 1));
        let address = "men-i-trust@shows.example.org";
        f.mailbox.deliver("INBOX", "n1", address, "Tour", "EXPLODE");
        let p = pipeline(&f, vec![SourceKind::Newsletter]);
        let artists = vec!["Men I Trust".to_string()];

        let failed = p.run(Some(&artists), date(2024, 6, 1)).await.unwrap();
        assert_eq!(failed.failed(), 1);
        assert!(!f.mailbox.is_seen("n1"));

        f.mailbox.messages.lock().unwrap().clear();
        f.mailbox.deliver("INBOX", "n2", address, "Tour", "NEWS September 10 Paris");
        f.extractor.on("NEWS", vec![RawShowCandidate::new("September 10", "Paris")]);
        let ok = p.run(Some(&artists), date(2024, 6, 1)).await.unwrap();
        assert_eq!(ok.failed(), 0);
        assert!(f.mailbox.is_seen("n2"));
        assert_eq!(concerts(&f).len(), 1);
    }

    #[tokio::test]
    async fn failing_pairing_does_not_stop_the_others() {
        let f = fixture(date(2024, 6, 1));
        f.extractor.site("Khruangbin", "https://khruangbin.com/");
        f.web.set("https://khruangbin.com/", "KHRUANGBIN");
        f.extractor.on("KHRUANGBIN", vec![RawShowCandidate::new("August 2", "Austin")]);

        let p = pipeline(&f, vec![SourceKind::ArtistWebsite]);
        let artists = vec![
            "Khruangbin".to_string(),
            "Nobody".to_string(),
            "Men I Trust".to_string(),
        ];
        let summary = p.run(Some(&artists), date(2024, 6, 1)).await.unwrap();

        assert_eq!(summary.artists, 3);
        assert_eq!(summary.outcomes.len(), 3);
        assert_eq!(summary.failed(), 2);
        let ok: Vec<&str> = summary
            .outcomes
            .iter()
            .filter(|o| !o.is_failed())
            .map(|o| o.artist.as_str())
            .collect();
        assert_eq!(ok, vec!["Khruangbin"]);
        assert_eq!(concerts(&f), vec![("Khruangbin".into(), date(2024, 8, 2), "Austin".into())]);
    }

    #[tokio::test]
    async fn failed_merge_keeps_mail_unseen_and_pages_changed() {
        let f = fixture(date(2024, 6, 1));
        f.extractor.site("Men I Trust", "https://menitrust.com/");
        f.web.set("https://menitrust.com/", "HOME");
        f.mailbox.deliver(
            "INBOX",
            "n1",
            "men-i-trust@shows.example.org",
            "Tour",
            "NEWS September 10 Paris",
        );
        f.extractor.on("HOME", vec![RawShowCandidate::new("December 15", "Berlin")]);
        f.extractor.on("NEWS", vec![RawShowCandidate::new("September 10", "Paris")]);
        f.ctx
            .db
            .with(|c| {
                c.execute_batch(
                    "CREATE TRIGGER no_concerts BEFORE INSERT ON concerts
                     BEGIN SELECT RAISE(ABORT, 'concerts are read-only'); END;",
                )
            })
            .unwrap();

        let p = pipeline(&f, vec![SourceKind::ArtistWebsite, SourceKind::Newsletter]);
        let artists = vec!["Men I Trust".to_string()];
        let first = p.run(Some(&artists), date(2024, 6, 1)).await.unwrap();
        assert_eq!(first.failed(), 0);
        assert_eq!(first.partial_failures(), 2);
        assert_eq!(first.totals().created, 0);
        assert!(!f.mailbox.is_seen("n1"));
        assert!(concerts(&f).is_empty());

        f.ctx
            .db
            .with(|c| c.execute_batch("DROP TRIGGER no_concerts"))
            .unwrap();
        let calls_before = f.extractor.calls.lock().unwrap().len();
        let second = p.run(Some(&artists), date(2024, 6, 1)).await.unwrap();
        assert_eq!(second.totals().created, 2);
        assert_eq!(f.extractor.calls.lock().unwrap().len(), calls_before + 2);
        assert!(f.mailbox.is_seen("n1"));
    }

    #[tokio::test]
    async fn page_failures_are_partial() {
        let f = fixture(date(2024, 6, 1));
        f.extractor.site("Men I Trust", "https://menitrust.com/");
        f.web.set("https://menitrust.com/", "HOME [Tour](/tour) [Live](/live)");
        f.web.set("https://menitrust.com/tour", "EXPLODE");

        let p = pipeline(&f, vec![SourceKind::ArtistWebsite]);
        let artists = vec!["Men I Trust".to_string()];
        let summary = p.run(Some(&artists), date(2024, 6, 1)).await.unwrap();
        assert_eq!(summary.failed(), 0);
        assert_eq!(summary.partial_failures(), 2);
    }
}
