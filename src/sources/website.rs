use tracing::{debug, info, warn};

use super::{default_source, Fetched, Phase, Receipt, ShowBatch, SourceContext, SourceKind};
use crate::cache::PageCheck;
use crate::dates::DateBias;
use crate::db;
use crate::error::PipelineError;
use crate::extract::ExtractionRequest;
use crate::fetch::{discover_tour_pages, parse_urlset, sitemap_url};

/// The artist's own site: the home page plus whatever tour pages it links to.
#[derive(Debug)]
pub struct WebsiteSource {
    artist: String,
    phase: Phase<String>,
}

impl WebsiteSource {
    pub fn new(artist: &str) -> Self {
        Self {
            artist: artist.to_string(),
            phase: Phase::Unresolved,
        }
    }

    pub fn phase(&self) -> &Phase<String> {
        &self.phase
    }

    /// Uses the URL stored on the artist, looking it up (once, for good)
    /// when there is none.
    pub async fn resolve(&mut self, ctx: &SourceContext) -> Result<(), PipelineError> {
        let artist = ctx
            .db
            .with(|c| db::get_or_create_artist(c, &self.artist))?
            .into_inner();

        let url = match artist.website_base_url {
            Some(url) => url,
            None => {
                let found = ctx
                    .endpoints
                    .find_official_site(&self.artist)
                    .await?
                    .ok_or_else(|| PipelineError::EndpointNotFound {
                        artist: self.artist.clone(),
                        endpoint: "official website",
                    })?;
                info!(artist = %self.artist, url = %found, "Resolved official website");
                ctx.db.with(|c| db::set_artist_website(c, artist.id, &found))?;
                found
            }
        };
        self.phase = Phase::Resolved(url);
        Ok(())
    }

    /// Checks the base URL and the discovered tour pages one by one. Only
    /// changed pages are extracted, each into its own batch. A base URL that
    /// cannot be fetched fails the whole source.
    pub async fn fetch_shows(&mut self, ctx: &SourceContext) -> Result<Fetched, PipelineError> {
        let base = self.phase.require(SourceKind::ArtistWebsite)?.clone();

        let home = ctx.cache.check(&base).await?;
        let sitemap = self.sitemap(ctx, &base).await;
        let pages = discover_tour_pages(&base, &sitemap, &home.content, ctx.max_pages_per_site);

        let mut fetched = Fetched::default();
        let mut checks = vec![home];
        for url in pages {
            match ctx.cache.check(&url).await {
                Ok(check) => checks.push(check),
                Err(e) => {
                    warn!(artist = %self.artist, url = %url, "Tour page fetch failed: {}", e);
                    fetched.failures.push((url, e));
                }
            }
        }

        let changed: Vec<PageCheck> = checks.into_iter().filter(|c| c.changed).collect();
        if changed.is_empty() {
            debug!(artist = %self.artist, "No website pages changed");
        } else {
            let known_venues =
                match ctx.db.with(|c| db::known_venues_for_artist(c, &self.artist)) {
                    Ok(venues) => venues,
                    Err(e) => {
                        ctx.cache.forget_all(changed.iter().map(|p| p.url.as_str()));
                        return Err(e.into());
                    }
                };
            for page in changed {
                match self.extract_page(ctx, &page, &known_venues).await {
                    Ok(batch) => fetched.batches.push(batch),
                    Err(e) => {
                        ctx.cache.forget_all([page.url.as_str()]);
                        fetched.failures.push((page.url, e));
                    }
                }
            }
        }

        self.phase = std::mem::replace(&mut self.phase, Phase::Unresolved).into_fetched();
        Ok(fetched)
    }

    async fn sitemap(&self, ctx: &SourceContext, base: &str) -> Vec<String> {
        let Some(url) = sitemap_url(base) else {
            return Vec::new();
        };
        match ctx.fetcher.fetch(&url).await {
            Ok(xml) => parse_urlset(&xml).unwrap_or_else(|e| {
                debug!(url = %url, "Unreadable sitemap: {}", e);
                Vec::new()
            }),
            Err(e) => {
                debug!(url = %url, "No sitemap: {}", e);
                Vec::new()
            }
        }
    }

    async fn extract_page(
        &self,
        ctx: &SourceContext,
        page: &PageCheck,
        known_venues: &[String],
    ) -> Result<ShowBatch, PipelineError> {
        let request = ExtractionRequest {
            text: &page.content,
            artist_name: &self.artist,
            reference_date: ctx.today,
            source_kind: SourceKind::ArtistWebsite,
            known_venues,
        };
        let mut candidates = ctx.extractor.extract(&request).await?;
        default_source(&mut candidates, &page.url);
        debug!(artist = %self.artist, url = %page.url, shows = candidates.len(), "Page extracted");

        Ok(ShowBatch {
            artist_name: self.artist.clone(),
            kind: SourceKind::ArtistWebsite,
            bias: DateBias::AutoDetect {
                context: page.content.clone(),
            },
            candidates,
            receipt: Receipt {
                cache_urls: vec![page.url.clone()],
                messages: Vec::new(),
            },
        })
    }
}
