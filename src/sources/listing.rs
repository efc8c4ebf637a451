use tracing::{debug, info};

use super::{default_source, Fetched, Phase, Receipt, ShowBatch, SourceContext, SourceKind};
use crate::dates::DateBias;
use crate::db;
use crate::error::PipelineError;
use crate::extract::ExtractionRequest;

/// The artist's page on a concert listings site. Unlike the website, a
/// listings page is required: not finding one fails the source.
#[derive(Debug)]
pub struct ListingSource {
    artist: String,
    phase: Phase<String>,
}

/// The `/calendar` view of a listings page shows the most dates.
pub fn calendar_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with("/calendar") {
        trimmed.to_string()
    } else {
        format!("{}/calendar", trimmed)
    }
}

impl ListingSource {
    pub fn new(artist: &str) -> Self {
        Self {
            artist: artist.to_string(),
            phase: Phase::Unresolved,
        }
    }

    pub fn phase(&self) -> &Phase<String> {
        &self.phase
    }

    pub async fn resolve(&mut self, ctx: &SourceContext) -> Result<(), PipelineError> {
        let artist = ctx
            .db
            .with(|c| db::get_or_create_artist(c, &self.artist))?
            .into_inner();

        let stored = artist.listing_url.clone();
        let url = match stored.as_deref() {
            Some(url) => calendar_url(url),
            None => {
                let found = ctx
                    .endpoints
                    .find_listing_page(&self.artist)
                    .await?
                    .ok_or_else(|| PipelineError::EndpointNotFound {
                        artist: self.artist.clone(),
                        endpoint: "listing page",
                    })?;
                info!(artist = %self.artist, url = %found, "Resolved listing page");
                calendar_url(&found)
            }
        };
        if stored.as_deref() != Some(url.as_str()) {
            ctx.db.with(|c| db::set_artist_listing_url(c, artist.id, &url))?;
        }
        self.phase = Phase::Resolved(url);
        Ok(())
    }

    /// One page; extracted only when it changed. Candidates lean forward
    /// unless they were read from the past-concerts section.
    pub async fn fetch_shows(&mut self, ctx: &SourceContext) -> Result<Fetched, PipelineError> {
        let url = self.phase.require(SourceKind::ListingSite)?.clone();

        let page = ctx.cache.check(&url).await?;
        let mut fetched = Fetched::default();
        if page.changed {
            let known_venues =
                match ctx.db.with(|c| db::known_venues_for_artist(c, &self.artist)) {
                    Ok(venues) => venues,
                    Err(e) => {
                        ctx.cache.forget_all([url.as_str()]);
                        return Err(e.into());
                    }
                };
            let request = ExtractionRequest {
                text: &page.content,
                artist_name: &self.artist,
                reference_date: ctx.today,
                source_kind: SourceKind::ListingSite,
                known_venues: &known_venues,
            };
            let mut candidates = match ctx.extractor.extract(&request).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    ctx.cache.forget_all([url.as_str()]);
                    return Err(e.into());
                }
            };
            default_source(&mut candidates, &url);
            fetched.batches.push(ShowBatch {
                artist_name: self.artist.clone(),
                kind: SourceKind::ListingSite,
                bias: DateBias::FutureLeaning,
                candidates,
                receipt: Receipt {
                    cache_urls: vec![url.clone()],
                    messages: Vec::new(),
                },
            });
        } else {
            debug!(artist = %self.artist, url = %url, "Listing page unchanged");
        }

        self.phase = std::mem::replace(&mut self.phase, Phase::Unresolved).into_fetched();
        Ok(fetched)
    }
}
