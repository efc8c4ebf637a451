use tracing::debug;

use super::{
    default_source, message_text, slugify, Fetched, Phase, Receipt, ShowBatch, SourceContext,
    SourceKind,
};
use crate::dates::DateBias;
use crate::db;
use crate::error::{ConfigError, PipelineError};
use crate::extract::ExtractionRequest;

const MESSAGE_SEPARATOR: &str = "\n\n---\n\n";

/// Mail sent to the artist's newsletter address, `<slug>@<newsletter domain>`.
#[derive(Debug)]
pub struct NewsletterSource {
    artist: String,
    phase: Phase<String>,
}

impl NewsletterSource {
    pub fn new(artist: &str) -> Self {
        Self {
            artist: artist.to_string(),
            phase: Phase::Unresolved,
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.phase.endpoint().map(String::as_str)
    }

    /// No lookup involved; the address follows from the artist name.
    pub fn resolve(&mut self, ctx: &SourceContext) -> Result<(), PipelineError> {
        let domain = ctx
            .mail
            .newsletter_domain
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| ConfigError::Invalid("mail.newsletter_domain is not set".into()))?;
        ctx.mailbox()?;
        self.phase = Phase::Resolved(format!("{}@{}", slugify(&self.artist), domain.trim()));
        Ok(())
    }

    /// All unseen newsletters in one extraction call. The messages are only
    /// acknowledged through the batch receipt, after the merge commits.
    pub async fn fetch_shows(&mut self, ctx: &SourceContext) -> Result<Fetched, PipelineError> {
        let address = self.phase.require(SourceKind::Newsletter)?.clone();

        let messages = ctx.unseen_messages(&[Some(address.as_str())]).await?;
        let mut fetched = Fetched::default();
        if messages.is_empty() {
            debug!(artist = %self.artist, address = %address, "No unseen newsletters");
        } else {
            let text = messages
                .iter()
                .map(|m| message_text(m, false))
                .collect::<Vec<_>>()
                .join(MESSAGE_SEPARATOR);
            let known_venues = ctx
                .db
                .with(|c| db::known_venues_for_artist(c, &self.artist))?;
            let request = ExtractionRequest {
                text: &text,
                artist_name: &self.artist,
                reference_date: ctx.today,
                source_kind: SourceKind::Newsletter,
                known_venues: &known_venues,
            };
            let mut candidates = ctx.extractor.extract(&request).await?;
            default_source(&mut candidates, &format!("newsletter:{}", address));
            fetched.batches.push(ShowBatch {
                artist_name: self.artist.clone(),
                kind: SourceKind::Newsletter,
                bias: DateBias::FutureLeaning,
                candidates,
                receipt: Receipt {
                    cache_urls: Vec::new(),
                    messages: messages.into_iter().map(|m| m.id).collect(),
                },
            });
        }

        self.phase = std::mem::replace(&mut self.phase, Phase::Unresolved).into_fetched();
        Ok(fetched)
    }
}
