use tracing::{debug, info, warn};

use super::{
    default_source, message_text, Fetched, Phase, Receipt, ShowBatch, SourceContext, SourceKind,
};
use crate::dates::DateBias;
use crate::db;
use crate::error::PipelineError;
use crate::extract::{resolve_artist_identity, ExtractionRequest, MatchType};
use crate::mail::RawMessage;

/// The personal inbox. Not bound to an artist: each message names its own,
/// and is processed on its own.
#[derive(Debug)]
pub struct InboxSource {
    phase: Phase<()>,
}

impl Default for InboxSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InboxSource {
    pub fn new() -> Self {
        Self {
            phase: Phase::Unresolved,
        }
    }

    /// Nothing to look up; only checks that a mailbox is there.
    pub fn resolve(&mut self, ctx: &SourceContext) -> Result<(), PipelineError> {
        ctx.mailbox()?;
        self.phase = Phase::Resolved(());
        Ok(())
    }

    /// One batch per message that names an artist. A failing message stays
    /// unseen and does not hold back the others.
    pub async fn fetch_shows(&mut self, ctx: &SourceContext) -> Result<Fetched, PipelineError> {
        self.phase.require(SourceKind::Inbox)?;

        let filters: Vec<Option<&str>> = if ctx.mail.to_addresses.is_empty() {
            vec![None]
        } else {
            ctx.mail.to_addresses.iter().map(|a| Some(a.as_str())).collect()
        };
        let messages = ctx.unseen_messages(&filters).await?;
        debug!(count = messages.len(), "Unseen inbox messages");

        let mut fetched = Fetched::default();
        for message in messages {
            match Self::process(ctx, &message).await {
                Ok(Some(batch)) => fetched.batches.push(batch),
                Ok(None) => {
                    debug!(subject = %message.subject, "No artist in message");
                    fetched.settled.messages.push(message.id);
                }
                Err(e) => {
                    warn!(subject = %message.subject, "Inbox message failed: {}", e);
                    fetched.failures.push((message.id.to_string(), e));
                }
            }
        }

        self.phase = std::mem::replace(&mut self.phase, Phase::Unresolved).into_fetched();
        Ok(fetched)
    }

    async fn process(
        ctx: &SourceContext,
        message: &RawMessage,
    ) -> Result<Option<ShowBatch>, PipelineError> {
        let text = message_text(message, true);

        let known: Vec<String> = ctx
            .db
            .with(db::list_artists)?
            .into_iter()
            .map(|a| a.name)
            .collect();
        let Some(mentioned) = ctx.extractor.identify_artist(&text, &known).await? else {
            return Ok(None);
        };

        let identity = ctx.db.with(|c| resolve_artist_identity(c, &mentioned))?;
        if identity.match_type == MatchType::Created {
            info!(artist = %identity.artist.name, "Registered artist from inbox");
        }
        let artist = identity.artist.name;

        let known_venues = ctx.db.with(|c| db::known_venues_for_artist(c, &artist))?;
        let request = ExtractionRequest {
            text: &text,
            artist_name: &artist,
            reference_date: ctx.today,
            source_kind: SourceKind::Inbox,
            known_venues: &known_venues,
        };
        let mut candidates = ctx.extractor.extract(&request).await?;
        default_source(&mut candidates, sender_address(&message.from));

        Ok(Some(ShowBatch {
            artist_name: artist,
            kind: SourceKind::Inbox,
            bias: DateBias::FutureLeaning,
            candidates,
            receipt: Receipt {
                cache_urls: Vec::new(),
                messages: vec![message.id.clone()],
            },
        }))
    }
}

/// `Name <addr@host>` -> `addr@host`.
fn sender_address(from: &str) -> &str {
    match (from.rfind('<'), from.rfind('>')) {
        (Some(start), Some(end)) if start < end => &from[start + 1..end],
        _ => from.trim(),
    }
}
