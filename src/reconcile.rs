use chrono::NaiveDate;
use rusqlite::{Connection, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dates::{DateBias, DateResolver};
use crate::db::{self, Db, NewConcert, NewVenue};
use crate::error::DateResolutionError;
use crate::extract::{RawShowCandidate, ShowSection};
use crate::sources::ShowBatch;

/// What happens when a candidate lands on a concert that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The stored row stays as first written.
    #[default]
    KeepFirst,
    /// Location and venue are refreshed from the newer candidate.
    Overwrite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedCandidate {
    /// Position in the batch.
    pub index: usize,
    pub date: String,
    pub reason: DateResolutionError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub created: usize,
    pub already_existed: usize,
    pub updated: usize,
    pub skipped_unparseable_date: usize,
    pub venues_created: usize,
    pub skipped: Vec<SkippedCandidate>,
}

impl MergeReport {
    pub fn absorb(&mut self, other: MergeReport) {
        self.created += other.created;
        self.already_existed += other.already_existed;
        self.updated += other.updated;
        self.skipped_unparseable_date += other.skipped_unparseable_date;
        self.venues_created += other.venues_created;
        self.skipped.extend(other.skipped);
    }

    pub fn candidates_seen(&self) -> usize {
        self.created + self.already_existed + self.updated + self.skipped_unparseable_date
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    resolver: DateResolver,
    policy: MergePolicy,
}

impl Reconciler {
    pub fn new(resolver: DateResolver, policy: MergePolicy) -> Self {
        Self { resolver, policy }
    }

    /// Merges a batch in one transaction. A candidate whose date cannot be
    /// resolved is skipped and reported; any store error rolls back the
    /// whole batch.
    pub fn merge(&self, db: &Db, batch: &ShowBatch, today: NaiveDate) -> Result<MergeReport> {
        db.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            let report = self.merge_in(&tx, batch, today)?;
            tx.commit()?;
            Ok(report)
        })
    }

    fn merge_in(&self, conn: &Connection, batch: &ShowBatch, today: NaiveDate) -> Result<MergeReport> {
        let artist = db::get_or_create_artist(conn, &batch.artist_name)?.into_inner();
        let fallback_source = batch.kind.to_string();
        let past = DateBias::PastLeaning;
        let future = DateBias::FutureLeaning;

        let mut report = MergeReport::default();
        for (index, candidate) in batch.candidates.iter().enumerate() {
            let bias = match candidate.section {
                Some(ShowSection::Past) => &past,
                Some(ShowSection::Upcoming) => &future,
                None => &batch.bias,
            };
            let date = match self.resolver.resolve(&candidate.date, today, bias) {
                Ok(date) => date,
                Err(reason) => {
                    debug!(
                        artist = %artist.name,
                        date = %candidate.date,
                        "Skipping candidate: {}", reason
                    );
                    report.skipped_unparseable_date += 1;
                    report.skipped.push(SkippedCandidate {
                        index,
                        date: candidate.date.to_string(),
                        reason,
                    });
                    continue;
                }
            };

            let venue_id = match non_empty(&candidate.venue) {
                Some(name) => {
                    let venue = db::get_or_create_venue(conn, &new_venue(name, candidate))?;
                    if venue.was_created() {
                        report.venues_created += 1;
                    }
                    Some(venue.get().id)
                }
                None => None,
            };

            let concert = NewConcert {
                artist_id: artist.id,
                date,
                city: candidate.city.trim(),
                state: non_empty(&candidate.state),
                country: non_empty(&candidate.country),
                country_code: non_empty(&candidate.country_code),
                venue_id,
                source: non_empty(&candidate.source_url).unwrap_or(&fallback_source),
            };
            let stored = db::get_or_create_concert(conn, &concert)?;
            match (stored.was_created(), self.policy) {
                (true, _) => report.created += 1,
                (false, MergePolicy::Overwrite)
                    if db::update_concert_details(conn, stored.get().id, &concert)? =>
                {
                    report.updated += 1
                }
                (false, _) => report.already_existed += 1,
            }
        }

        debug!(
            artist = %artist.name,
            kind = %batch.kind,
            created = report.created,
            existing = report.already_existed,
            skipped = report.skipped_unparseable_date,
            "Batch merged"
        );
        Ok(report)
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn new_venue<'a>(name: &'a str, candidate: &'a RawShowCandidate) -> NewVenue<'a> {
    NewVenue {
        name,
        city: candidate.city.trim(),
        state: non_empty(&candidate.state),
        country: non_empty(&candidate.country),
        country_code: non_empty(&candidate.country_code),
    }
}
