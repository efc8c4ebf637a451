//! Boundary to the text-understanding collaborator.
//!
//! The pipeline only relies on the contract below: text in, unvalidated show
//! candidates out. Which model or service sits behind it is configuration.

pub mod identity;
pub mod llm;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::dates::DateExpression;
use crate::error::ExtractionError;
use crate::sources::SourceKind;

pub use identity::{resolve_artist_identity, ArtistMatch, MatchType};
pub use llm::LlmExtractor;

/// Which part of a listings page a show was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowSection {
    Upcoming,
    Past,
}

/// A show as extracted: nothing resolved, nothing validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawShowCandidate {
    pub date: DateExpression,
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    /// ISO 3166-1 alpha-2.
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default, alias = "source")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub section: Option<ShowSection>,
}

impl RawShowCandidate {
    pub fn new(date: &str, city: &str) -> Self {
        Self {
            date: DateExpression::parse(date),
            city: city.to_string(),
            state: None,
            country: None,
            country_code: None,
            venue: None,
            source_url: None,
            section: None,
        }
    }

    pub fn at_venue(mut self, venue: &str) -> Self {
        self.venue = Some(venue.to_string());
        self
    }

    pub fn in_section(mut self, section: ShowSection) -> Self {
        self.section = Some(section);
        self
    }
}

pub struct ExtractionRequest<'a> {
    pub text: &'a str,
    pub artist_name: &'a str,
    pub reference_date: NaiveDate,
    pub source_kind: SourceKind,
    /// Venues already on record for this artist, to keep spellings stable.
    pub known_venues: &'a [String],
}

#[async_trait]
pub trait ShowExtractor: Send + Sync {
    /// Shows mentioned in `request.text`, in no particular order. An empty
    /// list when there are none; never a made-up date.
    async fn extract(
        &self,
        request: &ExtractionRequest<'_>,
    ) -> Result<Vec<RawShowCandidate>, ExtractionError>;

    /// The artist an email is about, preferring a spelling from `known_artists`.
    async fn identify_artist(
        &self,
        text: &str,
        known_artists: &[String],
    ) -> Result<Option<String>, ExtractionError>;
}

#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn find_official_site(&self, artist_name: &str)
        -> Result<Option<String>, ExtractionError>;

    async fn find_listing_page(&self, artist_name: &str)
        -> Result<Option<String>, ExtractionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_from_extractor_json() {
        let json = r#"{
            "date": "July 4",
            "city": "Montreal",
            "country": "Canada",
            "country_code": "CA",
            "venue": "Corona Theatre",
            "source": "news@menitrust.com",
            "section": "past"
        }"#;
        let c: RawShowCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(c.date, DateExpression::Partial("July 4".into()));
        assert_eq!(c.source_url.as_deref(), Some("news@menitrust.com"));
        assert_eq!(c.section, Some(ShowSection::Past));
        assert_eq!(c.state, None);
    }

    #[test]
    fn concrete_dates_deserialize_as_concrete() {
        let c: RawShowCandidate =
            serde_json::from_str(r#"{"date": "2024-09-10", "city": "Paris"}"#).unwrap();
        assert_eq!(
            c.date,
            DateExpression::Concrete(NaiveDate::from_ymd_opt(2024, 9, 10).unwrap())
        );
        assert_eq!(c, RawShowCandidate::new("2024-09-10", "Paris"));
    }
}
