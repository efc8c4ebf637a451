//! Artist identity: look up before creating, so "men i trust" in an email
//! lands on the stored "Men I Trust" instead of a near-duplicate row.

use rusqlite::{Connection, Result};
use strsim::normalized_levenshtein;
use tracing::debug;

use crate::db::{self, ArtistRow};

/// Minimum similarity for a fuzzy match to count as the same artist.
pub const FUZZY_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Normalized,
    Fuzzy,
    Created,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtistMatch {
    pub artist: ArtistRow,
    /// 0-100.
    pub confidence: u8,
    pub match_type: MatchType,
}

/// Lowercase, trimmed, whitespace collapsed, leading "the" dropped.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    match words.as_slice() {
        ["the", rest @ ..] if !rest.is_empty() => rest.join(" "),
        _ => words.join(" "),
    }
}

fn best_fuzzy<'a>(name: &str, artists: &'a [ArtistRow]) -> Option<(&'a ArtistRow, f64)> {
    let normalized = normalize_name(name);
    artists
        .iter()
        .map(|a| (a, normalized_levenshtein(&normalized, &normalize_name(&a.name))))
        .filter(|(_, similarity)| *similarity >= FUZZY_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Exact name, then the partial-search hits, then every artist by
/// similarity; registers `mentioned` only when nothing is close enough.
pub fn resolve_artist_identity(conn: &Connection, mentioned: &str) -> Result<ArtistMatch> {
    let mentioned = mentioned.trim();

    if let Some(artist) = db::find_artist_by_name(conn, mentioned)? {
        return Ok(ArtistMatch {
            artist,
            confidence: 100,
            match_type: MatchType::Exact,
        });
    }

    let normalized = normalize_name(mentioned);
    let hits = db::search_artists(conn, mentioned)?;
    let all = db::list_artists(conn)?;
    let normalized_hit = hits
        .iter()
        .chain(all.iter())
        .find(|a| normalize_name(&a.name) == normalized);
    if let Some(artist) = normalized_hit {
        debug!(mentioned, stored = %artist.name, "artist matched after normalization");
        return Ok(ArtistMatch {
            artist: artist.clone(),
            confidence: 95,
            match_type: MatchType::Normalized,
        });
    }

    if let Some((artist, similarity)) = best_fuzzy(mentioned, &all) {
        debug!(mentioned, stored = %artist.name, similarity, "artist matched fuzzily");
        return Ok(ArtistMatch {
            artist: artist.clone(),
            confidence: (similarity * 100.0).round() as u8,
            match_type: MatchType::Fuzzy,
        });
    }

    let created = db::get_or_create_artist(conn, mentioned)?;
    let match_type = if created.was_created() {
        MatchType::Created
    } else {
        MatchType::Exact
    };
    Ok(ArtistMatch {
        artist: created.into_inner(),
        confidence: 100,
        match_type,
    })
}
