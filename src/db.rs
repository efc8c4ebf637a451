use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result};

pub const DEFAULT_DB_PATH: &str = "data/concerts.sqlite";

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        // Best effort: open() reports the real error if the directory is unusable.
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
    )?;
    Ok(conn)
}

pub fn connect_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/// Unique indexes are the authoritative guard for every get-or-create below.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS artists (
            id               INTEGER PRIMARY KEY,
            name             TEXT NOT NULL UNIQUE,
            website_base_url TEXT,
            listing_url      TEXT,
            created_at       TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS venues (
            id           INTEGER PRIMARY KEY,
            name         TEXT NOT NULL,
            city         TEXT NOT NULL,
            state        TEXT,
            country      TEXT,
            country_code TEXT,
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(name, city)
        );

        CREATE TABLE IF NOT EXISTS concerts (
            id           INTEGER PRIMARY KEY,
            artist_id    INTEGER NOT NULL REFERENCES artists(id),
            date         TEXT NOT NULL,
            city         TEXT NOT NULL,
            state        TEXT,
            country      TEXT,
            country_code TEXT,
            venue_id     INTEGER REFERENCES venues(id),
            source       TEXT NOT NULL,
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(artist_id, date)
        );
        CREATE INDEX IF NOT EXISTS idx_concerts_date ON concerts(date);

        CREATE TABLE IF NOT EXISTS page_cache (
            id              INTEGER PRIMARY KEY,
            url             TEXT NOT NULL UNIQUE,
            content_hash    TEXT,
            last_fetched_at TEXT,
            last_changed_at TEXT
        );
        ",
    )?;
    Ok(())
}

/// Shared connection handle. Each caller takes the lock for one synchronous
/// unit of work; it is never held across an `.await`.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = connect(path)?;
        init_schema(&conn)?;
        Ok(Self::new(conn))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = connect_in_memory()?;
        init_schema(&conn)?;
        Ok(Self::new(conn))
    }

    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-transaction leaves nothing uncommitted behind, so the
        // connection is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome of a get-or-create.
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert<T> {
    Created(T),
    Existing(T),
}

impl<T> Upsert<T> {
    pub fn was_created(&self) -> bool {
        matches!(self, Upsert::Created(_))
    }

    pub fn get(&self) -> &T {
        match self {
            Upsert::Created(t) | Upsert::Existing(t) => t,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Upsert::Created(t) | Upsert::Existing(t) => t,
        }
    }
}

// ── Artists ──

#[derive(Debug, Clone, PartialEq)]
pub struct ArtistRow {
    pub id: i64,
    pub name: String,
    pub website_base_url: Option<String>,
    pub listing_url: Option<String>,
}

const ARTIST_COLUMNS: &str = "id, name, website_base_url, listing_url";

fn artist_from_row(row: &rusqlite::Row) -> Result<ArtistRow> {
    Ok(ArtistRow {
        id: row.get(0)?,
        name: row.get(1)?,
        website_base_url: row.get(2)?,
        listing_url: row.get(3)?,
    })
}

/// Exact, case-sensitive lookup.
pub fn find_artist_by_name(conn: &Connection, name: &str) -> Result<Option<ArtistRow>> {
    conn.query_row(
        &format!("SELECT {ARTIST_COLUMNS} FROM artists WHERE name = ?1"),
        params![name],
        artist_from_row,
    )
    .optional()
}

pub fn get_or_create_artist(conn: &Connection, name: &str) -> Result<Upsert<ArtistRow>> {
    let inserted = conn.execute(
        "INSERT INTO artists (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
        params![name],
    )?;
    let row = conn.query_row(
        &format!("SELECT {ARTIST_COLUMNS} FROM artists WHERE name = ?1"),
        params![name],
        artist_from_row,
    )?;
    Ok(if inserted == 1 {
        Upsert::Created(row)
    } else {
        Upsert::Existing(row)
    })
}

/// Case-insensitive partial match on the artist name.
pub fn search_artists(conn: &Connection, query: &str) -> Result<Vec<ArtistRow>> {
    let escaped = query
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let mut stmt = conn.prepare(&format!(
        "SELECT {ARTIST_COLUMNS} FROM artists
         WHERE name LIKE '%' || ?1 || '%' ESCAPE '\\'
         ORDER BY name"
    ))?;
    let rows = stmt
        .query_map(params![escaped], artist_from_row)?
        .collect::<Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn list_artists(conn: &Connection) -> Result<Vec<ArtistRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ARTIST_COLUMNS} FROM artists ORDER BY name"
    ))?;
    let rows = stmt
        .query_map([], artist_from_row)?
        .collect::<Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn set_artist_website(conn: &Connection, artist_id: i64, url: &str) -> Result<()> {
    conn.execute(
        "UPDATE artists SET website_base_url = ?2 WHERE id = ?1",
        params![artist_id, url],
    )?;
    Ok(())
}

pub fn set_artist_listing_url(conn: &Connection, artist_id: i64, url: &str) -> Result<()> {
    conn.execute(
        "UPDATE artists SET listing_url = ?2 WHERE id = ?1",
        params![artist_id, url],
    )?;
    Ok(())
}

/// Artists named in the config, with endpoints that pre-empt lookups.
pub struct ArtistSeed<'a> {
    pub name: &'a str,
    pub website: Option<&'a str>,
    pub listing_url: Option<&'a str>,
}

/// Get-or-create every seed; configured URLs only fill empty columns.
pub fn seed_artists(conn: &Connection, seeds: &[ArtistSeed]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut created = 0;
    for seed in seeds {
        let artist = get_or_create_artist(&tx, seed.name)?;
        if artist.was_created() {
            created += 1;
        }
        let artist = artist.into_inner();
        if let (None, Some(url)) = (&artist.website_base_url, seed.website) {
            set_artist_website(&tx, artist.id, url)?;
        }
        if let (None, Some(url)) = (&artist.listing_url, seed.listing_url) {
            set_artist_listing_url(&tx, artist.id, url)?;
        }
    }
    tx.commit()?;
    Ok(created)
}

// ── Venues ──

#[derive(Debug, Clone, PartialEq)]
pub struct VenueRow {
    pub id: i64,
    pub name: String,
    pub city: String,
    pub state: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
}

pub struct NewVenue<'a> {
    pub name: &'a str,
    pub city: &'a str,
    pub state: Option<&'a str>,
    pub country: Option<&'a str>,
    pub country_code: Option<&'a str>,
}

/// Identity is exactly (name, city); attributes of an existing row are kept.
pub fn get_or_create_venue(conn: &Connection, venue: &NewVenue) -> Result<Upsert<VenueRow>> {
    let inserted = conn.execute(
        "INSERT INTO venues (name, city, state, country, country_code)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(name, city) DO NOTHING",
        params![
            venue.name,
            venue.city,
            venue.state,
            venue.country,
            venue.country_code
        ],
    )?;
    let row = conn.query_row(
        "SELECT id, name, city, state, country, country_code
         FROM venues WHERE name = ?1 AND city = ?2",
        params![venue.name, venue.city],
        |row| {
            Ok(VenueRow {
                id: row.get(0)?,
                name: row.get(1)?,
                city: row.get(2)?,
                state: row.get(3)?,
                country: row.get(4)?,
                country_code: row.get(5)?,
            })
        },
    )?;
    Ok(if inserted == 1 {
        Upsert::Created(row)
    } else {
        Upsert::Existing(row)
    })
}

/// Names of venues this artist has already played, as hints for extraction.
pub fn known_venues_for_artist(conn: &Connection, artist_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT v.name
         FROM concerts c
         JOIN artists a ON a.id = c.artist_id
         JOIN venues v ON v.id = c.venue_id
         WHERE a.name = ?1
         ORDER BY v.name",
    )?;
    let rows = stmt
        .query_map(params![artist_name], |row| row.get(0))?
        .collect::<Result<Vec<_>>>()?;
    Ok(rows)
}

// ── Concerts ──

#[derive(Debug, Clone, PartialEq)]
pub struct ConcertRow {
    pub id: i64,
    pub artist_id: i64,
    pub date: NaiveDate,
    pub city: String,
    pub state: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub venue_id: Option<i64>,
    pub source: String,
}

pub struct NewConcert<'a> {
    pub artist_id: i64,
    pub date: NaiveDate,
    pub city: &'a str,
    pub state: Option<&'a str>,
    pub country: Option<&'a str>,
    pub country_code: Option<&'a str>,
    pub venue_id: Option<i64>,
    pub source: &'a str,
}

fn find_concert(conn: &Connection, artist_id: i64, date: NaiveDate) -> Result<ConcertRow> {
    conn.query_row(
        "SELECT id, artist_id, date, city, state, country, country_code, venue_id, source
         FROM concerts WHERE artist_id = ?1 AND date = ?2",
        params![artist_id, date],
        |row| {
            Ok(ConcertRow {
                id: row.get(0)?,
                artist_id: row.get(1)?,
                date: row.get(2)?,
                city: row.get(3)?,
                state: row.get(4)?,
                country: row.get(5)?,
                country_code: row.get(6)?,
                venue_id: row.get(7)?,
                source: row.get(8)?,
            })
        },
    )
}

/// Identity is (artist, date): an artist plays at most one show per day.
pub fn get_or_create_concert(conn: &Connection, concert: &NewConcert) -> Result<Upsert<ConcertRow>> {
    let inserted = conn.execute(
        "INSERT INTO concerts
         (artist_id, date, city, state, country, country_code, venue_id, source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(artist_id, date) DO NOTHING",
        params![
            concert.artist_id,
            concert.date,
            concert.city,
            concert.state,
            concert.country,
            concert.country_code,
            concert.venue_id,
            concert.source,
        ],
    )?;
    let row = find_concert(conn, concert.artist_id, concert.date)?;
    Ok(if inserted == 1 {
        Upsert::Created(row)
    } else {
        Upsert::Existing(row)
    })
}

/// Rewrites the location fields of an existing concert. Returns false when
/// nothing differed.
pub fn update_concert_details(conn: &Connection, id: i64, concert: &NewConcert) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE concerts
         SET city = ?2, state = ?3, country = ?4, country_code = ?5,
             venue_id = COALESCE(?6, venue_id), source = ?7, updated_at = datetime('now')
         WHERE id = ?1
           AND (city IS NOT ?2 OR state IS NOT ?3 OR country IS NOT ?4
                OR country_code IS NOT ?5
                OR (?6 IS NOT NULL AND venue_id IS NOT ?6))",
        params![
            id,
            concert.city,
            concert.state,
            concert.country,
            concert.country_code,
            concert.venue_id,
            concert.source,
        ],
    )?;
    Ok(changed == 1)
}

// ── Page cache ──

#[derive(Debug, Clone, PartialEq)]
pub struct PageCacheRow {
    pub url: String,
    pub content_hash: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_changed_at: Option<DateTime<Utc>>,
}

fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn get_page_cache(conn: &Connection, url: &str) -> Result<Option<PageCacheRow>> {
    conn.query_row(
        "SELECT url, content_hash, last_fetched_at, last_changed_at
         FROM page_cache WHERE url = ?1",
        params![url],
        |row| {
            Ok(PageCacheRow {
                url: row.get(0)?,
                content_hash: row.get(1)?,
                last_fetched_at: parse_timestamp(row.get(2)?),
                last_changed_at: parse_timestamp(row.get(3)?),
            })
        },
    )
    .optional()
}

/// Records a fetch of `url` and returns the fingerprint stored before it.
pub fn touch_page_cache(conn: &Connection, url: &str, now: DateTime<Utc>) -> Result<Option<String>> {
    conn.execute(
        "INSERT INTO page_cache (url, last_fetched_at) VALUES (?1, ?2)
         ON CONFLICT(url) DO UPDATE SET last_fetched_at = excluded.last_fetched_at",
        params![url, now.to_rfc3339()],
    )?;
    conn.query_row(
        "SELECT content_hash FROM page_cache WHERE url = ?1",
        params![url],
        |row| row.get(0),
    )
}

pub fn store_page_hash(conn: &Connection, url: &str, hash: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE page_cache SET content_hash = ?2, last_changed_at = ?3 WHERE url = ?1",
        params![url, hash, now.to_rfc3339()],
    )?;
    Ok(())
}

pub fn clear_page_hash(conn: &Connection, url: &str) -> Result<()> {
    conn.execute(
        "UPDATE page_cache SET content_hash = NULL WHERE url = ?1",
        params![url],
    )?;
    Ok(())
}

// ── Listing ──

pub struct ConcertListing {
    pub artist: String,
    pub date: NaiveDate,
    pub city: String,
    pub country: String,
    pub venue: String,
    pub source: String,
}

pub fn fetch_concerts(
    conn: &Connection,
    artist: Option<&str>,
    from: Option<NaiveDate>,
    limit: usize,
) -> Result<Vec<ConcertListing>> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(a) = artist {
        conditions.push(format!("a.name = ?{}", params.len() + 1));
        params.push(Box::new(a.to_string()));
    }
    if let Some(d) = from {
        conditions.push(format!("c.date >= ?{}", params.len() + 1));
        params.push(Box::new(d));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT a.name, c.date, c.city, COALESCE(c.country, ''),
                COALESCE(v.name, ''), c.source
         FROM concerts c
         JOIN artists a ON a.id = c.artist_id
         LEFT JOIN venues v ON v.id = c.venue_id{}
         ORDER BY c.date, a.name
         LIMIT {}",
        where_clause, limit
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(ConcertListing {
                artist: row.get(0)?,
                date: row.get(1)?,
                city: row.get(2)?,
                country: row.get(3)?,
                venue: row.get(4)?,
                source: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub artists: usize,
    pub venues: usize,
    pub concerts: usize,
    pub upcoming: usize,
    pub cached_pages: usize,
}

pub fn get_stats(conn: &Connection, today: NaiveDate) -> Result<Stats> {
    let artists: usize = conn.query_row("SELECT COUNT(*) FROM artists", [], |r| r.get(0))?;
    let venues: usize = conn.query_row("SELECT COUNT(*) FROM venues", [], |r| r.get(0))?;
    let concerts: usize = conn.query_row("SELECT COUNT(*) FROM concerts", [], |r| r.get(0))?;
    let upcoming: usize = conn.query_row(
        "SELECT COUNT(*) FROM concerts WHERE date >= ?1",
        params![today],
        |r| r.get(0),
    )?;
    let cached_pages: usize =
        conn.query_row("SELECT COUNT(*) FROM page_cache", [], |r| r.get(0))?;
    Ok(Stats {
        artists,
        venues,
        concerts,
        upcoming,
        cached_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = connect_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = conn();
        init_schema(&conn).unwrap();
        let tables: usize = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn artist_get_or_create() {
        let conn = conn();
        let first = get_or_create_artist(&conn, "Men I Trust").unwrap();
        let second = get_or_create_artist(&conn, "Men I Trust").unwrap();
        assert!(first.was_created());
        assert!(!second.was_created());
        assert_eq!(first.get().id, second.get().id);

        // Equality is case-sensitive.
        let other = get_or_create_artist(&conn, "men i trust").unwrap();
        assert!(other.was_created());
    }

    #[test]
    fn artist_search_is_case_insensitive_partial() {
        let conn = conn();
        get_or_create_artist(&conn, "Men I Trust").unwrap();
        get_or_create_artist(&conn, "Khruangbin").unwrap();
        let hits = search_artists(&conn, "i trust").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "Men I Trust");
        assert!(search_artists(&conn, "100%").unwrap().is_empty());
    }

    #[test]
    fn venue_identity_is_name_and_city() {
        let conn = conn();
        let venue = |city| NewVenue {
            name: "The Forum",
            city,
            state: None,
            country: None,
            country_code: None,
        };
        let la = get_or_create_venue(&conn, &venue("Los Angeles")).unwrap();
        let london = get_or_create_venue(&conn, &venue("London")).unwrap();
        let la_again = get_or_create_venue(&conn, &venue("Los Angeles")).unwrap();
        assert!(la.was_created());
        assert!(london.was_created());
        assert!(!la_again.was_created());
        assert_ne!(la.get().id, london.get().id);
        assert_eq!(la.get().id, la_again.get().id);
    }

    #[test]
    fn venue_attributes_are_first_write_wins() {
        let conn = conn();
        let mut venue = NewVenue {
            name: "Le Ritz PDB",
            city: "Montreal",
            state: Some("QC"),
            country: Some("Canada"),
            country_code: Some("CA"),
        };
        get_or_create_venue(&conn, &venue).unwrap();
        venue.country = Some("Quebec");
        let again = get_or_create_venue(&conn, &venue).unwrap().into_inner();
        assert_eq!(again.country.as_deref(), Some("Canada"));
    }

    #[test]
    fn concert_identity_is_artist_and_date() {
        let conn = conn();
        let artist = get_or_create_artist(&conn, "Men I Trust").unwrap().into_inner();
        let mut concert = NewConcert {
            artist_id: artist.id,
            date: date(2024, 9, 10),
            city: "Paris",
            state: None,
            country: Some("France"),
            country_code: Some("FR"),
            venue_id: None,
            source: "https://menitrust.com/tour",
        };
        assert!(get_or_create_concert(&conn, &concert).unwrap().was_created());

        concert.city = "Lyon";
        let again = get_or_create_concert(&conn, &concert).unwrap();
        assert!(!again.was_created());
        assert_eq!(again.get().city, "Paris");

        assert!(update_concert_details(&conn, again.get().id, &concert).unwrap());
        assert!(!update_concert_details(&conn, again.get().id, &concert).unwrap());
    }

    #[test]
    fn page_cache_touch_and_store() {
        let conn = conn();
        let now = Utc::now();
        assert_eq!(touch_page_cache(&conn, "https://a.com", now).unwrap(), None);
        store_page_hash(&conn, "https://a.com", "abc", now).unwrap();
        assert_eq!(
            touch_page_cache(&conn, "https://a.com", now).unwrap().as_deref(),
            Some("abc")
        );
        clear_page_hash(&conn, "https://a.com").unwrap();
        let row = get_page_cache(&conn, "https://a.com").unwrap().unwrap();
        assert_eq!(row.content_hash, None);
        assert!(row.last_fetched_at.is_some());
    }

    #[test]
    fn seeding_fills_only_empty_endpoints() {
        let conn = conn();
        let artist = get_or_create_artist(&conn, "Men I Trust").unwrap().into_inner();
        set_artist_website(&conn, artist.id, "https://menitrust.com/").unwrap();

        let created = seed_artists(
            &conn,
            &[
                ArtistSeed {
                    name: "Men I Trust",
                    website: Some("https://elsewhere.example/"),
                    listing_url: Some("https://www.songkick.com/artists/1-men-i-trust/calendar"),
                },
                ArtistSeed {
                    name: "Khruangbin",
                    website: None,
                    listing_url: None,
                },
            ],
        )
        .unwrap();
        assert_eq!(created, 1);

        let artist = find_artist_by_name(&conn, "Men I Trust").unwrap().unwrap();
        assert_eq!(artist.website_base_url.as_deref(), Some("https://menitrust.com/"));
        assert!(artist.listing_url.is_some());
    }

    #[test]
    fn listing_filters_by_artist_and_date() {
        let conn = conn();
        let artist = get_or_create_artist(&conn, "Men I Trust").unwrap().into_inner();
        for (d, city) in [(date(2024, 1, 5), "Berlin"), (date(2024, 6, 5), "Oslo")] {
            get_or_create_concert(
                &conn,
                &NewConcert {
                    artist_id: artist.id,
                    date: d,
                    city,
                    state: None,
                    country: None,
                    country_code: None,
                    venue_id: None,
                    source: "test",
                },
            )
            .unwrap();
        }
        let rows = fetch_concerts(&conn, Some("Men I Trust"), Some(date(2024, 3, 1)), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].city, "Oslo");

        let stats = get_stats(&conn, date(2024, 3, 1)).unwrap();
        assert_eq!(stats.concerts, 2);
        assert_eq!(stats.upcoming, 1);
    }
}
