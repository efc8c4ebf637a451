use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};

use concert_checker::config::{AppConfig, DEFAULT_CONFIG_PATH};
use concert_checker::db::{self, Db};
use concert_checker::pipeline::{PairingStatus, Pipeline, RunSummary};
use concert_checker::sources::SourceKind;

#[derive(Parser)]
#[command(name = "concert_checker", about = "Concert dates from artist sites, listings and mail")]
struct Cli {
    /// Config file (missing file means defaults)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema and seed the configured artists
    Init,
    /// Track an artist (no-op if already tracked)
    AddArtist {
        name: String,
        /// Official website, skips the lookup
        #[arg(long)]
        website: Option<String>,
        /// Listings page, skips the lookup
        #[arg(long)]
        listing: Option<String>,
    },
    /// Fetch, extract and merge new shows
    Run {
        /// Only these artists (registered if new); default: all tracked
        #[arg(short, long)]
        artist: Vec<String>,
        /// Only these sources; default: from config
        #[arg(short, long, value_enum)]
        source: Vec<SourceKind>,
    },
    /// List stored concerts
    Concerts {
        #[arg(short, long)]
        artist: Option<String>,
        /// Include past concerts
        #[arg(long)]
        all: bool,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let today = Local::now().date_naive();

    let open = |config: &AppConfig| {
        Db::open(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))
    };

    let result = match cli.command {
        Commands::Init => {
            let store = open(&config)?;
            let created = store.with(|c| db::seed_artists(c, &config.artist_seeds()))?;
            println!(
                "Store ready at {} ({} configured artists, {} new)",
                config.database_path.display(),
                config.artists.len(),
                created
            );
            Ok(())
        }
        Commands::AddArtist {
            name,
            website,
            listing,
        } => {
            let store = open(&config)?;
            let seed = db::ArtistSeed {
                name: name.trim(),
                website: website.as_deref(),
                listing_url: listing.as_deref(),
            };
            let created = store.with(|c| db::seed_artists(c, &[seed]))?;
            if created > 0 {
                println!("Tracking {}", name.trim());
            } else {
                println!("Already tracking {}", name.trim());
            }
            Ok(())
        }
        Commands::Run { artist, source } => {
            if !source.is_empty() {
                config.pipeline.sources = source;
                config.validate()?;
            }
            let store = open(&config)?;
            store.with(|c| db::seed_artists(c, &config.artist_seeds()))?;

            let pipeline = Pipeline::from_config(&config, store)
                .context("setting up the pipeline")?
                .with_progress(true);
            let artists = (!artist.is_empty()).then_some(artist);
            let summary = pipeline.run(artists.as_deref(), today).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Concerts { artist, all, limit } => {
            let store = open(&config)?;
            let from = (!all).then_some(today);
            let rows =
                store.with(|c| db::fetch_concerts(c, artist.as_deref(), from, limit))?;
            if rows.is_empty() {
                println!("No concerts found.");
                return Ok(());
            }

            println!(
                "{:<10} | {:<24} | {:<20} | {:<14} | {:<24}",
                "Date", "Artist", "City", "Country", "Venue"
            );
            println!("{}", "-".repeat(102));
            for r in &rows {
                println!(
                    "{:<10} | {:<24} | {:<20} | {:<14} | {:<24}",
                    r.date.to_string(),
                    truncate(&r.artist, 24),
                    truncate(&r.city, 20),
                    truncate(&r.country, 14),
                    truncate(&r.venue, 24)
                );
            }
            println!("\n{} concerts", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let store = open(&config)?;
            let s = store.with(|c| db::get_stats(c, today))?;
            println!("Artists:   {}", s.artists);
            println!("Venues:    {}", s.venues);
            println!("Concerts:  {}", s.concerts);
            println!("Upcoming:  {}", s.upcoming);
            println!("Pages:     {}", s.cached_pages);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn print_summary(summary: &RunSummary) {
    if summary.outcomes.is_empty() {
        println!("Nothing to run. Add artists with 'add-artist' or in the config.");
        return;
    }

    println!(
        "{:<24} | {:<10} | {:>7} | {:>8} | {:>7} | {:>7} | {:<30}",
        "Artist", "Source", "Created", "Existing", "Updated", "Skipped", "Problems"
    );
    println!("{}", "-".repeat(110));
    for o in &summary.outcomes {
        let artist = truncate(&o.artist, 24);
        match &o.status {
            PairingStatus::Completed {
                report, failures, ..
            } => {
                let problems = failures
                    .first()
                    .map(|(what, e)| {
                        let more = failures.len() - 1;
                        let first = truncate(&format!("{}: {}", what, e), 30);
                        if more > 0 {
                            format!("{} (+{})", first, more)
                        } else {
                            first
                        }
                    })
                    .unwrap_or_default();
                println!(
                    "{:<24} | {:<10} | {:>7} | {:>8} | {:>7} | {:>7} | {:<30}",
                    artist,
                    o.source.to_string(),
                    report.created,
                    report.already_existed,
                    report.updated,
                    report.skipped_unparseable_date,
                    problems
                );
            }
            PairingStatus::Failed(e) => {
                println!(
                    "{:<24} | {:<10} | {:>7} | {:>8} | {:>7} | {:>7} | {:<30}",
                    artist,
                    o.source.to_string(),
                    "-",
                    "-",
                    "-",
                    "-",
                    truncate(&e.to_string(), 30)
                );
            }
        }
    }

    let totals = summary.totals();
    println!(
        "\n{} artists | {} candidates: {} new, {} existing, {} updated, {} unparseable dates | {} new venues | {} failed, {} partial failures",
        summary.artists,
        totals.candidates_seen(),
        totals.created,
        totals.already_existed,
        totals.updated,
        totals.skipped_unparseable_date,
        totals.venues_created,
        summary.failed(),
        summary.partial_failures()
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
