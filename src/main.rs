use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use scrobble_match::config::{HttpConfig, LastFmConfig};
use scrobble_match::decision::{ConsolePrompt, DecisionSurface};
use scrobble_match::engine::{MatchOptions, Reconciler};
use scrobble_match::lastfm::{HistorySource, LastFmClient, PlayHistory};
use scrobble_match::logging::{init_logging, LoggingConfig};
use scrobble_match::models::{MatchStatus, PlayRecord};
use scrobble_match::progress::{create_progress_bar, create_spinner, log_progress, set_log_only};
use scrobble_match::safety::validate_store_path;
use scrobble_match::scoring::{MIN_OVERLAP, MIN_RATIO_ALL, MIN_RATIO_EACH};
use scrobble_match::store::CandidateStore;
use scrobble_match::Error;

#[derive(Parser)]
#[command(name = "scrobble-match")]
#[command(about = "Match Last.fm scrobbles to Navidrome library tracks and sync play counts")]
struct Cli {
    /// Last.fm user name
    #[arg(short, long)]
    user: String,

    /// Scrobble store (default: scrobbles_<user>.db)
    #[arg(long)]
    store: Option<PathBuf>,

    #[arg(long, env = "LASTFM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "LASTFM_API_BASE")]
    api_base: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Hide progress bars, log progress instead
    #[arg(long)]
    log_only: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show statistics of saved scrobbles
    Info {
        /// Path to the Navidrome database
        #[arg(long, alias = "database")]
        library: PathBuf,
    },

    /// Fetch and save scrobbles from Last.fm, newest first
    #[command(alias = "get-scrobbles")]
    Fetch {
        /// Start from this page of results
        #[arg(short, long, default_value_t = 1)]
        page: u32,

        /// Don't stop at the first scrobble that is already saved
        #[arg(short, long)]
        greedy: bool,
    },

    /// Match unmatched library tracks with saved scrobbles
    #[command(alias = "match-scrobbles")]
    Match(MatchArgs),

    /// Raise Navidrome play counts from matched scrobbles
    UpdateCounts {
        #[arg(long, alias = "database")]
        library: PathBuf,

        /// Navidrome user to update (default: the only user)
        #[arg(long)]
        library_user: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(clap::Args)]
struct MatchArgs {
    #[arg(long, alias = "database")]
    library: PathBuf,

    /// Ask about uncertain matches
    #[arg(long)]
    resolve: bool,

    /// Only use identifier and exact matches
    #[arg(long)]
    no_fuzzy: bool,

    #[arg(long, default_value_t = MIN_RATIO_ALL)]
    min_ratio_all: f64,

    #[arg(long, default_value_t = MIN_RATIO_EACH)]
    min_ratio_each: f64,

    #[arg(long, default_value_t = MIN_OVERLAP)]
    min_overlap: usize,

    /// Strip diacritics before comparing
    #[arg(long)]
    fold_accents: bool,

    /// Write the batch summary as JSON
    #[arg(long)]
    stats_json: Option<PathBuf>,
}

impl MatchArgs {
    fn options(&self) -> MatchOptions {
        MatchOptions {
            fuzzy: !self.no_fuzzy,
            min_ratio_all: self.min_ratio_all,
            min_ratio_each: self.min_ratio_each,
            min_overlap: self.min_overlap,
            fold_accents: self.fold_accents,
        }
    }
}

fn store_path(cli: &Cli) -> PathBuf {
    cli.store
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("scrobbles_{}.db", cli.user)))
}

fn open_store(cli: &Cli, library: Option<&Path>) -> Result<CandidateStore> {
    let path = store_path(cli);
    validate_store_path(&path, library)?;
    let store = match library {
        Some(library) => CandidateStore::open(&path, library),
        None => CandidateStore::open_history(&path),
    };
    store.with_context(|| format!("Failed to open scrobble store {}", path.display()))
}

fn lastfm_client(cli: &Cli) -> Result<LastFmClient> {
    let cfg = LastFmConfig::new(&cli.user, cli.api_key.as_deref(), cli.api_base.as_deref())?;
    Ok(LastFmClient::new(HttpConfig::default(), cfg)?)
}

fn play_line(record: &PlayRecord) -> String {
    let when = chrono::DateTime::from_timestamp(record.timestamp, 0)
        .map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|| record.timestamp.to_string());
    format!("{} {}", when, record.track)
}

fn confirm(question: &str) -> bool {
    print!("{question} [y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => matches!(line.trim(), "y" | "Y" | "yes"),
        Err(_) => false,
    }
}

fn cmd_info(cli: &Cli, library: &Path) -> Result<()> {
    let store = open_store(cli, Some(library))?;
    let mut client = lastfm_client(cli)?;
    let user = client.user_info().context("Failed to fetch user info")?;

    println!("{:15}\t{}", "User", user.name);
    println!(
        "{:15}\t{} (local) / {} (last.fm)",
        "Scrobbles",
        store.count_play_events()?,
        user.play_count
    );
    println!(
        "{:15}\t{} (local) / {} (last.fm)",
        "Tracks",
        store.count_remote_tracks()?,
        user.track_count
    );
    println!("{:15}\t{}", "Match links", store.count_matches()?);
    println!("{} unmatched Navidrome tracks", store.count_unmatched()?);
    Ok(())
}

fn cmd_fetch(cli: &Cli, page: u32, greedy: bool) -> Result<()> {
    let store = open_store(cli, None)?;
    let mut client = lastfm_client(cli)?;
    let spinner = create_spinner("Fetching scrobbles");

    let (mut added, mut known, mut malformed) = (0usize, 0usize, 0usize);
    let mut history = PlayHistory::new(&mut client, page);
    while let Some(item) = history.next() {
        if let Some((page, total)) = history.position {
            spinner.set_message(format!("Fetching scrobbles (page {page}/{total})"));
        }
        match item {
            Ok(record) => {
                if store.ingest_play(&record)? {
                    added += 1;
                    spinner.suspend(|| println!("{}", play_line(&record)));
                } else if greedy {
                    known += 1;
                } else {
                    info!("Reached a saved scrobble, stopping. Use --greedy to continue");
                    break;
                }
            }
            Err(e @ Error::MalformedRecord { kind: "track", .. }) => {
                warn!(error = %e, "Skipping malformed scrobble");
                malformed += 1;
            }
            Err(e) => {
                spinner.finish_and_clear();
                return Err(e).context("Failed to fetch scrobbles");
            }
        }
    }

    spinner.finish_with_message(format!("Saved {added} new scrobbles"));
    info!(added, known, malformed, "Fetch finished");
    Ok(())
}

fn cmd_match(cli: &Cli, args: &MatchArgs) -> Result<()> {
    let store = open_store(cli, Some(&args.library))?;
    let reconciler = Reconciler::new(&store, args.options());

    let total = store.count_unmatched()? as u64;
    info!(total, "Matching unmatched library tracks");
    let pb = create_progress_bar(total, "Matching", args.resolve);

    let stdin = io::stdin();
    let mut prompt = ConsolePrompt::new(stdin.lock(), io::stdout());
    let surface: Option<&mut dyn DecisionSurface> = if args.resolve {
        Some(&mut prompt as &mut dyn DecisionSurface)
    } else {
        None
    };

    let mut done = 0u64;
    let summary = reconciler.run_batch(surface, |local, result| {
        done += 1;
        pb.inc(1);
        log_progress("match", done, total, 100);
        if let Ok(outcome) = result {
            if outcome.status == MatchStatus::ChoiceRequired && !args.resolve {
                info!(local = %local, "Uncertain match, run with --resolve");
            }
        }
    });
    pb.finish_and_clear();

    println!("\n{:=<60}", "");
    println!("Matching complete!");
    println!("  Processed:        {}", summary.processed);
    println!("  Matched:          {} ({:.1}%)", summary.matched, summary.match_rate());
    println!("  Need a decision:  {}", summary.choice_required);
    println!("  Not matched:      {} ({} rejected)", summary.no_match, summary.rejected);
    println!("  Errors:           {}", summary.errors);
    println!("{:=<60}", "");

    if let Some(path) = &args.stats_json {
        summary
            .write_to_file(path)
            .with_context(|| format!("Failed to write stats to {}", path.display()))?;
        info!(path = %path.display(), "Wrote batch summary");
    }
    Ok(())
}

fn cmd_update_counts(
    cli: &Cli,
    library: &Path,
    library_user: Option<&str>,
    yes: bool,
) -> Result<()> {
    let store = open_store(cli, Some(library))?;
    let user = store.library_user(library_user)?;
    info!(user = %user.user_name, "Computing play counts");

    let report = store.sync_play_counts(&user.id, |changes| {
        for c in changes {
            info!(
                track = %c.local_track_id,
                play_count = c.play_count,
                play_date = %c.play_date,
                "Play count change"
            );
        }
        yes || confirm(&format!(
            "Update {} play counts for Navidrome user {}?",
            changes.len(),
            user.user_name
        ))
    })?;

    if report.changes.is_empty() {
        println!("Play counts already up to date");
    } else if report.committed {
        println!("Updated {} play counts", report.changes.len());
    } else {
        println!("Aborted, nothing written");
    }
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_logging(&LoggingConfig {
        json: cli.log_json,
        verbosity: cli.verbose,
    });
    set_log_only(cli.log_only || cli.log_json);

    let start = Instant::now();
    match &cli.command {
        Command::Info { library } => cmd_info(&cli, library)?,
        Command::Fetch { page, greedy } => cmd_fetch(&cli, *page, *greedy)?,
        Command::Match(args) => cmd_match(&cli, args)?,
        Command::UpdateCounts {
            library,
            library_user,
            yes,
        } => cmd_update_counts(&cli, library, library_user.as_deref(), *yes)?,
    }
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "Done");
    Ok(())
}
