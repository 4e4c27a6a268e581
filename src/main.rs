//! crossref-bot pipeline entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > RUST_LOG > config)
//!   4. Init logger once
//!   5. Build candidate sources for the enabled producers
//!   6. Open registry + backup sink, run coordinator setup
//!   7. Spawn Ctrl-C → shutdown signal watcher
//!   8. Run the pipeline until shutdown or a fatal task error

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crossref_bot::config::{self, Config};
use crossref_bot::coordinator::{Coordinator, Sources};
use crossref_bot::error::AppError;
use crossref_bot::logger::{self, LevelOrigin};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present; the file is optional.
    let _ = dotenvy::dotenv();

    let args = match parse_cli_args(std::env::args().skip(1)) {
        Ok(CliAction::Run(args)) => args,
        Ok(CliAction::Help) => {
            println!("{USAGE}");
            return Ok(());
        }
        Ok(CliAction::Version) => {
            println!("crossref-bot {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Err(msg) => return Err(AppError::Config(format!("{msg}\n\n{USAGE}"))),
    };

    let config = config::load(args.config_path.as_deref())?;

    let (effective_log_level, origin) = match args.log_level() {
        Some(level) => (level, LevelOrigin::Cli),
        None => (config.log_level.as_str(), LevelOrigin::Config),
    };

    logger::init(effective_log_level, origin)?;

    info!(
        pipeline = %config.name,
        work_dir = %config.work_dir.display(),
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    let sources = build_sources(&config)?;
    print_startup_summary(&config, &sources);

    let mut coordinator = Coordinator::open(config, sources)?;
    coordinator.setup().await?;

    // Ctrl-C handler cancels the token so the coordinator shuts down.
    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    coordinator.run(shutdown).await
}

fn build_sources(config: &Config) -> Result<Sources, AppError> {
    let mut sources = Sources::default();

    if config.episodes.enabled {
        #[cfg(feature = "source-feed")]
        {
            use crossref_bot::subsystems::sources::{feed::FeedSource, http_client};
            let client = http_client(&config.threads.user_agent)?;
            sources.episodes = Some(Box::new(FeedSource::new(client, &config.episodes.feed_url)));
        }
        #[cfg(not(feature = "source-feed"))]
        warn!("episodes enabled but built without the source-feed feature");
    }

    if config.threads.enabled {
        #[cfg(feature = "source-subreddit")]
        {
            use crossref_bot::subsystems::sources::{http_client, subreddit::SubredditSource};
            let client = http_client(&config.threads.user_agent)?;
            sources.threads = Some(Box::new(SubredditSource::new(
                client,
                &config.threads.subreddit,
                config.threads.listing_interval,
            )));
        }
        #[cfg(not(feature = "source-subreddit"))]
        warn!("threads enabled but built without the source-subreddit feature");
    }

    if sources.episodes.is_none() && sources.threads.is_none() {
        warn!("no producers configured, only backups will run");
    }
    Ok(sources)
}

fn print_startup_summary(config: &Config, sources: &Sources) {
    let status = |source: &Option<Box<dyn crossref_bot::subsystems::sources::CandidateSource>>| {
        source.as_ref().map(|s| s.label().to_string()).unwrap_or_else(|| "disabled".into())
    };
    info!(
        episodes = %status(&sources.episodes),
        threads = %status(&sources.threads),
        database = %config.database.display(),
        backup = %config.backup.path.display(),
        backup_every_secs = config.backup.interval.as_secs(),
        "pipeline configured"
    );
}

const USAGE: &str = "\
Usage: crossref-bot [OPTIONS]

Cross-references podcast episodes with subreddit threads.

Options:
  -f, --config <PATH>   Config file (default: config/default.toml)
  -v, --verbose         Raise log verbosity; repeat (-vv, -vvv) for more
  -V, --version         Print version
  -h, --help            Print help";

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    verbosity: u8,
    config_path: Option<String>,
}

impl CliArgs {
    /// `-v` is warn, `-vv` info, `-vvv` debug, more is trace.
    fn log_level(&self) -> Option<&'static str> {
        match self.verbosity {
            0 => None,
            1 => Some("warn"),
            2 => Some("info"),
            3 => Some("debug"),
            _ => Some("trace"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CliAction {
    Run(CliArgs),
    Help,
    Version,
}

fn parse_cli_args(args: impl IntoIterator<Item = String>) -> Result<CliAction, String> {
    let mut parsed = CliArgs::default();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliAction::Help),
            "-V" | "--version" => return Ok(CliAction::Version),
            "-f" | "--config" => {
                let path = iter.next().ok_or_else(|| format!("{arg} needs a path"))?;
                parsed.config_path = Some(path);
            }
            "--verbose" => parsed.verbosity = parsed.verbosity.saturating_add(1),
            a if a.len() > 1 && a.starts_with('-') && a[1..].bytes().all(|b| b == b'v') => {
                let n = u8::try_from(a.len() - 1).unwrap_or(u8::MAX);
                parsed.verbosity = parsed.verbosity.saturating_add(n);
            }
            a => {
                if let Some(path) = a.strip_prefix("--config=") {
                    parsed.config_path = Some(path.to_string());
                } else {
                    return Err(format!("unexpected argument '{a}'"));
                }
            }
        }
    }

    Ok(CliAction::Run(parsed))
}
