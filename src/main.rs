use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use streakline::config::{self, Config};
use streakline::utils::{self, NumberFormatOptions, WatchCommand};
use streakline::{
    Clock, EffectiveStats, HttpItemProvider, Scope, StatsService, SystemClock, WindowClassifier,
    logging,
};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "streakline")]
#[command(version)]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use comma-separated number formatting
    #[arg(long, global = true)]
    number_comma: bool,

    /// Locale for number formatting (en, de, fr, es, it, ja, ko, zh)
    #[arg(long, global = true)]
    locale: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and print the current stats for a user
    Stats(StatsArgs),
    /// Track a user's stats while applying mutations read from stdin
    Watch(WatchArgs),
    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct StatsArgs {
    /// User whose stats to load
    #[arg(long)]
    user: String,

    /// Output stats as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Pretty-print JSON instead of a single line
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

#[derive(Args)]
struct WatchArgs {
    /// User whose stats to track
    #[arg(long)]
    user: String,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    subcommand: ConfigSubcommands,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Create default configuration file
    Init {
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Show current configuration
    Show,
    /// Set configuration value
    Set {
        /// Configuration key (api-token, server-url, ttl-short, ttl-default, window-anchor,
        /// timezone, family, favorite-window-days, number-comma, locale)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();

    // Load config file to get defaults
    let config = match Config::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Config error: {e:#}");
            std::process::exit(1);
        }
    };

    // Config defaults, then CLI overrides
    let mut format_options = NumberFormatOptions::from(&config.formatting);
    format_options.use_comma |= cli.number_comma;
    if let Some(locale) = cli.locale {
        format_options.locale = locale;
    }

    match cli.command {
        Commands::Stats(args) => {
            if let Err(e) = run_stats(&config, args, &format_options).await {
                eprintln!("Error loading stats: {e:#}");
                std::process::exit(1);
            }
        }
        Commands::Watch(args) => {
            if let Err(e) = run_watch(&config, args, format_options).await {
                eprintln!("Error: {e:#}");
                std::process::exit(1);
            }
        }
        Commands::Config(config_args) => {
            handle_config_subcommand(config_args);
        }
    }
}

fn build_service(config: &Config) -> Result<StatsService> {
    let settings = config.engine_settings()?;
    let provider = HttpItemProvider::new(&config.server.url, config.server.api_token.clone())
        .context("Failed to set up the stats provider")?;
    Ok(StatsService::new(settings, Arc::new(provider)))
}

fn print_stats(classifier: &WindowClassifier, stats: &EffectiveStats, options: &NumberFormatOptions) {
    let now = SystemClock.now();
    println!(
        "{}",
        utils::render_stats(
            stats,
            classifier.window_key(now),
            classifier.day_key(now),
            options
        )
    );
}

async fn run_stats(config: &Config, args: StatsArgs, options: &NumberFormatOptions) -> Result<()> {
    let service = build_service(config)?;
    service.start_session(Scope::new(args.user));
    let stats = service.load().await?;

    if args.json {
        let json = if args.pretty {
            simd_json::to_string_pretty(&stats)?
        } else {
            simd_json::to_string(&stats)?
        };
        println!("{json}");
    } else {
        print_stats(service.classifier(), &stats, options);
    }

    Ok(())
}

async fn run_watch(config: &Config, args: WatchArgs, options: NumberFormatOptions) -> Result<()> {
    let service = build_service(config)?;
    service.start_session(Scope::new(args.user));

    if let Err(e) = service.load().await {
        eprintln!("Warning: initial load failed, starting from zero: {e:#}");
    }
    print_stats(service.classifier(), &service.effective_stats(), &options);

    let classifier = *service.classifier();
    let id = service.subscribe(move |stats| {
        println!();
        print_stats(&classifier, stats, &options);
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match utils::parse_watch_command(&line) {
            Ok(WatchCommand::Mutation(event)) => {
                service.notify_mutation(event)?;
            }
            Ok(WatchCommand::Refresh) => {
                service.invalidate_all();
                if let Err(e) = service.refresh().await {
                    eprintln!("Refresh failed: {e:#}");
                }
            }
            Ok(WatchCommand::Quit) => break,
            Err(e) => eprintln!("{e:#}"),
        }
    }

    service.unsubscribe(id);
    service.end_session();
    Ok(())
}

fn handle_config_subcommand(config_args: ConfigArgs) {
    match config_args.subcommand {
        ConfigSubcommands::Init { overwrite } => {
            if let Err(e) = config::create_default_config(overwrite) {
                eprintln!("Error creating config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Show => {
            if let Err(e) = config::show_config() {
                eprintln!("Error showing config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Set { key, value } => {
            if let Err(e) = config::set_config_value(&key, &value) {
                eprintln!("Error setting config: {e}");
                std::process::exit(1);
            }
        }
    }
}
