mod commands;
mod output;

use std::path::PathBuf;

use aether_core::config::{self, TrackerConfig};
use clap::{Parser, Subcommand};
use miette::Result;
use tracing::info;

use crate::output::Output;

#[derive(Parser)]
#[command(name = "aether")]
#[command(about = "Offline-resilient location sharing for tracking rooms")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only print warnings and final JSON output
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a position trace through a live room session
    Simulate {
        /// JSON-lines trace, one sample (or sensor fault) per line
        #[arg(long, short = 't')]
        trace: PathBuf,
        /// Room to join instead of creating one
        #[arg(long)]
        room: Option<String>,
        /// Drop the link after this many samples
        #[arg(long)]
        drop_at: Option<usize>,
        /// Restore the link after this many samples
        #[arg(long)]
        restore_at: Option<usize>,
        /// Add an observer that follows the traced agent
        #[arg(long)]
        follow: bool,
        /// Print the final session snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect the durable transmission buffer
    Buffer {
        #[command(subcommand)]
        cmd: BufferCommands,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
    /// Look up the coordinates of a place
    #[cfg(feature = "http")]
    Geocode {
        /// Free-text place query
        query: String,
    },
    /// Route between two points
    #[cfg(feature = "http")]
    Route {
        #[arg(allow_hyphen_values = true)]
        from_lat: f64,
        #[arg(allow_hyphen_values = true)]
        from_lng: f64,
        #[arg(allow_hyphen_values = true)]
        to_lat: f64,
        #[arg(allow_hyphen_values = true)]
        to_lng: f64,
    },
}

#[derive(Subcommand)]
enum BufferCommands {
    /// Show how many samples are waiting
    Status,
    /// List waiting samples, oldest first
    Show {
        #[arg(short = 'l', long)]
        limit: Option<usize>,
    },
    /// Discard every waiting sample
    Clear,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write the effective configuration to a file
    Init {
        /// Target file (defaults to the user config location)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .rgb_colors(miette::RgbColors::Preferred)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))?;
    miette::set_panic_hook();
    let cli = Cli::parse();

    // Initialize tracing with file logging
    use tracing_appender::rolling;
    use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aether")
        .join("logs");
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = rolling::daily(&log_dir, "aether.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = if cli.debug {
        EnvFilter::new("aether_core=debug,aether_cli=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("aether_core=info,aether_cli=info,warn"))
    };

    let terminal_layer = if cli.debug {
        fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .pretty()
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .compact()
            .boxed()
    };

    let file_layer = fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(terminal_layer.with_filter(env_filter))
        .with(file_layer.with_filter(EnvFilter::new("aether_core=debug,aether_cli=debug,info")))
        .init();

    info!(
        "Logging initialized. Logs are being written to: {:?}",
        log_dir.join("aether.log")
    );

    let config = if let Some(config_path) = &cli.config {
        info!("Loading config from: {:?}", config_path);
        config::load_config(config_path).await?
    } else {
        config::load_config_from_standard_locations().await?
    };

    let output = Output::new(cli.quiet);
    run(cli.command, config, &output).await
}

async fn run(command: Commands, config: TrackerConfig, output: &Output) -> Result<()> {
    match command {
        Commands::Simulate {
            trace,
            room,
            drop_at,
            restore_at,
            follow,
            json,
        } => {
            let options = commands::simulate::SimulateOptions {
                trace,
                room,
                drop_at,
                restore_at,
                follow,
                json,
            };
            commands::simulate::run(&config, options, output).await
        }
        Commands::Buffer { cmd } => match cmd {
            BufferCommands::Status => commands::buffer::status(&config, output),
            BufferCommands::Show { limit } => commands::buffer::show(&config, limit, output),
            BufferCommands::Clear => commands::buffer::clear(&config, output),
        },
        Commands::Config { cmd } => match cmd {
            ConfigCommands::Show => commands::config::show(&config, output),
            ConfigCommands::Init { path } => commands::config::init(&config, path, output).await,
        },
        #[cfg(feature = "http")]
        Commands::Geocode { query } => commands::lookup::geocode(&config, &query, output).await,
        #[cfg(feature = "http")]
        Commands::Route {
            from_lat,
            from_lng,
            to_lat,
            to_lng,
        } => {
            commands::lookup::route(
                &config,
                (from_lat, from_lng).into(),
                (to_lat, to_lng).into(),
                output,
            )
            .await
        }
    }
}
