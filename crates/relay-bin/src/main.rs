//! Broadmail relay - delivers marketing API calls and replays the ones that fail.

mod app;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use relay_config_and_utils::{init_logging, Config, Paths};

/// Broadmail relay command-line interface.
#[derive(Parser)]
#[command(name = "broadmail-relay")]
#[command(about = "Deliver Broadmail API calls and retry failed ones")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, queue and mail spool. Defaults to ~/.broadmail-relay
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Queue database file. Defaults to <base-dir>/queue.sqlite
    #[arg(long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay the retry backlog periodically until interrupted
    Run,
    /// Replay the retry backlog once
    Tick,
    /// Send one raw API call
    Submit {
        endpoint: String,
        method: String,
        /// Form field as key=value, repeatable
        #[arg(short, long = "field", value_parser = app::parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Subscribe a recipient
    Subscribe {
        email: String,
        #[arg(short, long = "field", value_parser = app::parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Unsubscribe a recipient
    Unsubscribe {
        email: String,
        #[arg(short, long = "field", value_parser = app::parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Send a transactional mailing to a recipient
    SendTransactionMail {
        email: String,
        #[arg(short, long = "field", value_parser = app::parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Update recipient fields
    UpdateFields {
        email: String,
        #[arg(short, long = "field", value_parser = app::parse_field)]
        fields: Vec<(String, String)>,
        /// Keep values already stored for the recipient
        #[arg(long)]
        no_overwrite: bool,
    },
    /// Show queue counts and the retry backlog
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(level, config.log_format);

    let relay = app::RelayState::open(config, paths, cli.database).await?;

    let code = match cli.command {
        Commands::Run => {
            app::run(&relay).await;
            ExitCode::SUCCESS
        }
        Commands::Tick => app::tick(&relay).await?,
        Commands::Submit {
            endpoint,
            method,
            fields,
        } => app::submit(&relay, endpoint, method, fields).await?,
        Commands::Subscribe { email, fields } => {
            app::report(relay.api().subscribe(&email, fields).await?)
        }
        Commands::Unsubscribe { email, fields } => {
            app::report(relay.api().unsubscribe(&email, fields).await?)
        }
        Commands::SendTransactionMail { email, fields } => {
            app::report(relay.api().send_transaction_mail(&email, fields).await?)
        }
        Commands::UpdateFields {
            email,
            fields,
            no_overwrite,
        } => app::report(relay.api().update_fields(&email, fields, !no_overwrite).await?),
        Commands::Status { json } => app::status(&relay, json).await?,
    };

    Ok(code)
}
