use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod aggregator;
mod config;
mod error;
mod formatter;
mod menubar;
mod mock;
mod models;
mod providers;

use aggregator::{Aggregator, RetryPolicy};
use config::Config;
use menubar::MenubarDriver;
use providers::Registry;

#[derive(Parser)]
#[command(name = "planbar")]
#[command(about = "Monitor coding-plan usage for Kimi and BigModel")]
struct Cli {
    /// Config file (default: ~/.coding_plan_usage_config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use recorded responses instead of calling the vendors
    #[arg(long, global = true)]
    mock: bool,

    /// Attempts per provider when the network fails
    #[arg(long, global = true, default_value_t = 1)]
    attempts: u32,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every provider once and print a report (default)
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print a one-line summary, refreshed periodically and on SIGUSR1
    Menubar {
        /// Seconds between refreshes
        #[arg(long, default_value_t = menubar::DEFAULT_REFRESH_INTERVAL.as_secs())]
        interval: u64,
        /// Print a single summary and exit
        #[arg(long)]
        once: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "planbar=debug" } else { "planbar=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_aggregator(cli: &Cli) -> Result<Aggregator> {
    let registry = if cli.mock {
        mock::mock_registry()?
    } else {
        Registry::builtin()?
    };
    let retry = if cli.attempts > 1 {
        RetryPolicy::new(cli.attempts)
    } else {
        RetryPolicy::single_attempt()
    };
    Ok(Aggregator::new(registry).with_retry(retry))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = Config::load(cli.config.as_deref())?;
    if config.is_empty() {
        bail!("No providers configured");
    }
    Ok(config)
}

async fn status(cli: &Cli, json: bool) -> Result<bool> {
    let config = load_config(cli)?;
    let result = build_aggregator(cli)?.run(&config).await;

    if json {
        println!("{}", formatter::render_json(&result)?);
    } else {
        print!("{}", formatter::render_table(&result));
    }
    Ok(result.has_success())
}

async fn run_menubar(cli: &Cli, interval: u64, once: bool) -> Result<bool> {
    let config = load_config(cli)?;
    let driver = MenubarDriver::new(build_aggregator(cli)?, config);

    if once {
        driver.refresh_now().await;
        println!("{}", driver.summary());
        return Ok(driver
            .last_result()
            .map(|r| r.has_success())
            .unwrap_or(false));
    }

    let triggers = menubar::manual_triggers()?;
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    driver
        .run(
            Duration::from_secs(interval.max(1)),
            triggers,
            shutdown,
            |line| println!("{}", line),
        )
        .await;
    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match &cli.command {
        None => status(&cli, false).await,
        Some(Commands::Status { json }) => status(&cli, *json).await,
        Some(Commands::Menubar { interval, once }) => run_menubar(&cli, *interval, *once).await,
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
