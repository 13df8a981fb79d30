//! Command surface of the `cr` binary.
//!
//! Every command prints one JSON document on stdout; logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use country_refresh_core::{CancellationToken, CountryFilter, GdpSort, RefreshError};
use country_refresh_pipeline::{
    read_artifact, RefreshConfig, RefreshOrchestrator, RefreshReport, SvgSummaryRenderer,
    DEFAULT_ARTIFACT_PATH, DEFAULT_FETCH_BUDGET_MS, ENV_ARTIFACT_PATH, ENV_COUNTRIES_URL,
    ENV_FETCH_BUDGET_MS, ENV_RATES_URL,
};
use country_refresh_sources::{HttpSources, DEFAULT_COUNTRIES_URL, DEFAULT_RATES_URL};
use country_refresh_store_sqlite::SqliteCountryStore;
use serde_json::{json, Value};
use tracing::info;

pub const SUMMARY_CONTENT_TYPE: &str = "image/svg+xml";

#[derive(Debug, Parser)]
#[command(name = "cr")]
#[command(about = "Country and exchange-rate refresh CLI")]
pub struct Cli {
    #[arg(long, default_value = "./country_refresh.sqlite3")]
    db: PathBuf,

    #[arg(long, env = ENV_COUNTRIES_URL, default_value = DEFAULT_COUNTRIES_URL)]
    countries_url: String,

    #[arg(long, env = ENV_RATES_URL, default_value = DEFAULT_RATES_URL)]
    rates_url: String,

    /// Joint deadline for both upstream fetches, in milliseconds.
    #[arg(long, env = ENV_FETCH_BUDGET_MS, default_value_t = DEFAULT_FETCH_BUDGET_MS)]
    fetch_budget_ms: u64,

    #[arg(long, env = ENV_ARTIFACT_PATH, default_value = DEFAULT_ARTIFACT_PATH)]
    artifact_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch both upstream datasets and upsert every country.
    Refresh,
    Countries {
        #[command(subcommand)]
        command: CountriesCommand,
    },
    Status,
    /// Describe the cached summary image, optionally copying it elsewhere.
    Image {
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
pub enum CountriesCommand {
    List {
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        currency: Option<String>,
        /// `gdp_desc` or `gdp_asc`; anything else keeps insertion order.
        #[arg(long)]
        sort: Option<String>,
    },
    Show {
        name: String,
    },
    Delete {
        name: String,
    },
}

/// Executes a parsed command and prints its JSON result.
///
/// # Errors
/// Returns an error when configuration, the store, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let output = execute(&cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes a parsed command and returns the JSON it would print.
///
/// # Errors
/// Returns an error when configuration, the store, or the command fails.
pub fn execute(cli: &Cli) -> Result<Value> {
    match &cli.command {
        Command::Refresh => {
            let config = resolve_config(cli)?;
            let report = refresh(&cli.db, &config)?;
            Ok(serde_json::to_value(report)?)
        }
        Command::Countries { command } => {
            let store = open_store(&cli.db)?;
            run_countries(command, &store)
        }
        Command::Status => {
            let store = open_store(&cli.db)?;
            Ok(serde_json::to_value(store.status()?)?)
        }
        Command::Image { output } => {
            let config = resolve_config(cli)?;
            describe_image(&config.artifact_path, output.as_deref())
        }
    }
}

/// Refresh settings from the parsed flags; clap has already applied the
/// `COUNTRY_REFRESH_*` variables and defaults.
///
/// # Errors
/// Returns an error when a URL, the budget, or the artifact path is unusable.
pub fn resolve_config(cli: &Cli) -> Result<RefreshConfig> {
    let config = RefreshConfig {
        countries_url: cli.countries_url.clone(),
        rates_url: cli.rates_url.clone(),
        fetch_budget_ms: cli.fetch_budget_ms,
        artifact_path: cli.artifact_path.clone(),
    };
    config.validate().context("invalid refresh configuration")?;
    Ok(config)
}

fn refresh(db: &Path, config: &RefreshConfig) -> Result<RefreshReport> {
    let mut store = open_store(db)?;
    let sources = HttpSources::new(config.countries_url.clone(), config.rates_url.clone());
    let renderer = SvgSummaryRenderer;

    let report = RefreshOrchestrator::new(&sources, &mut store, &renderer)
        .with_config(config)
        .run_refresh(&CancellationToken::new())
        .map_err(refresh_failure)?;
    info!(
        record_count = report.record_count,
        run_id = %report.run_id,
        "refresh finished"
    );
    Ok(report)
}

fn refresh_failure(err: RefreshError) -> anyhow::Error {
    match err.source_name() {
        Some(source) => anyhow::Error::new(err).context(format!(
            "External data source unavailable: could not fetch data from {source}"
        )),
        None => anyhow::Error::new(err).context("refresh failed"),
    }
}

fn run_countries(command: &CountriesCommand, store: &SqliteCountryStore) -> Result<Value> {
    match command {
        CountriesCommand::List {
            region,
            currency,
            sort,
        } => {
            let filter = CountryFilter {
                region: region.clone(),
                currency: currency.clone(),
                sort: sort.as_deref().and_then(GdpSort::parse),
            };
            Ok(serde_json::to_value(store.list_countries(&filter)?)?)
        }
        CountriesCommand::Show { name } => {
            let country = store
                .get_country(name)?
                .ok_or_else(|| anyhow!("country not found: {name}"))?;
            Ok(serde_json::to_value(country)?)
        }
        CountriesCommand::Delete { name } => {
            if !store.delete_country(name)? {
                return Err(anyhow!("country not found: {name}"));
            }
            Ok(json!({ "deleted": name }))
        }
    }
}

fn describe_image(artifact_path: &Path, output: Option<&Path>) -> Result<Value> {
    let bytes = read_artifact(artifact_path)?.ok_or_else(|| anyhow!("summary image not found"))?;
    if let Some(output) = output {
        std::fs::write(output, &bytes)
            .with_context(|| format!("failed to copy summary image to {}", output.display()))?;
    }
    Ok(json!({
        "path": artifact_path,
        "content_type": SUMMARY_CONTENT_TYPE,
        "bytes": bytes.len(),
        "copied_to": output,
    }))
}

fn open_store(db: &Path) -> Result<SqliteCountryStore> {
    let store = SqliteCountryStore::open(db)?;
    store.migrate()?;
    Ok(store)
}
