//! Scraper runtime CLI.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scraper_runtime::{EndpointScraper, RuntimeOptions, ScraperManager};
use serde_json::{json, Map, Value};
use shared::{Config, LogConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Bypass the cache for this run
    #[arg(long)]
    no_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch one endpoint and print the JSON response
    Fetch {
        /// Scraper type, e.g. foolsball
        scraper_type: String,

        /// Endpoint name from the source's endpoint table
        endpoint: String,

        /// Source to use instead of the type's default
        #[arg(short, long)]
        source: Option<String>,

        /// Path placeholder values, `name=value`
        #[arg(short, long = "param", value_parser = parse_pair)]
        params: Vec<(String, String)>,

        /// Query string parameters, `name=value`
        #[arg(short, long = "query", value_parser = parse_pair)]
        query: Vec<(String, String)>,

        /// TTL table entry to cache under, e.g. team_data
        #[arg(long)]
        ttl_kind: Option<String>,
    },

    /// List the sources known for a scraper type
    Sources { scraper_type: String },

    /// Print the effective scraper types, their sources and limits
    Stats,
}

fn parse_pair(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => bail!("expected name=value, got '{}'", raw),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    config
        .apply_env_overrides()
        .context("Invalid environment override")?;

    // Initialize logging
    let mut log_config = LogConfig::from_settings("scraper-runtime", &config.logging);
    if args.verbose {
        log_config.default_level = tracing::Level::DEBUG;
    }
    shared::logging::init(log_config)?;

    info!(config_file = %args.config.display(), "Loaded configuration");

    let options = RuntimeOptions {
        cache_enabled: !args.no_cache,
        ..RuntimeOptions::default()
    };
    let manager = ScraperManager::with_options(config, options);

    let outcome = run(&manager, args.command).await;
    manager.close_all().await;
    outcome
}

async fn run(manager: &ScraperManager, command: Command) -> Result<()> {
    match command {
        Command::Fetch {
            scraper_type,
            endpoint,
            source,
            params,
            query,
            ttl_kind,
        } => {
            let scraper = EndpointScraper::from_manager(manager, &scraper_type, source.as_deref())
                .await
                .with_context(|| format!("Failed to create scraper for {}", scraper_type))?;

            let params: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let query: Vec<(&str, &str)> = query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

            let data: Value = scraper
                .fetch_json(&endpoint, &params, &query, ttl_kind.as_deref())
                .await
                .with_context(|| format!("Failed to fetch {} from {}", endpoint, scraper_type))?;

            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Sources { scraper_type } => {
            let active = manager.active_source(&scraper_type)?;
            for source in manager.available_sources(&scraper_type)? {
                let marker = if source == active { "*" } else { " " };
                println!("{} {}", marker, source);
            }
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&config_summary(manager)?)?);
        }
    }

    Ok(())
}

/// Effective per-type settings after config defaults and overrides
fn config_summary(manager: &ScraperManager) -> Result<Value> {
    let config = manager.config();
    let mut types = Map::new();

    for (scraper_type, type_config) in &config.scrapers {
        let rate_limit = config.rate_limit.enabled.then(|| {
            json!({
                "max_calls": type_config.max_calls.unwrap_or(config.rate_limit.max_calls),
                "period_secs": type_config.period_secs.unwrap_or(config.rate_limit.period_secs),
                "adaptive": type_config.adaptive,
            })
        });

        types.insert(
            scraper_type.clone(),
            json!({
                "active_source": manager.active_source(scraper_type)?,
                "sources": type_config.source_names(),
                "headers": type_config.headers.keys().collect::<Vec<_>>(),
                "rate_limit": rate_limit,
            }),
        );
    }

    Ok(json!({
        "cache": {
            "enabled": config.cache.enabled,
            "backend": config.cache.backend,
            "ttl": config.cache.ttl,
        },
        "scrapers": types,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            parse_pair("season=2024").unwrap(),
            ("season".to_string(), "2024".to_string())
        );
        assert_eq!(parse_pair("q=a=b").unwrap().1, "a=b");
        assert!(parse_pair("season").is_err());
        assert!(parse_pair("=2024").is_err());
    }

    #[test]
    fn test_config_summary_reflects_overrides() {
        let mut config = Config::default();
        if let Some(jobs) = config.scrapers.get_mut("jobs") {
            jobs.max_calls = Some(3);
        }
        let manager = ScraperManager::new(config);
        manager.switch_source("foolsball", "nfl").unwrap();

        let summary = config_summary(&manager).unwrap();
        let foolsball = &summary["scrapers"]["foolsball"];
        assert_eq!(foolsball["active_source"], "nfl");
        assert_eq!(foolsball["sources"], json!(["espn", "nfl"]));
        assert_eq!(foolsball["rate_limit"]["max_calls"], 10);
        assert_eq!(foolsball["rate_limit"]["adaptive"], true);
        assert_eq!(summary["scrapers"]["jobs"]["rate_limit"]["max_calls"], 3);
        assert_eq!(summary["cache"]["backend"], "memory");
        assert_eq!(summary["cache"]["ttl"]["team_data"], 86_400);
    }
}
