use std::sync::Arc;

use anyhow::{bail, Context, Result};
use assessor_comps::{map_points, CompDefaults, CompFetchClient, CompFilters, CompQueryState, RpcCompScorer};
use assessor_core::{PageLimits, PartialWeights};
use assessor_storage::{HostedStore, StoreConfig};
use assessor_web::{query_resource, ResourceRegistry, WebConfig};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "assessor")]
#[command(about = "Property assessment records service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API.
    Serve,
    /// Print comparable sales for a parcel as JSON.
    Comps {
        parcel_id: i64,
        #[arg(long)]
        max_distance: Option<f64>,
        #[arg(long)]
        band: Option<f64>,
        /// Allow candidates with a different land use.
        #[arg(long)]
        any_land_use: bool,
        /// e.g. `land_use=5,district=4`; unnamed weights keep their defaults.
        #[arg(long)]
        weights: Option<String>,
    },
    /// Query parcel value features with list parameters (`key=value`).
    Features { params: Vec<String> },
    /// List the resources served under `/{resource}/api`.
    Resources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "assessor_cli=info,assessor_web=info,assessor_storage=info,assessor_comps=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => assessor_web::serve_from_env().await?,
        Commands::Comps {
            parcel_id,
            max_distance,
            band,
            any_land_use,
            weights,
        } => {
            let filters = CompFilters {
                max_distance_miles: max_distance,
                living_area_band: band,
                require_same_land_use: any_land_use.then_some(false),
                weights: weights.as_deref().map(parse_weights).transpose()?.unwrap_or_default(),
            };
            let store = Arc::new(HostedStore::new(&StoreConfig::from_env())?);
            let client = CompFetchClient::new(Arc::new(RpcCompScorer::new(store)), CompDefaults::default());
            match client.fetch(Some(parcel_id), &filters).await {
                CompQueryState::Ready(result) => {
                    let out = json!({
                        "subject": result.subject,
                        "comps": result.comps,
                        "points": map_points(&result),
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                CompQueryState::Failed(message) => bail!("comps request failed: {message}"),
                CompQueryState::Idle => bail!("no parcel selected"),
            }
        }
        Commands::Features { params } => {
            let pairs = params
                .iter()
                .map(String::as_str)
                .map(parse_pair)
                .collect::<Result<Vec<_>>>()?;
            let registry = ResourceRegistry::load_or_builtin(&WebConfig::from_env().resources_path)?;
            let store = HostedStore::new(&StoreConfig::from_env())?;
            let page = query_resource(&store, &registry.features(), pairs, PageLimits::default()).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Commands::Resources => {
            let registry = ResourceRegistry::load_or_builtin(&WebConfig::from_env().resources_path)?;
            for def in registry.iter() {
                println!(
                    "{:<16} {:<6} {:<36} {}",
                    def.name,
                    match def.kind {
                        assessor_web::ResourceKind::Table => "table",
                        assessor_web::ResourceKind::Rpc => "rpc",
                    },
                    def.target,
                    def.default_sort.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

fn parse_pair(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("expected key=value, got '{raw}'"))?;
    Ok((key.trim().to_string(), value.to_string()))
}

fn parse_weights(raw: &str) -> Result<PartialWeights> {
    let mut weights = PartialWeights::default();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = parse_pair(part)?;
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("weight '{key}' is not a number"))?;
        let slot = match key.as_str() {
            "land_use" => &mut weights.land_use,
            "district" => &mut weights.district,
            "lat" => &mut weights.lat,
            "lon" => &mut weights.lon,
            "condition" => &mut weights.condition,
            other => bail!("unknown weight '{other}'"),
        };
        *slot = Some(value);
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_fill_only_named_members() {
        let w = parse_weights("land_use=2, condition=0.5").unwrap();
        assert_eq!(w.land_use, Some(2.0));
        assert_eq!(w.condition, Some(0.5));
        assert_eq!(w.district, None);
    }

    #[test]
    fn bad_weights_are_rejected() {
        assert!(parse_weights("height=3").is_err());
        assert!(parse_weights("lat=far").is_err());
        assert!(parse_weights("lat").is_err());
    }

    #[test]
    fn cli_parses_comps_flags() {
        let cli = Cli::try_parse_from([
            "assessor",
            "comps",
            "42",
            "--max-distance",
            "2.5",
            "--any-land-use",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Comps {
                parcel_id,
                max_distance,
                any_land_use,
                ..
            }) => {
                assert_eq!(parcel_id, 42);
                assert_eq!(max_distance, Some(2.5));
                assert!(any_land_use);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
