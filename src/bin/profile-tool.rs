//! Offline helper for maintaining the capability profile table.
//!
//! Usage:
//!   cargo run --bin profile-tool -- check profiles/default.json
//!   cargo run --bin profile-tool -- resolve profiles/default.json \
//!       --manufacturer _TZE200_bjawzodf --model TS0601 --cluster 1:0402
//!   cargo run --bin profile-tool -- diagnostics ~/.local/share/zigbee-capability-gateway/diagnostics.json

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use zigbee_capability_gateway::diagnostics::{DiagnosticKind, DiagnosticLog};
use zigbee_capability_gateway::{DeviceFingerprint, FingerprintMatcher, NodeId, Registry};

#[derive(Parser)]
#[command(name = "profile-tool")]
#[command(about = "Validate profile tables, try fingerprints, inspect diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a profile table and print a summary
    Check {
        /// Profile table (JSON)
        path: PathBuf,
    },
    /// Show which profile a fingerprint resolves to
    Resolve {
        /// Profile table (JSON)
        path: PathBuf,

        #[arg(long)]
        manufacturer: String,

        #[arg(long)]
        model: String,

        #[arg(long)]
        product: Option<String>,

        /// Exposed cluster as `endpoint:cluster`, cluster in hex (repeatable)
        #[arg(long = "cluster", value_parser = parse_endpoint_cluster)]
        clusters: Vec<(u8, u16)>,
    },
    /// Print recorded diagnostics
    Diagnostics {
        /// Diagnostics file written by the gateway
        path: PathBuf,

        /// Only show records of this kind (e.g. unmatched_fingerprint)
        #[arg(long)]
        kind: Option<String>,
    },
}

fn parse_endpoint_cluster(s: &str) -> Result<(u8, u16), String> {
    let (endpoint, cluster) = s
        .split_once(':')
        .ok_or_else(|| format!("expected endpoint:cluster, got '{}'", s))?;
    let endpoint = endpoint
        .parse()
        .map_err(|_| format!("invalid endpoint '{}'", endpoint))?;
    let cluster = u16::from_str_radix(cluster.trim_start_matches("0x"), 16)
        .map_err(|_| format!("invalid cluster '{}'", cluster))?;
    Ok((endpoint, cluster))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { path } => {
            let registry = Registry::from_path(&path)?;
            println!(
                "{}: {} profile(s), {} translator(s), version {}",
                path.display(),
                registry.len(),
                registry.translators().len(),
                registry.version().unwrap_or("unversioned")
            );
            for profile in registry.profiles() {
                println!(
                    "  {:<32} {:<48} {}",
                    profile.name,
                    profile.pattern.to_string(),
                    profile.capabilities().join(", ")
                );
            }
        }
        Commands::Resolve {
            path,
            manufacturer,
            model,
            product,
            clusters,
        } => {
            let registry = Registry::from_path(&path)?;
            let mut fingerprint = DeviceFingerprint::new(NodeId(0), manufacturer, model);
            fingerprint.product = product;
            for (endpoint, cluster) in clusters {
                fingerprint = fingerprint.with_cluster(endpoint, cluster);
            }

            let resolution = FingerprintMatcher::select(&registry, &fingerprint);
            println!(
                "{} -> '{}' ({}, score {})",
                fingerprint, resolution.profile.name, resolution.kind, resolution.score
            );
            if !resolution.ambiguous_with.is_empty() {
                println!("  tied with: {}", resolution.ambiguous_with.join(", "));
            }
            for binding in &resolution.profile.bindings {
                println!(
                    "  {} -> {} via {}",
                    binding.key(),
                    binding.capability,
                    binding.translator
                );
            }
        }
        Commands::Diagnostics { path, kind } => {
            let log = DiagnosticLog::load(&path);
            let kind: Option<DiagnosticKind> = match kind {
                Some(k) => Some(serde_json::from_value(serde_json::Value::String(k))?),
                None => None,
            };
            for record in log.snapshot() {
                if kind.is_some_and(|k| k != record.kind) {
                    continue;
                }
                println!(
                    "{:<22} x{:<5} {} ({} / {})  last: {}",
                    record.kind.as_ref(),
                    record.count,
                    record.fingerprint,
                    record.first_seen.format("%Y-%m-%d %H:%M"),
                    record.last_seen.format("%Y-%m-%d %H:%M"),
                    record.last_context
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_cluster() {
        assert_eq!(parse_endpoint_cluster("1:0402"), Ok((1, 0x0402)));
        assert_eq!(parse_endpoint_cluster("2:0x0006"), Ok((2, 0x0006)));
        assert!(parse_endpoint_cluster("0402").is_err());
        assert!(parse_endpoint_cluster("x:0402").is_err());
    }
}
