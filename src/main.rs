//! Covhub CLI - live coverage collection registry
//!
//! Runs the registry server and merges or compares coverage profiles locally.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use covhub_cover::{diff, merge, render_table, CoverageList, Profile};
use covhub_server::{ApiServer, ServerConfig, StoreConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Covhub - collect coverage from running services
#[derive(Parser, Debug)]
#[command(name = "covhub")]
#[command(about = "Covhub - collect coverage from running services")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the coverage registry
    #[command(long_about = r#"
Run the coverage registry. Instrumented services dial in over
/v2/internal/ws/rpcstream; their merged profile is served at
/v2/cover/profile. Services registered by address use the /v1 API.

EXAMPLES:
  # Serve on all interfaces, persisting legacy registrations
  covhub server --bind 0.0.0.0:7777 --store-file /var/lib/covhub/store

ENVIRONMENT VARIABLES:
  COVHUB_BIND              Address to bind
  COVHUB_STORE_FILE        Legacy service store file (in memory if unset)
  COVHUB_RPC_TIMEOUT_SECS  Timeout of each call to an agent or service
    "#)]
    Server {
        /// Address to bind
        #[arg(long, env = "COVHUB_BIND", default_value = "127.0.0.1:7777")]
        bind: SocketAddr,

        /// Legacy service store file
        #[arg(long, env = "COVHUB_STORE_FILE")]
        store_file: Option<PathBuf>,

        /// Timeout of each call to an agent or service, in seconds
        #[arg(long, env = "COVHUB_RPC_TIMEOUT_SECS", default_value = "10")]
        rpc_timeout_secs: u64,
    },

    /// Merge profile files into one
    Merge {
        /// Profiles to merge
        #[arg(required = true)]
        profiles: Vec<PathBuf>,

        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare a profile against a baseline, file by file
    Diff {
        /// Profile of the new build
        #[arg(long)]
        new_profile: PathBuf,

        /// Profile of the baseline
        #[arg(long)]
        base_profile: PathBuf,

        /// Only compare these files or directories, listing all of them
        #[arg(long, num_args = 1..)]
        restrict: Vec<String>,
    },
}

/// Setup logging; `RUST_LOG` takes precedence over the verbose flag
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "covhub=debug" } else { "covhub=info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn read_profile(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn run_merge(profiles: &[PathBuf], output: Option<&Path>) -> Result<()> {
    let parsed = profiles
        .iter()
        .map(|path| {
            Profile::parse(&read_profile(path)?)
                .with_context(|| format!("Failed to parse {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let merged = merge(&parsed)
        .context("Failed to merge profiles")?
        .serialize()
        .context("Failed to serialize merged profile")?;

    match output {
        Some(path) => {
            std::fs::write(path, merged)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Merged {} profiles into {}", profiles.len(), path.display());
        }
        None => print!("{}", merged),
    }
    Ok(())
}

fn run_diff(new_profile: &Path, base_profile: &Path, restrict: &[String]) -> Result<()> {
    let new = CoverageList::parse(&read_profile(new_profile)?)
        .with_context(|| format!("Failed to parse {}", new_profile.display()))?;
    let base = CoverageList::parse(&read_profile(base_profile)?)
        .with_context(|| format!("Failed to parse {}", base_profile.display()))?;

    let restrict = (!restrict.is_empty()).then_some(restrict);
    print!("{}", render_table(&diff(&new, &base, restrict)));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Server {
            bind,
            store_file,
            rpc_timeout_secs,
        } => {
            let config = ServerConfig {
                bind_addr: bind,
                store: match store_file {
                    Some(path) => StoreConfig::File(path),
                    None => StoreConfig::Memory,
                },
                rpc_timeout: Duration::from_secs(rpc_timeout_secs),
                ..ServerConfig::default()
            };

            info!("Covhub starting...");
            info!("Bind address: {}", config.bind_addr);
            if let StoreConfig::File(path) = &config.store {
                info!("Service store: {}", path.display());
            }

            let server = ApiServer::new(config).context("Failed to initialize the registry")?;
            server.start().await?;
            info!("Covhub stopped");
            Ok(())
        }
        Commands::Merge { profiles, output } => run_merge(&profiles, output.as_deref()),
        Commands::Diff {
            new_profile,
            base_profile,
            restrict,
        } => run_diff(&new_profile, &base_profile, &restrict),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.cov");
        let b = dir.path().join("b.cov");
        let out = dir.path().join("merged.cov");
        std::fs::write(&a, "mode: count\nmain.go:1.1,2.2 1 2\n").unwrap();
        std::fs::write(&b, "mode: count\nmain.go:1.1,2.2 1 3\n").unwrap();

        run_merge(&[a, b], Some(&out)).unwrap();
        assert_eq!(
            std::fs::read_to_string(out).unwrap(),
            "mode: count\nmain.go:1.1,2.2 1 5\n"
        );
    }

    #[test]
    fn test_merge_mode_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.cov");
        let b = dir.path().join("b.cov");
        std::fs::write(&a, "mode: count\nmain.go:1.1,2.2 1 2\n").unwrap();
        std::fs::write(&b, "mode: set\nmain.go:1.1,2.2 1 1\n").unwrap();

        assert!(run_merge(&[a, b], None).is_err());
    }

    #[test]
    fn test_missing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_diff(&dir.path().join("new"), &dir.path().join("base"), &[]).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from([
            "covhub",
            "diff",
            "--new-profile",
            "new.cov",
            "--base-profile",
            "base.cov",
            "--restrict",
            "pkg/a.go",
            "pkg/b",
        ]);
        match cli.command {
            Commands::Diff { restrict, .. } => assert_eq!(restrict, vec!["pkg/a.go", "pkg/b"]),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
