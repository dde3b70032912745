//! TWINPATH CLI
//!
//! Simulates dual-path traffic against in-process backends and exposes the
//! scoring and configuration machinery from the command line.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use twinpath_core::{CapabilitySet, ExecutionMode, ExecutionPath, NodeId, Outcome, Value, Version, fields};
use twinpath_log::{ChannelSink, DivergenceStats, TracingSink};
use twinpath_runtime::testing::{CompileBehavior, FnBackend};
use twinpath_runtime::{BackendFailure, Engine, EngineConfig, InMemoryRegistry, Invocation, NodeDescriptor, NodeMetrics};
use twinpath_verify::{FieldKind, NodeAggregate, wilson_lower_bound};

#[derive(Parser)]
#[command(name = "twinpath")]
#[command(about = "TWINPATH - verified dual-path execution", long_about = None)]
struct Cli {
    /// Engine config file (JSON)
    #[arg(long, global = true, env = "TWINPATH_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive an `add` node through the engine with a deliberately buggy optimized backend
    Simulate {
        /// Number of calls
        #[arg(short = 'n', long, default_value_t = 20_000)]
        calls: u64,
        /// Probability that the optimized backend answers wrongly
        #[arg(long, default_value_t = 0.0)]
        bug_rate: f64,
        /// Pin the node to a mode instead of letting confidence decide
        #[arg(long)]
        mode: Option<ExecutionMode>,
        /// Override the minimum sample size
        #[arg(long)]
        min_sample_size: Option<u64>,
        /// Write the divergence history here as JSON
        #[arg(long)]
        export_divergences: Option<PathBuf>,
    },
    /// Compute the Wilson lower bound and band for given counts
    Score {
        /// Total comparisons
        #[arg(long)]
        total: u64,
        /// Diverged comparisons
        #[arg(long)]
        divergences: u64,
        /// z-score; defaults to the configured value
        #[arg(long)]
        z: Option<f64>,
    },
    /// Print the effective configuration
    Config,
    /// Validate a JSON array of node descriptors
    CheckNodes {
        /// Descriptor file
        path: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    calls: u64,
    served_by: BTreeMap<ExecutionPath, u64>,
    modes: BTreeMap<ExecutionMode, u64>,
    metrics: NodeMetrics,
    aggregate: NodeAggregate,
    divergences: DivergenceStats,
    shadow_dropped: u64,
    audit_events: u64,
}

#[derive(Debug, Serialize)]
struct ScoreReport {
    total: u64,
    divergences: u64,
    z: f64,
    min_sample_size: u64,
    score: f64,
    mode: ExecutionMode,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("twinpath=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .wrap_err_with(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn add(inv: &Invocation) -> std::result::Result<Outcome, BackendFailure> {
    let a = inv.inputs.get("a").and_then(Value::as_i64).unwrap_or(0);
    let b = inv.inputs.get("b").and_then(Value::as_i64).unwrap_or(0);
    Ok(Outcome::success(fields! { "result" => a.wrapping_add(b) }))
}

fn band(config: &EngineConfig, total: u64, divergences: u64, z: f64) -> (f64, ExecutionMode) {
    if total < config.confidence.min_sample_size {
        return (0.0, ExecutionMode::ReferenceOnly);
    }
    let score = wilson_lower_bound(total, divergences, z);
    (score, config.confidence.thresholds.mode_for(score))
}

async fn simulate(
    mut config: EngineConfig,
    calls: u64,
    bug_rate: f64,
    mode: Option<ExecutionMode>,
    export: Option<PathBuf>,
) -> Result<SimulationReport> {
    if !(0.0..=1.0).contains(&bug_rate) {
        return Err(eyre!("--bug-rate must be within [0, 1], got {bug_rate}"));
    }
    let node_id = NodeId::new("add_v1")?;
    if let Some(mode) = mode {
        config.routing.pinned.insert(node_id.clone(), mode);
    }

    let registry = Arc::new(InMemoryRegistry::new());
    registry.register(
        NodeDescriptor::new(node_id.clone(), Version::new(1, 0, 0))
            .with_idempotent(false)
            .with_output_field("result", FieldKind::Int),
    )?;

    let reference = Arc::new(FnBackend::new("reference", add));
    let optimized = Arc::new(
        FnBackend::new("optimized", move |inv| {
            let mut outcome = add(inv)?;
            if rand::thread_rng().gen_bool(bug_rate) {
                if let Outcome::Success { fields } = &mut outcome {
                    fields.insert("result".to_string(), Value::Int(-1));
                }
            }
            Ok(outcome)
        })
        .with_compile(CompileBehavior::Succeed),
    );

    let (sink, forwarder) = ChannelSink::spawn(config.audit.channel_capacity, Arc::new(TracingSink));
    let engine = Engine::builder()
        .with_config(config)
        .with_registry(registry)
        .with_reference(reference)
        .with_optimized(optimized)
        .with_sink(Arc::new(sink))
        .build()?;

    let granted = CapabilitySet::new();
    let mut served_by = BTreeMap::new();
    let mut modes = BTreeMap::new();
    for i in 0..calls {
        let a = i64::try_from(i)?;
        let result = engine
            .execute(&node_id, fields! { "a" => a, "b" => a / 2 }, None, &granted)
            .await?;
        *served_by.entry(result.path).or_insert(0) += 1;
        *modes.entry(result.mode).or_insert(0) += 1;
    }
    engine.drain_background().await;

    if let Some(path) = export {
        engine
            .divergences()
            .save(&path)
            .wrap_err_with(|| format!("writing divergences to {}", path.display()))?;
        info!(path = %path.display(), "divergences exported");
    }

    let metrics = engine.metrics_snapshot(&node_id);
    let aggregate = engine.monitor().aggregate(&node_id);
    let divergences = engine.divergences().stats(&node_id);
    let shadow_dropped = engine.shadow_dropped();
    drop(engine);
    let audit_events = forwarder.await?;

    Ok(SimulationReport {
        calls,
        served_by,
        modes,
        metrics,
        aggregate,
        divergences,
        shadow_dropped,
        audit_events,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            calls,
            bug_rate,
            mode,
            min_sample_size,
            export_divergences,
        } => {
            if let Some(min) = min_sample_size {
                config.confidence.min_sample_size = min;
            }
            let report = simulate(config, calls, bug_rate, mode, export_divergences).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Score {
            total,
            divergences,
            z,
        } => {
            if divergences > total {
                return Err(eyre!("divergences ({divergences}) exceed total ({total})"));
            }
            let z = z.unwrap_or(config.confidence.z);
            let (score, mode) = band(&config, total, divergences, z);
            let report = ScoreReport {
                total,
                divergences,
                z,
                min_sample_size: config.confidence.min_sample_size,
                score,
                mode,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Config => {
            println!("{}", config.to_json_pretty()?);
            Ok(())
        }
        Commands::CheckNodes { path } => {
            let json = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            let registry = InMemoryRegistry::new();
            let count = registry.load_json(&json)?;
            for id in registry.ids() {
                println!("{id}");
            }
            println!("{count} node(s) valid");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from([
            "twinpath",
            "simulate",
            "-n",
            "500",
            "--bug-rate",
            "0.1",
            "--mode",
            "dual_verify",
        ])
        .unwrap();
        match cli.command {
            Commands::Simulate {
                calls,
                bug_rate,
                mode,
                ..
            } => {
                assert_eq!(calls, 500);
                assert!((bug_rate - 0.1).abs() < f64::EPSILON);
                assert_eq!(mode, Some(ExecutionMode::DualVerify));
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_band_respects_floor() {
        let config = EngineConfig::default();
        assert_eq!(band(&config, 9_999, 0, 3.29), (0.0, ExecutionMode::ReferenceOnly));
        let (score, mode) = band(&config, 10_000, 500, 3.29);
        assert!(score < 0.95);
        assert_eq!(mode, ExecutionMode::ReferenceOnly);
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twinpath.json");
        std::fs::write(&path, r#"{ "routing": { "canary_percent": 10 } }"#).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.routing.canary_percent, 10);
        assert!(load_config(Some(Path::new("/nonexistent.json"))).is_err());
    }

    #[tokio::test]
    async fn test_simulate_dual_verify_counts_bugs() {
        let config = EngineConfig::default();
        let report = simulate(config, 200, 1.0, Some(ExecutionMode::DualVerify), None)
            .await
            .unwrap();
        assert_eq!(report.calls, 200);
        assert_eq!(report.served_by.get(&ExecutionPath::Reference), Some(&200));
        assert_eq!(report.metrics.counters.total, 200);
        assert_eq!(report.metrics.counters.divergences, 200);
        assert_eq!(report.divergences.total, 200);
    }
}
