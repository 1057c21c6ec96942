// =============================================================================
// Confluence Core — Main Entry Point
// =============================================================================
//
// Runs the orchestrator against a deterministic simulated observation feed.
// Real deployments replace the feed tasks with exchange collectors and point
// the event consumer at order placement.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use confluence_core::config::{EngineConfig, ScorerConfig};
use confluence_core::events::{AllocationEvent, ChannelSink, EventLog, EventSink, Fanout};
use confluence_core::scoring::{CalibratedScorer, ComponentScorer, Observation};
use confluence_core::types::Direction;
use confluence_core::Orchestrator;

const DEFAULT_CONFIG_PATH: &str = "confluence_config.json";

/// How long a simulated position stays open before the close notification.
const SIMULATED_HOLD: Duration = Duration::from_secs(45);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Confluence Core — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("CONFLUENCE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    if let Ok(list) = std::env::var("CONFLUENCE_RESOURCES") {
        config.resources = list
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    config.validate()?;

    info!(resources = ?config.resources, "Configured resources");

    // ── 2. Build the core ────────────────────────────────────────────────
    let audit_log = Arc::new(EventLog::default());
    let (channel, mut events) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(Fanout::new(vec![
        audit_log.clone() as Arc<dyn EventSink>,
        Arc::new(channel) as Arc<dyn EventSink>,
    ]));

    let orchestrator = Arc::new(Orchestrator::new(config.clone(), sink));

    let scorers: Vec<(CalibratedScorer, Vec<String>)> = config
        .scorers
        .iter()
        .map(|cfg| (CalibratedScorer::from_config(cfg), pattern_names(cfg)))
        .collect();
    info!(scorers = scorers.len(), "Component scorers ready");

    // ── 3. Event consumer (execution boundary) ───────────────────────────
    let orch = orchestrator.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                AllocationEvent::Approved(a) => {
                    info!(
                        key = %event.idempotency_key(),
                        resource_id = %a.resource_id,
                        vault_id = %a.vault_id,
                        direction = %a.direction,
                        win_rate = a.combined_win_rate,
                        "ApprovedAllocation → execution"
                    );
                    let orch = orch.clone();
                    let (vault_id, resource_id) = (a.vault_id.clone(), a.resource_id.clone());
                    tokio::spawn(async move {
                        tokio::time::sleep(SIMULATED_HOLD).await;
                        if let Err(e) = orch.position_closed(&vault_id, &resource_id) {
                            error!(error = %e, "position-closed notification failed");
                        }
                    });
                }
                AllocationEvent::CircuitBreaker(t) => {
                    warn!(from = %t.from_state, to = %t.to_state, metric = t.metric_value, "breaker alert");
                }
                AllocationEvent::ThrottleOverflow(o) => {
                    warn!(resource_id = %o.resource_id, overflows = o.overflow_count, "throttle alert");
                }
                AllocationEvent::InvariantViolation(v) => {
                    error!(resource_id = %v.resource_id, violation = %v.violation, "invariant alert");
                }
                AllocationEvent::Rejected(_) => {}
            }
        }
    });

    // ── 4. Evaluation loop: feeds → metric → cycles ──────────────────────
    let orch = orchestrator.clone();
    let resources = config.resources.clone();
    let cycle_interval = config.cycle_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cycle_interval);
        let mut tick: u64 = 0;
        loop {
            interval.tick().await;
            tick += 1;

            for (idx, resource_id) in resources.iter().enumerate() {
                for (s, (scorer, patterns)) in scorers.iter().enumerate() {
                    let observations = simulated_observations(patterns, tick, idx, s);
                    orch.ingest(scorer as &dyn ComponentScorer, resource_id, &observations);
                }
            }

            orch.update_metric(simulated_drawdown(tick));

            let outcomes = orch.run_all(&resources).await;
            let approved = outcomes.iter().filter(|o| o.is_approved()).count();
            info!(tick, approved, evaluated = outcomes.len(), "cycle complete");
        }
    });

    // ── 5. Lock reaper ───────────────────────────────────────────────────
    let orch = orchestrator.clone();
    let reap_every = config.locks.ttl();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_every);
        loop {
            interval.tick().await;
            orch.purge_expired_locks();
        }
    });

    // ── 6. Periodic snapshot ─────────────────────────────────────────────
    let orch = orchestrator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            match serde_json::to_string(&orch.snapshot()) {
                Ok(json) => info!(snapshot = %json, "operational snapshot"),
                Err(e) => error!(error = %e, "failed to serialise snapshot"),
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    info!(
        events = audit_log.len(),
        approvals = audit_log.approvals().len(),
        "session summary"
    );

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "Failed to save config on shutdown");
    }

    info!("Confluence Core shut down complete.");
    Ok(())
}

fn pattern_names(cfg: &ScorerConfig) -> Vec<String> {
    cfg.patterns.iter().map(|p| p.name.clone()).collect()
}

/// Deterministic pseudo-feed: rotates through a source's patterns with a
/// direction that drifts per resource.
fn simulated_observations(
    patterns: &[String],
    tick: u64,
    resource_idx: usize,
    source_idx: usize,
) -> Vec<Observation> {
    if patterns.is_empty() {
        return Vec::new();
    }
    let phase = tick as usize + resource_idx * 3 + source_idx;
    let direction = if (tick as usize / 6 + resource_idx) % 4 == 3 {
        Direction::Short
    } else {
        Direction::Long
    };

    (0..(phase % 4) + 1)
        .map(|k| {
            let name = &patterns[(phase + k) % patterns.len()];
            let dir = if (phase + k) % 5 == 0 { direction.opposite() } else { direction };
            Observation::new(name.clone(), dir)
        })
        .collect()
}

/// Drawdown-style risk metric in [0, 1] with slow swings.
fn simulated_drawdown(tick: u64) -> f64 {
    let t = tick as f64;
    (0.30 + 0.35 * (t / 25.0).sin() + 0.10 * (t / 7.0).cos()).clamp(0.0, 1.0)
}
