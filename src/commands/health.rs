//! Implementation of the `tflock health` command.

use super::open_engine;
use std::path::Path;
use tflock::monitor::HealthReport;
use tflock::{LockError, Result};

/// Execute `tflock health`.
///
/// Exits with the backend-unavailable code when the backend the engine would
/// use does not answer.
pub fn cmd_health(config_path: &Path) -> Result<()> {
    let engine = open_engine(config_path)?;
    let report = engine.health();
    print!("{}", render(&report));

    if report.is_healthy() {
        return Ok(());
    }
    let reason = report
        .backends
        .iter()
        .find_map(|b| b.error.clone())
        .unwrap_or_else(|| "no reachable backend".to_string());
    Err(LockError::BackendUnavailable {
        backend: report.mode.to_string(),
        reason,
    })
}

fn render(report: &HealthReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Mode:       {} (since {})\n",
        report.mode,
        report.mode_since.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out.push_str("Backends:\n");
    for backend in &report.backends {
        let status = match (&backend.error, backend.latency_ms) {
            (Some(error), _) => format!("UNREACHABLE ({})", error),
            (None, Some(latency)) => format!("ok ({:.1} ms)", latency),
            (None, None) => "ok".to_string(),
        };
        out.push_str(&format!("  {:<12}{}\n", backend.kind.to_string(), status));
    }
    out.push_str(&format!("Queued:     {}\n", report.queued_total));

    let c = &report.counters;
    out.push_str(&format!(
        "Counters:   grants={} contentions={} timeouts={} deadlocks_broken={} backend_errors={}\n",
        c.grants, c.contentions, c.timeouts, c.deadlocks_broken, c.backend_errors
    ));
    out
}
