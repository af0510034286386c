//! Structured observability hooks for the remediation lifecycle.
//!
//! Provides an attempt-scoped span guard and one emission function per
//! lifecycle event. Events are emitted at `info!` unless noted.

use tracing::{info, warn};

/// RAII guard that enters a span tagged with the fix attempt and chart.
///
/// # Example
///
/// ```ignore
/// let _span = AttemptSpan::enter(&attempt_id, "checkout-api");
/// ```
pub struct AttemptSpan {
    _span: tracing::span::EnteredSpan,
}

impl AttemptSpan {
    pub fn enter(attempt_id: &str, chart: &str) -> Self {
        Self {
            _span: attempt_span(attempt_id, chart).entered(),
        }
    }
}

/// The attempt span itself, for async code that attaches it with
/// `tracing::Instrument` instead of holding a guard across awaits.
pub fn attempt_span(attempt_id: &str, chart: &str) -> tracing::Span {
    tracing::info_span!("chartmend.fix_attempt", attempt_id = %attempt_id, chart = %chart)
}

/// Emit event: rules evaluated for one chart.
pub fn emit_chart_evaluated(chart: &str, violations: usize, rule_failures: usize) {
    info!(
        event = "rules.chart_evaluated",
        chart = %chart,
        violations = violations,
        rule_failures = rule_failures,
    );
}

/// Emit event: an AI fix attempt started.
pub fn emit_fix_started(attempt_id: &str, chart: &str, violations: usize, providers: &[String]) {
    info!(
        event = "fix.started",
        attempt_id = %attempt_id,
        chart = %chart,
        violations = violations,
        providers = %providers.join(","),
    );
}

/// Emit event: attempt state machine moved.
pub fn emit_fix_transition(attempt_id: &str, from: &str, to: &str) {
    info!(event = "fix.transition", attempt_id = %attempt_id, from = %from, to = %to);
}

/// Emit event: attempt finished.
pub fn emit_fix_finished(attempt_id: &str, status: &str, provider: Option<&str>, duration_ms: u64) {
    info!(
        event = "fix.finished",
        attempt_id = %attempt_id,
        status = %status,
        provider = %provider.unwrap_or("-"),
        duration_ms = duration_ms,
    );
}

/// Emit event: an LLM provider failed and the chain moves on (warning level).
pub fn emit_provider_failed(attempt_id: &str, provider: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "fix.provider_failed",
        attempt_id = %attempt_id,
        provider = %provider,
        error = %error
    );
}

/// Emit event: bundle verification completed.
pub fn emit_verify_completed(chart: &str, status: &str, violations: usize) {
    info!(event = "verify.completed", chart = %chart, status = %status, violations = violations);
}

/// Emit event: apply completed or failed.
pub fn emit_apply_completed(chart_dir: &str, ok: bool, touched: usize) {
    info!(event = "apply.completed", chart_dir = %chart_dir, ok = ok, touched = touched);
}
