//! Render-based verification of staged fixes.
//!
//! The source chart and the staged copy are rendered side by side, rebuilt
//! into workloads, and the target rule is evaluated against both.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::config::OptimizerSettings;
use crate::domain::{
    BundleVerification, ChartInfo, RuleError, VerificationResult, VerificationStatus, Violation,
};
use crate::obs;
use crate::render::{ChartRenderer, RenderResult};
use crate::rules::{Rule, RulesEngine};
use crate::staging::StagedArtifact;

const PARENT_ONLY_SUGGESTION: &str =
    "Rendered without sub-charts; violations that only exist in sub-charts may be hidden.";
const VENDOR_SUGGESTION: &str =
    "Vendor chart dependencies (helm dependency build) to enable a full render.";

/// Both sides of a verification render.
struct RenderPair {
    before: Result<ChartInfo, String>,
    after: Result<ChartInfo, String>,
    parent_only: bool,
    parent_only_attempted: bool,
}

pub struct FixVerifier {
    engine: Arc<RulesEngine>,
    renderer: Arc<dyn ChartRenderer>,
    enabled: bool,
    timeout: Duration,
}

impl FixVerifier {
    pub fn new(
        engine: Arc<RulesEngine>,
        renderer: Arc<dyn ChartRenderer>,
        settings: &OptimizerSettings,
    ) -> Self {
        Self {
            engine,
            renderer,
            enabled: settings.verify_fixes_with_render,
            timeout: settings.helm_timeout(),
        }
    }

    /// Check whether the staged fix clears `violation`.
    #[instrument(skip_all, fields(rule_id = %violation.rule_id, workload = %violation.workload))]
    pub async fn verify(
        &self,
        artifact: &StagedArtifact,
        violation: &Violation,
    ) -> VerificationResult {
        if !self.enabled {
            return VerificationResult::not_run("Render verification is disabled.");
        }
        let pair = self.render_pair(artifact).await;
        self.judge(&pair, violation)
    }

    /// Verify every violation a staged bundle claims to address.
    #[instrument(
        skip_all,
        fields(chart = %artifact.source_chart_dir.display(), violations = violations.len())
    )]
    pub async fn verify_bundle(
        &self,
        artifact: &StagedArtifact,
        violations: &[Violation],
    ) -> BundleVerification {
        let chart_label = artifact.source_chart_dir.display().to_string();
        if !self.enabled {
            let per = violations
                .iter()
                .map(|v| (v.key(), VerificationResult::not_run("Render verification is disabled.")))
                .collect();
            let bundle = BundleVerification::aggregate(per, Vec::new(), false);
            obs::emit_verify_completed(&chart_label, &bundle.status.to_string(), violations.len());
            return bundle;
        }

        let pair = self.render_pair(artifact).await;
        let per: BTreeMap<String, VerificationResult> = violations
            .iter()
            .map(|v| (v.key(), self.judge(&pair, v)))
            .collect();
        let introduced = match (&pair.before, &pair.after) {
            (Ok(before), Ok(after)) => self.introduced_rules(before, after),
            _ => Vec::new(),
        };
        let bundle = BundleVerification::aggregate(per, introduced, pair.parent_only);
        obs::emit_verify_completed(&chart_label, &bundle.status.to_string(), violations.len());
        bundle
    }

    /// Store `result` on `violation`.
    pub fn record(violation: &mut Violation, result: VerificationResult) {
        violation.record_verification(result);
    }

    /// Store each bundle entry on the violation it belongs to.
    pub fn record_bundle(violations: &mut [Violation], bundle: &BundleVerification) {
        for violation in violations {
            if let Some(result) = bundle.per_violation.get(&violation.key()) {
                violation.record_verification(result.clone());
            }
        }
    }

    async fn render_pair(&self, artifact: &StagedArtifact) -> RenderPair {
        let source_values = artifact.source_values_file();
        let staged_values = artifact.staged_values_file();
        let (before, after) = tokio::join!(
            self.renderer
                .render(&artifact.source_chart_dir, &source_values, self.timeout),
            self.renderer
                .render(&artifact.staged_chart_dir, &staged_values, self.timeout),
        );
        debug!(before_ok = before.ok, after_ok = after.ok, "verification renders finished");
        RenderPair {
            parent_only: before.parent_only_render || after.parent_only_render,
            parent_only_attempted: before.parent_only_render_attempted
                || after.parent_only_render_attempted,
            before: to_chart(&before, "before"),
            after: to_chart(&after, "after"),
        }
    }

    fn judge(&self, pair: &RenderPair, violation: &Violation) -> VerificationResult {
        let mut result = self.judge_inner(pair, violation);
        if pair.parent_only {
            result.suggestions.push(PARENT_ONLY_SUGGESTION.to_string());
        }
        result
    }

    fn judge_inner(&self, pair: &RenderPair, violation: &Violation) -> VerificationResult {
        let (before, after) = match (&pair.before, &pair.after) {
            (Ok(before), Ok(after)) => (before, after),
            (Err(e), _) | (_, Err(e)) => {
                let mut result = VerificationResult::unverified(e.clone());
                if pair.parent_only_attempted {
                    result.suggestions.push(VENDOR_SUGGESTION.to_string());
                }
                return result;
            }
        };
        let Some(rule) = self.engine.registry().get(&violation.rule_id) else {
            return VerificationResult::unverified(format!(
                "Unknown rule {}; cannot verify.",
                violation.rule_id
            ));
        };

        let fires = |chart: &ChartInfo| rule_fires(rule.as_ref(), chart, &violation.workload);
        let (before_hit, after_hit) = match (fires(before), fires(after)) {
            (Ok(b), Ok(a)) => (b, a),
            (Err(e), _) | (_, Err(e)) => {
                return VerificationResult::unverified(format!("Rule evaluation failed: {e}"));
            }
        };

        let (status, note) = match (before_hit, after_hit) {
            (_, true) => (
                VerificationStatus::Unresolved,
                format!("{} still fires after the fix.", violation.rule_id),
            ),
            (true, false) => (
                VerificationStatus::Verified,
                format!("{} cleared by the fix.", violation.rule_id),
            ),
            (false, false) => (
                VerificationStatus::Unverified,
                format!(
                    "{} did not fire on the rendered baseline; the fix could not be confirmed.",
                    violation.rule_id
                ),
            ),
        };
        VerificationResult {
            status,
            note,
            before_has_violation: Some(before_hit),
            after_has_violation: Some(after_hit),
            suggestions: Vec::new(),
        }
    }

    fn introduced_rules(&self, before: &ChartInfo, after: &ChartInfo) -> Vec<String> {
        introduced_rules(&self.engine, before, after)
    }
}

/// Rule ids with a `(rule, workload)` hit after the fix that was absent
/// before it, deduplicated and sorted.
fn introduced_rules(engine: &RulesEngine, before: &ChartInfo, after: &ChartInfo) -> Vec<String> {
    let hits = |chart: &ChartInfo| -> BTreeSet<(String, String)> {
        engine
            .evaluate_chart(chart)
            .violations
            .into_iter()
            .map(|v| (v.rule_id, v.workload))
            .collect()
    };
    let before_hits = hits(before);
    hits(after)
        .into_iter()
        .filter(|hit| !before_hits.contains(hit))
        .map(|(rule_id, _)| rule_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn to_chart(rendered: &RenderResult, side: &str) -> Result<ChartInfo, String> {
    if !rendered.ok {
        return Err(format!("Render failed ({side}): {}", rendered.error_summary()));
    }
    ChartInfo::from_rendered(
        &rendered.chart_dir,
        &rendered.values_file,
        &rendered.docs,
        rendered.parent_only_render,
    )
    .map_err(|e| format!("Rendered chart unreadable ({side}): {e}"))
}

/// Whether `rule` fires on the workload labelled `workload`, or on any
/// workload when the label is not present in the render.
fn rule_fires(rule: &dyn Rule, chart: &ChartInfo, workload: &str) -> Result<bool, RuleError> {
    let matching: Vec<_> = chart
        .workloads
        .iter()
        .filter(|w| w.workload == workload)
        .collect();
    let targets: Vec<_> = if matching.is_empty() {
        chart.workloads.iter().collect()
    } else {
        matching
    };
    for target in targets {
        if !rule.evaluate(target)?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}
