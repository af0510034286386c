//! Rule evaluation over one or many charts.

use serde::{Deserialize, Serialize};
use std::sync::{mpsc, Arc};
use tracing::{debug, instrument, warn};

use super::fix::{strip_fixed_fields, FixOptions};
use super::{Rule, RuleRegistry};
use crate::config::OptimizerSettings;
use crate::domain::{ChartInfo, Violation, WorkloadSpec};
use crate::obs;

/// A rule that failed to evaluate against one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub chart_name: String,
    pub rule_id: String,
    pub workload: String,
    pub message: String,
}

/// Everything one chart evaluation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartReport {
    pub chart_name: String,
    pub violations: Vec<Violation>,
    pub rule_failures: Vec<RuleFailure>,
}

/// Evaluates a [`RuleRegistry`] against charts.
///
/// With `max_workers == 0` charts are evaluated on the caller's thread;
/// otherwise on a dedicated pool of that many threads. Output always follows
/// input chart order. `fix_available` on reported violations reflects the
/// engine's [`FixOptions`].
pub struct RulesEngine {
    registry: Arc<RuleRegistry>,
    fix_options: FixOptions,
    pool: Option<rayon::ThreadPool>,
}

impl RulesEngine {
    pub fn new(registry: RuleRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            fix_options: FixOptions::default(),
            pool: None,
        }
    }

    /// Engine for a run configured by `settings`.
    pub fn from_settings(settings: &OptimizerSettings) -> Self {
        let registry = RuleRegistry::for_options(&settings.thresholds, &settings.fix_options);
        Self::new(registry)
            .with_fix_options(settings.fix_options.clone())
            .with_max_workers(settings.max_workers)
    }

    /// Options used to decide whether a violation has a deterministic fix.
    pub fn with_fix_options(mut self, options: FixOptions) -> Self {
        self.fix_options = options;
        self
    }

    /// Size the evaluation pool. A pool that cannot be built degrades to
    /// synchronous evaluation.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.pool = if max_workers == 0 {
            None
        } else {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(max_workers)
                .thread_name(|i| format!("chartmend-rules-{i}"))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(
                        error = %e,
                        max_workers,
                        "rules pool unavailable, evaluating synchronously"
                    );
                    None
                }
            }
        };
        self
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn fix_options(&self) -> &FixOptions {
        &self.fix_options
    }

    pub fn max_workers(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.current_num_threads())
    }

    // ---- single chart ----

    /// Evaluate every rule against every workload of `chart`.
    ///
    /// Rule failures are recorded and logged; they never abort the chart.
    #[instrument(skip_all, fields(chart = %chart.name))]
    pub fn evaluate_chart(&self, chart: &ChartInfo) -> ChartReport {
        let mut violations = Vec::new();
        let mut rule_failures = Vec::new();

        for rule in self.registry.iter() {
            for workload in &chart.workloads {
                match rule.evaluate(workload) {
                    Ok(findings) => {
                        let fix_available = self
                            .fix_for(rule.as_ref(), workload, &self.fix_options)
                            .is_some();
                        for finding in findings {
                            let mut v = Violation::new(
                                rule.id(),
                                rule.name(),
                                &chart.name,
                                &workload.workload,
                                finding.description,
                                finding.severity.unwrap_or_else(|| rule.severity()),
                                rule.category(),
                                chart.analysis_source,
                            );
                            v.current_value = finding.current_value;
                            v.recommended_value = finding.recommended_value;
                            v.fix_available = fix_available;
                            violations.push(v);
                        }
                    }
                    Err(e) => {
                        warn!(
                            rule_id = rule.id(),
                            workload = %workload.workload,
                            error = %e,
                            "rule evaluation failed"
                        );
                        rule_failures.push(RuleFailure {
                            chart_name: chart.name.clone(),
                            rule_id: rule.id().to_string(),
                            workload: workload.workload.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        obs::emit_chart_evaluated(&chart.name, violations.len(), rule_failures.len());
        ChartReport {
            chart_name: chart.name.clone(),
            violations,
            rule_failures,
        }
    }

    pub fn check_chart(&self, chart: &ChartInfo) -> Vec<Violation> {
        self.evaluate_chart(chart).violations
    }

    // ---- many charts ----

    pub fn evaluate_all_charts(&self, charts: &[ChartInfo]) -> Vec<ChartReport> {
        self.evaluate_with_progress(charts, |_, _, _, _| {})
    }

    pub fn check_all_charts(&self, charts: &[ChartInfo]) -> Vec<Violation> {
        self.check_all_charts_with_progress(charts, |_, _, _, _| {})
    }

    /// Like [`Self::check_all_charts`], invoking `on_chart(chart, violations,
    /// completed, total)` on the caller's thread as each chart finishes.
    pub fn check_all_charts_with_progress<F>(
        &self,
        charts: &[ChartInfo],
        on_chart: F,
    ) -> Vec<Violation>
    where
        F: FnMut(&ChartInfo, &[Violation], usize, usize),
    {
        self.evaluate_with_progress(charts, on_chart)
            .into_iter()
            .flat_map(|r| r.violations)
            .collect()
    }

    fn evaluate_with_progress<F>(&self, charts: &[ChartInfo], mut on_chart: F) -> Vec<ChartReport>
    where
        F: FnMut(&ChartInfo, &[Violation], usize, usize),
    {
        let total = charts.len();
        let Some(pool) = &self.pool else {
            return charts
                .iter()
                .enumerate()
                .map(|(i, chart)| {
                    let report = self.evaluate_chart(chart);
                    on_chart(chart, &report.violations, i + 1, total);
                    report
                })
                .collect();
        };

        let mut slots: Vec<Option<ChartReport>> = vec![None; total];
        let (tx, rx) = mpsc::channel::<(usize, ChartReport)>();
        pool.in_place_scope(|scope| {
            for (index, chart) in charts.iter().enumerate() {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let report = self.evaluate_chart(chart);
                    // Receiver outlives the scope; a send failure means the caller is gone.
                    let _ = tx.send((index, report));
                });
            }
            drop(tx);

            let mut completed = 0;
            for (index, report) in rx.iter() {
                completed += 1;
                on_chart(&charts[index], &report.violations, completed, total);
                slots[index] = Some(report);
            }
        });
        debug!(charts = total, "parallel rule evaluation complete");
        slots.into_iter().flatten().collect()
    }

    // ---- fixes ----

    /// Deterministic fix for `violation`, with protected fields stripped.
    pub fn generate_fix(
        &self,
        chart: &ChartInfo,
        violation: &Violation,
        options: &FixOptions,
    ) -> Option<serde_json::Value> {
        let rule = self.registry.get(&violation.rule_id)?;
        let workload = chart
            .workloads
            .iter()
            .find(|w| w.workload == violation.workload)
            .or_else(|| chart.workloads.first())?;
        self.fix_for(rule.as_ref(), workload, options)
    }

    fn fix_for(
        &self,
        rule: &dyn Rule,
        workload: &WorkloadSpec,
        options: &FixOptions,
    ) -> Option<serde_json::Value> {
        if !rule.auto_fixable() {
            return None;
        }
        let fix = rule.fix(workload, options)?;
        strip_fixed_fields(
            fix,
            &self.registry.thresholds().fixed_resource_fields,
            rule.id(),
        )
    }
}
