//! chartmend - Helm chart policy checks and AI-assisted remediation
//!
//! ## Commands
//!
//! - `check`: Evaluate policy rules against one or more charts
//! - `autofix`: Apply deterministic rule fixes to a values file
//! - `fix`: Generate, verify and optionally apply an AI fix bundle
//! - `preview`: Ask for a targeted patch for a single rule
//! - `providers`: Show which LLM CLIs are installed
//! - `prompt-template`: Print or validate a full-fix system prompt

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use chartmend_core::llm::LlmProvider;
use chartmend_core::protocol::{
    default_full_fix_template, format_patch_preview_markdown, validate_prompt_template,
};
use chartmend_core::values::merge_json_overlay;
use chartmend_core::{
    analyze_chart, analyze_charts, apply_values_patch, discover_charts, AiFixOrchestrator,
    ApplyResult, BundleVerification, ChartInfo, CliLlmRunner, FixApplier, FixMode, FixRequest,
    FixStatus, FixVerifier, HelmRenderer, OptimizerSettings, ProviderSetting, RulesEngine,
    Severity, Violation,
};

#[derive(Parser)]
#[command(name = "chartmend")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Helm chart policy checks and AI-assisted remediation", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Settings file (.toml or .json)
    #[arg(short, long, global = true, env = "CHARTMEND_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate policy rules against charts
    Check {
        /// Chart directory, or a directory containing charts
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Values file (single chart only; default: <chart>/values.yaml)
        #[arg(long)]
        values: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Exit non-zero when any error-severity violation is found
        #[arg(long)]
        strict: bool,
    },

    /// Apply deterministic rule fixes directly to a values file
    Autofix {
        chart: PathBuf,

        #[arg(long)]
        values: Option<PathBuf>,

        /// Only fix these rule ids
        #[arg(long = "rule")]
        rules: Vec<String>,

        /// Print the overlay instead of writing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Generate an AI fix bundle, verify it, and optionally apply it
    Fix {
        /// Chart directories, or directories containing charts
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Only fix these rule ids
        #[arg(long = "rule")]
        rules: Vec<String>,

        /// Override the configured provider (codex, claude, auto)
        #[arg(long)]
        provider: Option<String>,

        /// Let the provider edit a staged copy instead of answering in JSON
        #[arg(long)]
        direct_edit: bool,

        /// Stage with rule fix generators only, no LLM
        #[arg(long)]
        deterministic: bool,

        /// Write verified bundles back into the chart
        #[arg(long)]
        apply: bool,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Ask for a targeted patch for one rule and print it
    Preview {
        chart: PathBuf,

        /// Rule id to resolve
        #[arg(long)]
        rule: String,

        #[arg(long)]
        values: Option<PathBuf>,
    },

    /// Show which LLM CLIs are installed
    Providers,

    /// Print the default full-fix system prompt, or validate one
    PromptTemplate {
        /// Template file to validate
        #[arg(long)]
        validate: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    chartmend_core::telemetry::init_tracing(cli.json, level);

    let settings = load_settings(cli.config.as_deref())?;
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match cli.command {
        Commands::Check {
            path,
            values,
            format,
            strict,
        } => cmd_check(&settings, &cancel, &path, values.as_deref(), format, strict).await,
        Commands::Autofix {
            chart,
            values,
            rules,
            dry_run,
        } => cmd_autofix(&settings, &cancel, &chart, values.as_deref(), &rules, dry_run).await,
        Commands::Fix {
            paths,
            rules,
            provider,
            direct_edit,
            deterministic,
            apply,
            format,
        } => {
            let mut settings = settings;
            if let Some(provider) = provider {
                settings.ai_fix_llm_provider = parse_provider_setting(&provider)?;
            }
            if direct_edit {
                settings.ai_fix_mode = FixMode::DirectEdit;
            }
            let opts = FixOpts {
                rules,
                deterministic,
                apply,
                format,
            };
            cmd_fix(&settings, &cancel, &paths, &opts).await
        }
        Commands::Preview {
            chart,
            rule,
            values,
        } => cmd_preview(&settings, &cancel, &chart, values.as_deref(), &rule).await,
        Commands::Providers => cmd_providers(&settings),
        Commands::PromptTemplate { validate } => cmd_prompt_template(validate.as_deref()),
    }
}

fn load_settings(path: Option<&Path>) -> Result<OptimizerSettings> {
    let settings = match path {
        Some(path) => OptimizerSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => OptimizerSettings::default(),
    };
    let settings = settings
        .apply_env_overrides()
        .context("Invalid CHARTMEND_* override")?;
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

fn parse_provider_setting(raw: &str) -> Result<ProviderSetting> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "auto" => Ok(ProviderSetting::Auto),
        other => match other.parse::<LlmProvider>() {
            Ok(LlmProvider::Codex) => Ok(ProviderSetting::Codex),
            Ok(LlmProvider::Claude) => Ok(ProviderSetting::Claude),
            Err(e) => bail!(e),
        },
    }
}

fn build_engine(settings: &OptimizerSettings) -> Arc<RulesEngine> {
    Arc::new(RulesEngine::from_settings(settings))
}

fn build_renderer(settings: &OptimizerSettings, cancel: &CancellationToken) -> Arc<HelmRenderer> {
    Arc::new(HelmRenderer::from_settings(settings).with_cancellation(cancel.clone()))
}

/// A directory with a Chart.yaml is one chart; anything else is searched.
fn resolve_charts(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut charts = Vec::new();
    for path in paths {
        if path.join("Chart.yaml").is_file() {
            charts.push(path.clone());
        } else {
            charts.extend(discover_charts(path));
        }
    }
    charts.dedup();
    charts
}

fn filter_rules(violations: Vec<Violation>, rules: &[String]) -> Vec<Violation> {
    if rules.is_empty() {
        return violations;
    }
    violations
        .into_iter()
        .filter(|v| rules.iter().any(|r| r.eq_ignore_ascii_case(&v.rule_id)))
        .collect()
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CheckOutput {
    charts: usize,
    violations: Vec<Violation>,
    rule_failures: Vec<chartmend_core::RuleFailure>,
    errors: Vec<String>,
}

async fn cmd_check(
    settings: &OptimizerSettings,
    cancel: &CancellationToken,
    path: &Path,
    values: Option<&Path>,
    format: OutputFormat,
    strict: bool,
) -> Result<()> {
    let engine = build_engine(settings);
    let renderer = build_renderer(settings, cancel);

    let mut charts: Vec<ChartInfo> = Vec::new();
    let mut errors = Vec::new();
    if values.is_some() || path.join("Chart.yaml").is_file() {
        charts.push(analyze_chart(settings, renderer.as_ref(), path, values).await?);
    } else {
        let dirs = discover_charts(path);
        if dirs.is_empty() {
            bail!("No charts found under {}", path.display());
        }
        for (dir, info) in analyze_charts(settings, renderer.as_ref(), &dirs).await {
            match info {
                Ok(chart) => charts.push(chart),
                Err(e) => errors.push(format!("{}: {e}", dir.display())),
            }
        }
    }

    let reports = engine.evaluate_all_charts(&charts);
    let output = CheckOutput {
        charts: charts.len(),
        violations: reports.iter().flat_map(|r| r.violations.clone()).collect(),
        rule_failures: reports.into_iter().flat_map(|r| r.rule_failures).collect(),
        errors,
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Text => print_check_text(&output),
    }

    let has_errors = output.violations.iter().any(|v| v.severity == Severity::Error);
    if strict && has_errors {
        bail!("error-severity violations found");
    }
    Ok(())
}

fn print_check_text(output: &CheckOutput) {
    println!("Checked {} chart(s): {} violation(s)", output.charts, output.violations.len());
    for v in &output.violations {
        println!(
            "  [{:?}] {} {} {}: {}",
            v.severity, v.chart_name, v.rule_id, v.workload, v.description
        );
        if !v.recommended_value.is_empty() {
            println!("      current: {}  recommended: {}", v.current_value, v.recommended_value);
        }
    }
    for f in &output.rule_failures {
        println!("  rule failure: {} {} {}: {}", f.chart_name, f.rule_id, f.workload, f.message);
    }
    for e in &output.errors {
        println!("  error: {e}");
    }
}

// ---------------------------------------------------------------------------
// autofix
// ---------------------------------------------------------------------------

async fn cmd_autofix(
    settings: &OptimizerSettings,
    cancel: &CancellationToken,
    chart_dir: &Path,
    values: Option<&Path>,
    rules: &[String],
    dry_run: bool,
) -> Result<()> {
    let engine = build_engine(settings);
    let renderer = build_renderer(settings, cancel);
    let chart = analyze_chart(settings, renderer.as_ref(), chart_dir, values).await?;
    let violations = filter_rules(engine.check_chart(&chart), rules);

    let mut overlay = serde_json::Map::new();
    let mut fixed = 0usize;
    for violation in &violations {
        if let Some(serde_json::Value::Object(fix)) =
            engine.generate_fix(&chart, violation, &settings.fix_options)
        {
            merge_json_overlay(&mut overlay, &fix);
            fixed += 1;
        }
    }
    if overlay.is_empty() {
        println!("No deterministic fixes available ({} violation(s)).", violations.len());
        return Ok(());
    }

    if dry_run {
        print!("{}", serde_yaml::to_string(&overlay)?);
        return Ok(());
    }
    apply_values_patch(&chart.values_file, &overlay)
        .with_context(|| format!("Failed to update {}", chart.values_file.display()))?;
    info!(fixed, values = %chart.values_file.display(), "deterministic fixes applied");
    println!(
        "Applied {fixed} fix(es) of {} violation(s) to {}",
        violations.len(),
        chart.values_file.display()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// fix
// ---------------------------------------------------------------------------

struct FixOpts {
    rules: Vec<String>,
    deterministic: bool,
    apply: bool,
    format: OutputFormat,
}

#[derive(Serialize)]
struct FixReport {
    chart: String,
    status: FixStatus,
    note: String,
    provider: Option<LlmProvider>,
    changed_files: Vec<String>,
    verification: Option<BundleVerification>,
    apply: Option<ApplyResult>,
    errors: Vec<String>,
}

async fn cmd_fix(
    settings: &OptimizerSettings,
    cancel: &CancellationToken,
    paths: &[PathBuf],
    opts: &FixOpts,
) -> Result<()> {
    let engine = build_engine(settings);
    let renderer = build_renderer(settings, cancel);
    let llm = Arc::new(CliLlmRunner::from_settings(settings));
    let orchestrator =
        AiFixOrchestrator::new(engine.clone(), llm).with_renderer(renderer.clone());
    let verifier = FixVerifier::new(engine.clone(), renderer.clone(), settings);
    let applier = FixApplier::new();

    let dirs = resolve_charts(paths);
    if dirs.is_empty() {
        bail!("No charts found");
    }

    let mut requests = Vec::new();
    let mut reports = Vec::new();
    for (dir, info) in analyze_charts(settings, renderer.as_ref(), &dirs).await {
        let chart = match info {
            Ok(chart) => chart,
            Err(e) => {
                warn!(chart = %dir.display(), error = %e, "skipping chart");
                continue;
            }
        };
        let violations = filter_rules(engine.check_chart(&chart), &opts.rules);
        if violations.is_empty() {
            reports.push(FixReport {
                chart: chart.name.clone(),
                status: FixStatus::NoChange,
                note: "No violations.".to_string(),
                provider: None,
                changed_files: Vec::new(),
                verification: None,
                apply: None,
                errors: Vec::new(),
            });
            continue;
        }
        requests.push(FixRequest { chart, violations });
    }

    let results = if opts.deterministic {
        requests
            .iter()
            .map(|r| {
                orchestrator.build_deterministic_fix(&r.chart, &r.violations, &settings.fix_options)
            })
            .collect::<Vec<_>>()
    } else {
        let batch = orchestrator
            .generate_full_fix_batch(requests.clone(), settings, cancel)
            .await;
        for chart in &batch.not_started {
            warn!(chart = %chart, "not started");
        }
        batch.results
    };

    for result in results {
        let Some(request) = requests.iter_mut().find(|r| r.chart.name == result.chart_name) else {
            continue;
        };
        let mut report = FixReport {
            chart: result.chart_name.clone(),
            status: result.status,
            note: result.note.clone(),
            provider: result.provider,
            changed_files: Vec::new(),
            verification: None,
            apply: None,
            errors: result.errors.clone(),
        };
        if let Some(artifact) = result.staged_artifact.as_ref() {
            report.changed_files = artifact.changed_rel_paths.clone();
            let bundle = verifier.verify_bundle(artifact, &request.violations).await;
            FixVerifier::record_bundle(&mut request.violations, &bundle);
            if opts.apply {
                report.apply =
                    Some(applier.apply_bundle(artifact, &bundle, &request.chart.chart_dir));
            }
            report.verification = Some(bundle);
        }
        reports.push(report);
    }

    match opts.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        OutputFormat::Text => reports.iter().for_each(print_fix_text),
    }
    Ok(())
}

fn print_fix_text(report: &FixReport) {
    println!("{}: {} - {}", report.chart, report.status.as_str(), report.note);
    for file in &report.changed_files {
        println!("  changed: {file}");
    }
    if let Some(v) = &report.verification {
        println!("  verification: {} ({})", v.status, v.note);
    }
    if let Some(a) = &report.apply {
        if a.ok {
            println!("  applied: {}", a.touched_files.join(", "));
        } else {
            println!("  not applied: {}", a.errors.join("; "));
        }
    }
    for e in &report.errors {
        println!("  error: {e}");
    }
}

// ---------------------------------------------------------------------------
// preview / providers / prompt-template
// ---------------------------------------------------------------------------

async fn cmd_preview(
    settings: &OptimizerSettings,
    cancel: &CancellationToken,
    chart_dir: &Path,
    values: Option<&Path>,
    rule: &str,
) -> Result<()> {
    let engine = build_engine(settings);
    let renderer = build_renderer(settings, cancel);
    let chart = analyze_chart(settings, renderer.as_ref(), chart_dir, values).await?;
    let violations = filter_rules(engine.check_chart(&chart), &[rule.to_string()]);
    let Some(violation) = violations.first() else {
        println!("{} reports no violation for {}", rule, chart.name);
        return Ok(());
    };

    let llm = Arc::new(CliLlmRunner::from_settings(settings));
    let orchestrator = AiFixOrchestrator::new(engine, llm);
    match orchestrator.preview_patch(&chart, violation, settings, cancel).await {
        Ok((provider, response)) => {
            println!("Provider: {provider}\n");
            println!("{}", format_patch_preview_markdown(&response));
            Ok(())
        }
        Err(e) => bail!(e),
    }
}

fn cmd_providers(settings: &OptimizerSettings) -> Result<()> {
    let runner = CliLlmRunner::from_settings(settings);
    let chain = settings.provider_chain();
    for cap in runner.detect_capabilities() {
        let location = cap
            .resolved
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "not found".to_string());
        let marker = if chain.contains(&cap.provider) { "*" } else { " " };
        println!("{marker} {:<7} {} -> {location}", cap.provider, cap.binary.display());
    }
    Ok(())
}

fn cmd_prompt_template(validate: Option<&Path>) -> Result<()> {
    let Some(path) = validate else {
        println!("{}", default_full_fix_template());
        return Ok(());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read template {}", path.display()))?;
    match validate_prompt_template(&text) {
        Ok(()) => {
            println!("Template OK");
            Ok(())
        }
        Err(missing) => bail!("Template is missing required tokens: {}", missing.join(", ")),
    }
}
