//! chartmend core library
//!
//! Policy rules for Helm charts plus the AI remediation pipeline that
//! stages, verifies and applies fixes for the violations they report.

pub mod applier;
pub mod config;
pub mod domain;
pub mod llm;
pub mod obs;
pub mod orchestrator;
pub mod pipeline;
pub mod process;
pub mod protocol;
pub mod render;
pub mod rules;
pub mod staging;
pub mod telemetry;
pub mod tree;
pub mod values;
pub mod verifier;

pub use domain::{
    AnalysisSource, BundleVerification, Category, ChartInfo, ChartmendError, Result, RuleError,
    Severity, VerificationResult, VerificationStatus, Violation, WorkloadSpec,
};

pub use config::{AnalysisSourceSetting, ConfigError, FixMode, OptimizerSettings, ProviderSetting};

pub use rules::{
    ChartReport, FixOptions, Rule, RuleFailure, RuleRegistry, RuleThresholds, RulesEngine,
};

pub use render::{ChartRenderer, HelmRenderer, RenderErrorKind, RenderResult};

pub use protocol::{
    check_coverage, parse_full_fix, parse_structured_patch, FullFixResponse, PatchFile,
    PatchResult, ProtocolError, StructuredPatchResponse,
};

pub use llm::{CliLlmRunner, LlmCliResult, LlmDirectEditResult, LlmInvoker, LlmProvider};

pub use orchestrator::{
    AiFixOrchestrator, AiFullFixResult, AttemptState, BatchOutcome, FixRequest, FixStatus,
};
pub use staging::{StagedArtifact, StagingError};
pub use verifier::FixVerifier;
pub use applier::{ApplyErrorKind, ApplyResult, ApplyStatus, FixApplier};
pub use pipeline::{analyze_chart, analyze_charts, discover_charts};
pub use values::apply_values_patch;

/// chartmend version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
