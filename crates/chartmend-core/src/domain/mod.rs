//! Domain model: charts, workloads, violations and verification outcomes.

pub mod chart;
pub mod error;
pub mod quantity;
pub mod verification;
pub mod violation;
pub mod workload;

pub use chart::{load_values, read_chart_name, rel_path, AnalysisSource, ChartInfo};
pub use error::{ChartmendError, Result, RuleError};
pub use verification::{BundleVerification, VerificationResult, VerificationStatus};
pub use violation::{Category, Severity, Violation};
pub use workload::{IntOrString, PdbSpec, ProbeSet, ResourceSpec, WorkloadSpec, VALUES_WORKLOAD};
