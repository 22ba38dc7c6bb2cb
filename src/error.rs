// src/error.rs

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SvyError>;

/// Errors raised by the estimation engine.
///
/// Anything that would change the statistical meaning of a result without
/// being visible to the caller is *not* modelled here: recoverable
/// conditions (method fallback, excluded units, clamped probabilities)
/// are reported through [`Diagnostic`] payloads attached to results.
#[derive(Error, Debug)]
pub enum SvyError {
    /// A structural invariant of the sampling design is violated.
    #[error("design invariant violated for `{field}`: {detail} ({n_affected} row(s) affected)")]
    Design {
        field: String,
        detail: String,
        n_affected: usize,
    },

    /// A response or grouping column is missing or unusable.
    #[error("estimand column `{column}`: {detail}")]
    Estimand { column: String, detail: String },

    /// The requested variance strategy cannot run on this design.
    ///
    /// The engine recovers from this internally by falling back to
    /// linearization; it only surfaces when a replicate-weight builder is
    /// called directly.
    #[error("variance method `{requested}` unavailable: {reason}")]
    MethodUnavailable { requested: String, reason: String },

    /// A declared-but-unimplemented feature was requested.
    #[error("not yet supported: {0}")]
    Unsupported(String),

    /// No overlapping groups between two result sets being combined.
    #[error("no overlapping groups between effort and CPUE results")]
    EmptyJoin,

    /// An argument is outside its documented range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Column(#[from] polars::error::PolarsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warning,
    Fatal,
}

/// Machine-readable category of a diagnostic finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticCode {
    /// Units dropped before estimation (missing response, non-positive
    /// weight, undefined per-unit ratio, null group key).
    ExcludedUnits,
    /// Inclusion probabilities outside (0, 1] were clamped.
    ClampedProbability,
    /// The requested variance method was replaced by linearization.
    MethodFallback,
    /// Lonely-PSU strata contributed grand-mean-centred deviations.
    LonelyPsuAdjusted,
    /// A group had fewer than 3 units; its result is unstable.
    UnstableGroup,
    /// Some groups were dropped in a combine() join.
    PartialGroupJoin,
    /// Some requested category columns are absent from the data.
    MissingCategories,
    /// A negative variance component was clamped to zero.
    ComponentClamped,
    /// A group could not be estimated at all.
    GroupFailed,
}

/// A non-fatal (or group-local fatal) finding attached to a result.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub message: String,
    pub n_affected: usize,
}

impl Diagnostic {
    pub fn warning(code: DiagnosticCode, message: impl Into<String>, n_affected: usize) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            message: message.into(),
            n_affected,
        }
    }

    pub fn fatal(code: DiagnosticCode, message: impl Into<String>, n_affected: usize) -> Self {
        Self {
            severity: Severity::Fatal,
            code,
            message: message.into(),
            n_affected,
        }
    }
}
