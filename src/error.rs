//! Rich diagnostic error types for the arcmarg engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so callers know exactly which precondition
//! was violated. All failures are synchronous precondition checks — there is no
//! retry concept inside this crate.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the arcmarg engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum ArcmargError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Chart(#[from] ChartError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Infer(#[from] InferError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Train(#[from] TrainError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Decode(#[from] DecodeError),
}

// ---------------------------------------------------------------------------
// Chart errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ChartError {
    #[error("chart dimension mismatch: expected n = {expected}, got n = {actual}")]
    #[diagnostic(
        code(arcmarg::chart::dim_mismatch),
        help(
            "All charts in one inference call must share the same sequence \
             length n (tokens including the root position). Check that the \
             unary, triplet, mask, and gold charts were built for the same \
             sentence."
        )
    )]
    DimMismatch { expected: usize, actual: usize },

    #[error("chart is empty: n must be at least 1")]
    #[diagnostic(
        code(arcmarg::chart::empty),
        help(
            "A sentence chart always contains the reserved root position at \
             index 0, so n = 0 is never valid."
        )
    )]
    Empty,

    #[error("data length {len} does not match the expected {expected} entries for n = {n}")]
    #[diagnostic(
        code(arcmarg::chart::data_len),
        help(
            "Charts are dense and row-major: an arc chart holds n*n entries, \
             a triplet chart n*n*n. Rebuild the input buffer with the right \
             length."
        )
    )]
    DataLen { n: usize, expected: usize, len: usize },

    #[error("label chart has {actual} label scores per arc, expected {expected}")]
    #[diagnostic(
        code(arcmarg::chart::label_dim),
        help(
            "The label-score chart must carry the same number of labels at \
             every arc position. Check the scorer's label vocabulary size."
        )
    )]
    LabelDim { expected: usize, actual: usize },
}

// ---------------------------------------------------------------------------
// Inference errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum InferError {
    #[error("gradient trace has {got} entries but the inference trace has {expected}")]
    #[diagnostic(
        code(arcmarg::infer::trace_len),
        help(
            "The backward pass consumes one logit-gradient chart per traced \
             iteration. Produce the gradients from the same InferenceRun that \
             is being replayed."
        )
    )]
    TraceLen { expected: usize, got: usize },

    #[error("inference run was produced by the {run} strategy, not {engine}")]
    #[diagnostic(
        code(arcmarg::infer::strategy_mismatch),
        help(
            "A run can only be replayed backward by the strategy that produced \
             it — the replay state layouts differ. Use the same Engine for \
             infer() and infer_backward()."
        )
    )]
    StrategyMismatch { engine: String, run: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Chart(#[from] ChartError),
}

// ---------------------------------------------------------------------------
// Training errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TrainError {
    #[error("empty inference trace: cannot compute a loss over zero iterations")]
    #[diagnostic(
        code(arcmarg::train::empty_trace),
        help(
            "Every InferenceRun carries at least one traced marginal chart \
             (max_iter = 0 degrades to the closed-form unary case). An empty \
             trace means the run was not produced by Engine::infer()."
        )
    )]
    EmptyTrace,

    #[error("gold label {label} is outside the score chart's vocabulary of {n_labels}")]
    #[diagnostic(
        code(arcmarg::train::label_out_of_range),
        help(
            "Gold label ids must index into the label-score chart. Check that \
             the gold chart and the scorer share one label vocabulary."
        )
    )]
    LabelOutOfRange { label: i32, n_labels: usize },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Chart(#[from] ChartError),
}

// ---------------------------------------------------------------------------
// Decoding errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DecodeError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Chart(#[from] ChartError),
}

/// Convenience alias for functions returning arcmarg results.
pub type ArcmargResult<T> = std::result::Result<T, ArcmargError>;
