//! Error types for code generation.
//!
//! Hard failures split into two families the caller treats differently:
//! unsupported-operation and illegal-access errors trigger a scalar-only
//! fallback for the fused group, while binding and depth mismatches signal
//! upstream scheduling bugs and abort the group outright.

use smallvec::SmallVec;
use snafu::Snafu;
use weft_dtype::DType;
use weft_ir::ReduceOp;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// No codegen rule for this operation/dtype/mode combination.
    #[snafu(display("unsupported operation: {op}"))]
    UnsupportedOp { op: String },

    /// Reduction kind/dtype pair the active kernel cannot emit.
    #[snafu(display("unsupported reduction {kind:?} for {dtype:?} (source {src_dtype:?})"))]
    UnsupportedReduction { kind: ReduceOp, dtype: DType, src_dtype: DType },

    /// Access pattern violates the addressing legality of the active kernel.
    #[snafu(display("illegal data access on {buffer}[{index}]"))]
    IllegalAccess { buffer: String, index: String },

    /// Kernel re-bound to a different iteration space.
    #[snafu(display("iteration-space mismatch: kernel bound to {expected:?}, re-bound with {actual:?}"))]
    BindingMismatch { expected: SmallVec<[i64; 8]>, actual: SmallVec<[i64; 8]> },

    /// Kernel operation requested before `set_ranges`.
    #[snafu(display("kernel is not bound to an iteration space"))]
    KernelNotBound,

    /// Split or parallel depth beyond what the nest's shape supports.
    #[snafu(display("depth {depth} exceeds the loop nest (max {max})"))]
    SplitDepthExceeded { depth: usize, max: usize },

    /// Buffer name the session never declared.
    #[snafu(display("unknown buffer: {name}"))]
    UnknownBuffer { name: String },

    /// Error raised while replaying a node body.
    #[snafu(context(false), display("node replay failed: {source}"))]
    Ir { source: weft_ir::Error },
}

impl Error {
    /// Failures the caller may answer with a scalar-only fallback.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedOp { .. }
                | Error::UnsupportedReduction { .. }
                | Error::IllegalAccess { .. }
        )
    }
}
