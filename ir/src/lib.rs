//! Intermediate representation for the weft code generator.
//!
//! # Module Organization
//!
//! - [`expr`] - Symbolic integer index expressions and affine linearization
//! - [`types`] - Operation kind tags and constant values
//! - [`node`] - Fused-node operation records and the [`OpsHandler`] trait
//! - [`error`] - Error types and result handling

pub mod error;
pub mod expr;
pub mod node;
pub mod types;


pub use error::{Error, Result};
pub use expr::{Atom, Expr, LinearExpr};
pub use node::{Bindings, FusedNode, Group, Op, OpsHandler, Stmt, eval};
pub use types::{BinaryOp, ConstValue, RandKind, ReduceOp, StoreMode, UnaryOp};

// Re-export the dtype crate the way downstream crates consume it.
pub use weft_dtype::DType;
