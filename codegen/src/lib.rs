//! Code generation for weft fused kernels.
//!
//! Compiles fused element-wise/reduction node groups into multi-threaded,
//! SIMD-vectorized C++ source. The C++ backend decides how to split the
//! iteration space into a vector main loop and a scalar tail, whether
//! vectorization is legal at all, how many leading dimensions to run under
//! a work-sharing region, and how to combine reductions correctly in every
//! execution shape.
//!
//! # Usage
//!
//! ```ignore
//! use weft_codegen::{CodegenSession, CppConfig, GraphInfo, cpp::CppScheduling};
//!
//! let session = CodegenSession::new(CppConfig::default(), graph);
//! let mut scheduling = CppScheduling::new(session);
//! scheduling.codegen_nodes(&nodes)?;
//! scheduling.flush(&mut wrapper)?;
//! ```

pub mod common;
pub mod cpp;
pub mod error;
pub mod isa;
pub mod session;


pub use common::{CodeBuffer, CseCache, KernelArgs};
pub use error::{Error, Result};
pub use isa::{VecIsa, pick_vec_isa};
pub use session::{CodegenSession, Counters, CppConfig, GraphInfo};
