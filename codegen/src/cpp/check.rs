//! The vectorization-legality checker.
//!
//! A non-emitting dry run over the fused node group: every replayed
//! operation is screened against the vector op tables, and anything the
//! vector kernel could not emit flips a single monotonic verdict to "not
//! vectorizable". The checker owns all of its state; running it has no
//! effect on the session from the caller's point of view.
//!
//! The dry run uses the real iteration-variable bindings, not a shape-only
//! abstraction: access legality depends on the concrete index algebra.

use std::rc::Rc;

use weft_dtype::DType;
use weft_ir::{
    Bindings, BinaryOp, ConstValue, Expr, Op, OpsHandler, RandKind, ReduceOp, StoreMode, UnaryOp,
    eval,
};

use super::kernel::IterSpace;
use super::ops::vec;
use crate::error::{Error, Result};
use crate::session::GraphInfo;

pub struct CppVecChecker {
    graph: Rc<GraphInfo>,
    space: Option<IterSpace>,
    simd_vec: bool,
    indirect_counter: usize,
}

impl CppVecChecker {
    pub fn new(graph: Rc<GraphInfo>) -> CppVecChecker {
        CppVecChecker { graph, space: None, simd_vec: true, indirect_counter: 0 }
    }

    pub fn set_ranges(&mut self, iter: &[i64], reduce: &[i64]) -> Result<(Vec<Expr>, Vec<Expr>)> {
        IterSpace::bind(&mut self.space, iter, reduce)
    }

    /// The verdict. Monotonic: once false it stays false for the rest of
    /// the dry run.
    pub fn simd_vec(&self) -> bool {
        self.simd_vec
    }

    fn disallow(&mut self, reason: &str) {
        if self.simd_vec {
            tracing::debug!(reason, "vectorization rejected");
        }
        self.simd_vec = false;
    }

    /// The innermost variable's effect on the index must be absent
    /// (broadcast) or exactly a unit step.
    fn could_vec(&self, index: &Expr) -> bool {
        let Some(space) = &self.space else { return false };
        let Some(Expr::Var(innermost)) = space.itervars.last() else {
            // not a loop at all
            return false;
        };
        index.is_invariant_in(innermost) || index.is_unit_stride_in(innermost)
    }
}

impl OpsHandler for CppVecChecker {
    type Value = ();
    type Error = Error;

    fn constant(&mut self, _value: ConstValue, dtype: DType) -> Result<()> {
        if !matches!(dtype, DType::Float32 | DType::Int32) {
            self.disallow("constant dtype");
        }
        Ok(())
    }

    fn load(&mut self, buffer: &str, index: &Expr) -> Result<()> {
        let dtype = self.graph.dtype_of(buffer)?;
        if !matches!(dtype, DType::Float32 | DType::Bool | DType::UInt8) {
            self.disallow("load dtype");
            return Ok(());
        }
        if !self.could_vec(index) {
            self.disallow("load access pattern");
        }
        Ok(())
    }

    fn store(&mut self, buffer: &str, index: &Expr, _value: (), mode: StoreMode) -> Result<()> {
        let dtype = self.graph.dtype_of(buffer)?;
        if dtype != DType::Float32 {
            self.disallow("store dtype");
            return Ok(());
        }
        if mode != StoreMode::Plain {
            self.disallow("store mode");
            return Ok(());
        }
        if !self.could_vec(index) {
            self.disallow("store access pattern");
        }
        Ok(())
    }

    fn reduction(
        &mut self,
        _buffer: &str,
        dtype: DType,
        src_dtype: DType,
        op: ReduceOp,
        _index: &Expr,
        _value: (),
    ) -> Result<()> {
        let supported = matches!(op, ReduceOp::Sum | ReduceOp::Min | ReduceOp::Max)
            && dtype == DType::Float32
            && src_dtype == DType::Float32;
        if !supported {
            self.disallow("reduction kind/dtype");
        }
        Ok(())
    }

    fn unary(&mut self, op: UnaryOp, _src: ()) -> Result<()> {
        if !vec::supports_unary(op) {
            self.disallow(op.as_ref());
        }
        Ok(())
    }

    fn binary(&mut self, op: BinaryOp, _lhs: (), _rhs: ()) -> Result<()> {
        if !vec::supports_binary(op) {
            self.disallow(op.as_ref());
        }
        Ok(())
    }

    fn select(&mut self, _cond: (), _then: (), _other: ()) -> Result<()> {
        Ok(())
    }

    fn cast(&mut self, _src: (), dtype: DType) -> Result<()> {
        if dtype != DType::Bool {
            self.disallow("to_dtype");
        }
        Ok(())
    }

    fn index_expr(&mut self, _expr: &Expr, _dtype: DType) -> Result<()> {
        self.disallow("index_expr");
        Ok(())
    }

    fn indirect_indexing(&mut self, _value: ()) -> Result<Expr> {
        self.disallow("indirect_indexing");
        let n = self.indirect_counter;
        self.indirect_counter += 1;
        Ok(Expr::var(format!("indirect{n}")))
    }

    fn rand(
        &mut self,
        _kind: RandKind,
        _seed: &Expr,
        _offset: &Expr,
        _dtype: DType,
    ) -> Result<()> {
        self.disallow("rand");
        Ok(())
    }

    fn masked(&mut self, _mask: (), body: &Op, bindings: &Bindings, _other: f64) -> Result<()> {
        // accepted structurally, but the body is still screened op by op
        eval(body, bindings, self)
    }
}
