//! Fused-node operation records and the handler interface.
//!
//! The upstream graph builder hands the code generator an ordered list of
//! [`FusedNode`]s. Each node carries its iteration-space [`Group`] and a
//! body of tagged operation records ([`Op`] value trees under [`Stmt`]
//! statements). A node is *replayed* by [`FusedNode::run`] against
//! whichever [`OpsHandler`] is active (an emitting kernel or the
//! vectorization-legality checker); the handler trait is the sole coupling
//! point between the builder and the code generator.
//!
//! Node bodies are written against placeholder iteration variables `x0..`
//! (pointwise) and `r0..` (reduction). `run` substitutes the real kernel
//! iteration variables so handlers always see the concrete index algebra.

use std::collections::HashMap;

use smallvec::SmallVec;
use weft_dtype::DType;

use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::types::{BinaryOp, ConstValue, RandKind, ReduceOp, StoreMode, UnaryOp};

/// Iteration space of a fused node: pointwise extents followed by the
/// extents reduced away by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Group {
    pub iter: SmallVec<[i64; 4]>,
    pub reduce: SmallVec<[i64; 4]>,
}

impl Group {
    pub fn new(iter: &[i64], reduce: &[i64]) -> Group {
        Group { iter: iter.into(), reduce: reduce.into() }
    }

    pub fn is_reduction(&self) -> bool {
        !self.reduce.is_empty()
    }

    /// All extents, pointwise then reduction.
    pub fn flattened(&self) -> SmallVec<[i64; 8]> {
        self.iter.iter().chain(self.reduce.iter()).copied().collect()
    }

    pub fn numel(&self) -> i64 {
        self.flattened().iter().product()
    }
}

/// A value-producing operation record.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Constant { value: ConstValue, dtype: DType },
    Load { buffer: String, index: Expr },
    /// Load through a value-dependent index (gather).
    IndirectLoad { buffer: String, index: Box<Op> },
    /// Materialize an index expression as a value.
    IndexExpr { expr: Expr, dtype: DType },
    Unary { op: UnaryOp, src: Box<Op> },
    Binary { op: BinaryOp, lhs: Box<Op>, rhs: Box<Op> },
    /// Element-wise select (`where`).
    Where { cond: Box<Op>, then: Box<Op>, other: Box<Op> },
    Cast { src: Box<Op>, dtype: DType },
    /// Evaluate `body` only where `mask` holds, `other` elsewhere.
    Masked { mask: Box<Op>, body: Box<Op>, other: f64 },
    Rand { kind: RandKind, seed: Expr, offset: Expr, dtype: DType },
}

impl Op {
    pub fn constant(value: ConstValue, dtype: DType) -> Op {
        Op::Constant { value, dtype }
    }

    pub fn load(buffer: impl Into<String>, index: Expr) -> Op {
        Op::Load { buffer: buffer.into(), index }
    }

    pub fn index_expr(expr: Expr, dtype: DType) -> Op {
        Op::IndexExpr { expr, dtype }
    }

    pub fn unary(op: UnaryOp, src: Op) -> Op {
        Op::Unary { op, src: Box::new(src) }
    }

    pub fn binary(op: BinaryOp, lhs: Op, rhs: Op) -> Op {
        Op::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn select(cond: Op, then: Op, other: Op) -> Op {
        Op::Where { cond: Box::new(cond), then: Box::new(then), other: Box::new(other) }
    }

    pub fn cast(src: Op, dtype: DType) -> Op {
        Op::Cast { src: Box::new(src), dtype }
    }

    pub fn masked(mask: Op, body: Op, other: f64) -> Op {
        Op::Masked { mask: Box::new(mask), body: Box::new(body), other }
    }
}

/// A side-effecting statement closing a node body.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Store { buffer: String, index: Expr, value: Op, mode: StoreMode },
    Reduction {
        buffer: String,
        dtype: DType,
        src_dtype: DType,
        op: ReduceOp,
        index: Expr,
        value: Op,
    },
}

impl Stmt {
    pub fn store(buffer: impl Into<String>, index: Expr, value: Op, mode: StoreMode) -> Stmt {
        Stmt::Store { buffer: buffer.into(), index, value, mode }
    }

    pub fn reduction(
        buffer: impl Into<String>,
        dtype: DType,
        src_dtype: DType,
        op: ReduceOp,
        index: Expr,
        value: Op,
    ) -> Stmt {
        Stmt::Reduction { buffer: buffer.into(), dtype, src_dtype, op, index, value }
    }
}

/// One fused node: an iteration-space group plus its body.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedNode {
    pub group: Group,
    pub stmts: Vec<Stmt>,
}

impl FusedNode {
    pub fn new(group: Group, stmts: Vec<Stmt>) -> FusedNode {
        FusedNode { group, stmts }
    }

    pub fn is_reduction(&self) -> bool {
        self.group.is_reduction()
    }

    /// Replay the node body against `handler` with the given iteration
    /// variables bound to the `x*`/`r*` placeholders.
    pub fn run<H: OpsHandler>(
        &self,
        handler: &mut H,
        vars: &[Expr],
        reduction_vars: &[Expr],
    ) -> Result<(), H::Error> {
        let bindings = Bindings::new(vars, reduction_vars);
        for stmt in &self.stmts {
            match stmt {
                Stmt::Store { buffer, index, value, mode } => {
                    let value = eval(value, &bindings, handler)?;
                    let index = bindings.apply(index)?;
                    handler.store(buffer, &index, value, *mode)?;
                }
                Stmt::Reduction { buffer, dtype, src_dtype, op, index, value } => {
                    let value = eval(value, &bindings, handler)?;
                    let index = bindings.apply(index)?;
                    handler.reduction(buffer, *dtype, *src_dtype, *op, &index, value)?;
                }
            }
        }
        Ok(())
    }
}

/// Placeholder-to-itervar substitution for one node replay.
#[derive(Debug, Clone)]
pub struct Bindings {
    map: HashMap<String, Expr>,
}

impl Bindings {
    pub fn new(vars: &[Expr], reduction_vars: &[Expr]) -> Bindings {
        let mut map = HashMap::new();
        for (i, var) in vars.iter().enumerate() {
            map.insert(format!("x{i}"), var.clone());
        }
        for (i, var) in reduction_vars.iter().enumerate() {
            map.insert(format!("r{i}"), var.clone());
        }
        Bindings { map }
    }

    /// Substitute and reject leftover placeholders.
    pub fn apply(&self, expr: &Expr) -> Result<Expr> {
        let substituted = expr.subst(&self.map);
        let mut unbound = None;
        substituted.for_each_var(&mut |name| {
            if unbound.is_none() && is_placeholder(name) {
                unbound = Some(name.to_string());
            }
        });
        match unbound {
            Some(name) => Err(Error::UnboundPlaceholder { name }),
            None => Ok(substituted),
        }
    }
}

fn is_placeholder(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some('x' | 'r')) && chars.all(|c| c.is_ascii_digit()) && name.len() > 1
}

/// Receiver for replayed per-element operations.
///
/// Implemented by the scalar kernel, the vector kernel and the
/// vectorization-legality checker. `Value` is whatever the handler uses to
/// name an evaluated sub-expression (a CSE temporary for emitting kernels,
/// `()` for the checker).
pub trait OpsHandler {
    type Value: Clone;
    type Error: From<Error>;

    fn constant(&mut self, value: ConstValue, dtype: DType) -> Result<Self::Value, Self::Error>;

    fn load(&mut self, buffer: &str, index: &Expr) -> Result<Self::Value, Self::Error>;

    fn store(
        &mut self,
        buffer: &str,
        index: &Expr,
        value: Self::Value,
        mode: StoreMode,
    ) -> Result<(), Self::Error>;

    fn reduction(
        &mut self,
        buffer: &str,
        dtype: DType,
        src_dtype: DType,
        op: ReduceOp,
        index: &Expr,
        value: Self::Value,
    ) -> Result<(), Self::Error>;

    fn unary(&mut self, op: UnaryOp, src: Self::Value) -> Result<Self::Value, Self::Error>;

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> Result<Self::Value, Self::Error>;

    fn select(
        &mut self,
        cond: Self::Value,
        then: Self::Value,
        other: Self::Value,
    ) -> Result<Self::Value, Self::Error>;

    fn cast(&mut self, src: Self::Value, dtype: DType) -> Result<Self::Value, Self::Error>;

    fn index_expr(&mut self, expr: &Expr, dtype: DType) -> Result<Self::Value, Self::Error>;

    /// Turn an evaluated value into an index expression (gather support).
    fn indirect_indexing(&mut self, value: Self::Value) -> Result<Expr, Self::Error>;

    fn rand(
        &mut self,
        kind: RandKind,
        seed: &Expr,
        offset: &Expr,
        dtype: DType,
    ) -> Result<Self::Value, Self::Error>;

    /// Masked evaluation. Handlers re-enter [`eval`] on `body` themselves so
    /// they control where the body's code lands.
    fn masked(
        &mut self,
        mask: Self::Value,
        body: &Op,
        bindings: &Bindings,
        other: f64,
    ) -> Result<Self::Value, Self::Error>;
}

/// Evaluate an operation record against a handler.
pub fn eval<H: OpsHandler>(
    op: &Op,
    bindings: &Bindings,
    handler: &mut H,
) -> Result<H::Value, H::Error> {
    match op {
        Op::Constant { value, dtype } => handler.constant(*value, *dtype),
        Op::Load { buffer, index } => {
            let index = bindings.apply(index)?;
            handler.load(buffer, &index)
        }
        Op::IndirectLoad { buffer, index } => {
            let value = eval(index, bindings, handler)?;
            let index = handler.indirect_indexing(value)?;
            handler.load(buffer, &index)
        }
        Op::IndexExpr { expr, dtype } => {
            let expr = bindings.apply(expr)?;
            handler.index_expr(&expr, *dtype)
        }
        Op::Unary { op, src } => {
            let src = eval(src, bindings, handler)?;
            handler.unary(*op, src)
        }
        Op::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, bindings, handler)?;
            let rhs = eval(rhs, bindings, handler)?;
            handler.binary(*op, lhs, rhs)
        }
        Op::Where { cond, then, other } => {
            let cond = eval(cond, bindings, handler)?;
            let then = eval(then, bindings, handler)?;
            let other = eval(other, bindings, handler)?;
            handler.select(cond, then, other)
        }
        Op::Cast { src, dtype } => {
            let src = eval(src, bindings, handler)?;
            handler.cast(src, *dtype)
        }
        Op::Masked { mask, body, other } => {
            let mask = eval(mask, bindings, handler)?;
            handler.masked(mask, body, bindings, *other)
        }
        Op::Rand { kind, seed, offset, dtype } => {
            let seed = bindings.apply(seed)?;
            let offset = bindings.apply(offset)?;
            handler.rand(*kind, &seed, &offset, *dtype)
        }
    }
}
