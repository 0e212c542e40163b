//! The scalar C++ kernel.
//!
//! A kernel is bound to an iteration space with [`CppKernel::set_ranges`],
//! then accumulates loads/compute/stores while fused nodes are replayed
//! through its [`OpsHandler`] implementation, and is finally walked into a
//! loop nest. Reduction accumulators collect a prefix (declarations before
//! the reduction loops) and a suffix (the single flush to the output
//! buffer after they close).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::mem;
use std::rc::Rc;

use smallvec::SmallVec;
use weft_dtype::DType;
use weft_ir::{
    Bindings, BinaryOp, ConstValue, Expr, Op, OpsHandler, RandKind, ReduceOp, StoreMode, UnaryOp,
    eval,
};

use super::expr::cexpr;
use super::loops::{LoopNest, WorkSharing, codegen_loops_impl};
use super::ops::{float_literal, scalar};
use super::types::{
    argmax_argmin_prefix, cpp_type, narrow_float_reduction_prefix, reduction_combine,
    reduction_init,
};
use crate::common::{CodeBuffer, CseCache, KernelArgs};
use crate::error::{Error, Result};
use crate::session::{CodegenSession, CppConfig, Counters, GraphInfo};

/// Iteration-space binding state shared by every kernel variant.
#[derive(Debug, Clone)]
pub(crate) struct IterSpace {
    pub call_ranges: SmallVec<[i64; 8]>,
    pub itervars: Vec<Expr>,
    pub reduction_depth: usize,
}

impl IterSpace {
    fn vars(&self) -> (Vec<Expr>, Vec<Expr>) {
        (
            self.itervars[..self.reduction_depth].to_vec(),
            self.itervars[self.reduction_depth..].to_vec(),
        )
    }

    /// Bind `slot` to the given ranges, or assert the identical tuple when
    /// already bound. Returns (pointwise vars, reduction vars).
    pub fn bind(
        slot: &mut Option<IterSpace>,
        iter: &[i64],
        reduce: &[i64],
    ) -> Result<(Vec<Expr>, Vec<Expr>)> {
        let call_ranges: SmallVec<[i64; 8]> = iter.iter().chain(reduce).copied().collect();
        match slot {
            Some(space) => {
                if space.call_ranges != call_ranges || space.reduction_depth != iter.len() {
                    return Err(Error::BindingMismatch {
                        expected: space.call_ranges.clone(),
                        actual: call_ranges,
                    });
                }
                Ok(space.vars())
            }
            None => {
                let itervars =
                    (0..call_ranges.len()).map(|i| Expr::var(format!("i{i}"))).collect();
                let space = IterSpace { call_ranges, itervars, reduction_depth: iter.len() };
                let vars = space.vars();
                *slot = Some(space);
                Ok(vars)
            }
        }
    }
}

/// Saved emission buffers across a suffix scope.
pub(crate) struct SuffixState {
    loads: CodeBuffer,
    compute: CodeBuffer,
    stores: CodeBuffer,
    cse: CseCache,
}

/// Finished emission state of a kernel, snapshotted into loop-nest leaves.
#[derive(Debug, Clone, Default)]
pub struct KernelCode {
    pub loads: CodeBuffer,
    pub compute: CodeBuffer,
    pub stores: CodeBuffer,
    pub reduction_prefix: CodeBuffer,
    pub reduction_suffix: CodeBuffer,
    pub reduction_vars: BTreeMap<String, ReduceOp>,
}

/// Scalar C++ kernel over one iteration space.
pub struct CppKernel {
    pub(crate) args: Rc<RefCell<KernelArgs>>,
    pub(crate) graph: Rc<GraphInfo>,
    pub(crate) cfg: Rc<CppConfig>,
    pub(crate) counters: Rc<Counters>,
    pub(crate) space: Option<IterSpace>,
    pub(crate) loads: CodeBuffer,
    pub(crate) compute: CodeBuffer,
    pub(crate) stores: CodeBuffer,
    pub(crate) reduction_prefix: CodeBuffer,
    pub(crate) reduction_suffix: CodeBuffer,
    pub(crate) reduction_vars: BTreeMap<String, ReduceOp>,
    pub(crate) cse: CseCache,
    num_threads: usize,
}

impl CppKernel {
    pub fn new(
        args: Rc<RefCell<KernelArgs>>,
        session: &CodegenSession,
        num_threads: usize,
    ) -> CppKernel {
        CppKernel {
            args,
            graph: session.graph.clone(),
            cfg: session.cfg.clone(),
            counters: session.counters.clone(),
            space: None,
            loads: CodeBuffer::new(),
            compute: CodeBuffer::new(),
            stores: CodeBuffer::new(),
            reduction_prefix: CodeBuffer::new(),
            reduction_suffix: CodeBuffer::new(),
            reduction_vars: BTreeMap::new(),
            cse: CseCache::new(),
            num_threads,
        }
    }

    /// Bind the kernel to an iteration space. Idempotent: re-binding with
    /// the same tuple returns the same variables, a different tuple is an
    /// upstream fusion bug.
    pub fn set_ranges(&mut self, iter: &[i64], reduce: &[i64]) -> Result<(Vec<Expr>, Vec<Expr>)> {
        IterSpace::bind(&mut self.space, iter, reduce)
    }

    pub(crate) fn space(&self) -> Result<&IterSpace> {
        self.space.as_ref().ok_or(Error::KernelNotBound)
    }

    pub fn call_ranges(&self) -> Result<&[i64]> {
        Ok(&self.space()?.call_ranges)
    }

    pub fn itervars(&self) -> Result<&[Expr]> {
        Ok(&self.space()?.itervars)
    }

    pub fn reduction_depth(&self) -> Result<usize> {
        Ok(self.space()?.reduction_depth)
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Snapshot the emitted state for attachment to a loop-nest leaf.
    pub fn code(&self) -> KernelCode {
        KernelCode {
            loads: self.loads.clone(),
            compute: self.compute.clone(),
            stores: self.stores.clone(),
            reduction_prefix: self.reduction_prefix.clone(),
            reduction_suffix: self.reduction_suffix.clone(),
            reduction_vars: self.reduction_vars.clone(),
        }
    }

    /// Run `f` with emission redirected into the reduction suffix, for
    /// pointwise nodes fused after a reduction. The CSE cache is restored
    /// afterwards so suffix temporaries do not shift main-body naming.
    pub fn suffix_scope<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CppKernel) -> Result<()>,
    {
        let saved = self.suffix_begin();
        let result = f(self);
        self.suffix_end(saved);
        result
    }

    pub(crate) fn suffix_begin(&mut self) -> SuffixState {
        SuffixState {
            loads: mem::take(&mut self.loads),
            compute: mem::take(&mut self.compute),
            stores: mem::take(&mut self.stores),
            cse: self.cse.clone(),
        }
    }

    pub(crate) fn suffix_end(&mut self, saved: SuffixState) {
        let loads = mem::replace(&mut self.loads, saved.loads);
        let compute = mem::replace(&mut self.compute, saved.compute);
        let stores = mem::replace(&mut self.stores, saved.stores);
        self.cse = saved.cse;
        self.reduction_suffix.splice(&loads);
        self.reduction_suffix.splice(&compute);
        self.reduction_suffix.splice(&stores);
    }

    /// Scalar-only loop-nest codegen.
    pub fn codegen_loops(&self, code: &mut CodeBuffer, ws: &mut WorkSharing) -> Result<()> {
        let mut nest = LoopNest::build(self)?;
        codegen_loops_impl(&mut nest, self.call_ranges()?, &self.cfg, code, ws)
    }

    fn innermost_var(&self) -> Result<String> {
        let space = self.space()?;
        space.itervars.last().map(cexpr).ok_or(Error::KernelNotBound)
    }
}

impl OpsHandler for CppKernel {
    type Value = String;
    type Error = Error;

    fn constant(&mut self, value: ConstValue, dtype: DType) -> Result<String> {
        self.space()?;
        let expr = scalar::constant(value, dtype);
        Ok(self.cse.generate(&mut self.compute, &expr))
    }

    fn load(&mut self, buffer: &str, index: &Expr) -> Result<String> {
        self.space()?;
        if let Some(cached) = self.cse.store_cache.get(buffer) {
            return Ok(cached.clone());
        }
        let dtype = self.graph.dtype_of(buffer)?;
        let var = self.args.borrow_mut().input(buffer);
        let mut line = format!("{var}[{}]", cexpr(index));
        if dtype.is_narrow_float() {
            line = format!("static_cast<float>({line})");
        }
        Ok(self.cse.generate(&mut self.loads, &line))
    }

    fn store(
        &mut self,
        buffer: &str,
        index: &Expr,
        value: String,
        mode: StoreMode,
    ) -> Result<()> {
        self.space()?;
        self.graph.dtype_of(buffer)?;
        let var = self.args.borrow_mut().output(buffer);
        let idx = cexpr(index);
        let line = match mode {
            StoreMode::Plain => format!("{var}[{idx}] = {value};"),
            StoreMode::AtomicAdd => {
                // a fixed single-thread kernel needs no atomicity
                if !self.cfg.dynamic_threads && self.num_threads == 1 {
                    format!("{var}[{idx}] += {value};")
                } else {
                    format!("atomic_add(&{var}[{idx}], {value});")
                }
            }
        };
        self.cse.store_cache.insert(buffer.to_string(), value);
        if !self.graph.is_removed(buffer) {
            self.stores.writeline(line);
        }
        Ok(())
    }

    fn reduction(
        &mut self,
        buffer: &str,
        dtype: DType,
        src_dtype: DType,
        op: ReduceOp,
        index: &Expr,
        value: String,
    ) -> Result<()> {
        self.space()?;
        let tmpvar = self.cse.generate_nowrite(&format!("reduction {buffer} {}", cexpr(index)));
        let first = self.reduction_vars.insert(tmpvar.clone(), op).is_none();
        if first {
            if op.is_arg() {
                let struct_id = self.counters.next_index_value_id();
                let last_var = self.innermost_var()?;
                self.reduction_prefix
                    .writelines(argmax_argmin_prefix(op, src_dtype, &tmpvar, struct_id));
                let cmp = if op == ReduceOp::Argmax { "<" } else { ">" };
                self.stores.writelines([
                    format!("if ({tmpvar}.value {cmp} {value}) {{"),
                    format!("    {tmpvar}.index = {last_var}; {tmpvar}.value = {value};"),
                    "}".to_string(),
                ]);
            } else {
                if dtype.is_narrow_float() {
                    self.reduction_prefix.writelines(narrow_float_reduction_prefix(op, dtype)?);
                }
                self.reduction_prefix.writeline(format!(
                    "{} {tmpvar} = {};",
                    cpp_type(dtype),
                    reduction_init(op, dtype)
                ));
                self.stores.writeline(format!("{};", reduction_combine(op, &tmpvar, &value)));
            }
            if !self.graph.is_removed(buffer) {
                let var = self.args.borrow_mut().output(buffer);
                let member = if op.is_arg() { ".index" } else { "" };
                self.reduction_suffix
                    .writeline(format!("{var}[{}] = {tmpvar}{member};", cexpr(index)));
            }
        }
        self.cse.store_cache.insert(buffer.to_string(), tmpvar);
        Ok(())
    }

    fn unary(&mut self, op: UnaryOp, src: String) -> Result<String> {
        self.space()?;
        if op == UnaryOp::Sign {
            let left = self.cse.newvar();
            let right = self.cse.newvar();
            self.compute.writeline(format!("auto {left} = {src} > 0 ? 1 : 0;"));
            self.compute.writeline(format!("auto {right} = {src} < 0 ? 1 : 0;"));
            let expr = format!("{left} - {right}");
            return Ok(self.cse.generate(&mut self.compute, &expr));
        }
        let expr = scalar::unary(op, &src);
        Ok(self.cse.generate(&mut self.compute, &expr))
    }

    fn binary(&mut self, op: BinaryOp, lhs: String, rhs: String) -> Result<String> {
        self.space()?;
        let expr = scalar::binary(op, &lhs, &rhs);
        Ok(self.cse.generate(&mut self.compute, &expr))
    }

    fn select(&mut self, cond: String, then: String, other: String) -> Result<String> {
        self.space()?;
        let expr = scalar::where_(&cond, &then, &other);
        Ok(self.cse.generate(&mut self.compute, &expr))
    }

    fn cast(&mut self, src: String, dtype: DType) -> Result<String> {
        self.space()?;
        let expr = scalar::to_dtype(&src, dtype);
        Ok(self.cse.generate(&mut self.compute, &expr))
    }

    fn index_expr(&mut self, expr: &Expr, dtype: DType) -> Result<String> {
        self.space()?;
        let text = scalar::to_dtype(&cexpr(expr), dtype);
        Ok(self.cse.generate(&mut self.compute, &text))
    }

    fn indirect_indexing(&mut self, value: String) -> Result<Expr> {
        Ok(Expr::Var(value))
    }

    fn rand(
        &mut self,
        kind: RandKind,
        seed: &Expr,
        offset: &Expr,
        dtype: DType,
    ) -> Result<String> {
        self.space()?;
        let expr = scalar::rand(kind, &cexpr(seed), &cexpr(offset), dtype);
        Ok(self.cse.generate(&mut self.compute, &expr))
    }

    fn masked(
        &mut self,
        mask: String,
        body: &Op,
        bindings: &Bindings,
        other: f64,
    ) -> Result<String> {
        let var = self.cse.newvar();
        let decl = if other == f64::NEG_INFINITY {
            format!("float {var} = -std::numeric_limits<float>::infinity();")
        } else if other == f64::INFINITY {
            format!("float {var} = std::numeric_limits<float>::infinity();")
        } else if other.is_nan() {
            format!("float {var} = std::numeric_limits<float>::quiet_NaN();")
        } else {
            format!("float {var} = {};", float_literal(other))
        };

        // evaluate the body with emission captured, then wrap it in the
        // conditional block
        let saved_loads = mem::take(&mut self.loads);
        let saved_compute = mem::take(&mut self.compute);
        let saved_stores = mem::take(&mut self.stores);
        let result = eval(body, bindings, self);
        let body_loads = mem::replace(&mut self.loads, saved_loads);
        let body_compute = mem::replace(&mut self.compute, saved_compute);
        let body_stores = mem::replace(&mut self.stores, saved_stores);
        let result = result?;

        self.compute.writeline(decl);
        self.compute.writeline(format!("if({mask})"));
        self.compute.open_brace();
        self.compute.splice(&body_loads);
        self.compute.splice(&body_compute);
        self.compute.splice(&body_stores);
        self.compute.writeline(format!("{var} = {result};"));
        self.compute.close_brace();
        Ok(var)
    }
}
