//! The vectorized C++ kernel.
//!
//! Emits `at::vec::Vectorized<float>` code over a fixed lane count `W`.
//! The innermost iteration variable is rewritten to `v*W` before indexing;
//! an index the rewrite leaves unchanged is invariant in the innermost
//! variable and loads as a broadcast. Reductions keep a scalar shadow next
//! to the vector accumulator and fold the lanes into it after the loop;
//! the accompanying scalar tail kernel owns the final store.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use weft_dtype::DType;
use weft_ir::{
    Bindings, BinaryOp, ConstValue, Expr, Op, OpsHandler, RandKind, ReduceOp, StoreMode, UnaryOp,
    eval,
};

use super::expr::cexpr;
use super::kernel::{CppKernel, KernelCode};
use super::ops::vec;
use super::types::{cpp_type, reduction_combine, reduction_combine_vec, reduction_init, reduction_token};
use crate::common::KernelArgs;
use crate::error::{Error, Result};
use crate::isa::VecIsa;
use crate::session::CodegenSession;

pub struct CppVecKernel {
    pub(crate) base: CppKernel,
    simd_nelements: usize,
    /// Reduction kinds whose vector declare-reduction operator was emitted.
    reduction_omp_dec: BTreeSet<ReduceOp>,
    /// Scratch float buffers for bool/byte vector loads, one per argument.
    var_vec_buf: HashMap<String, String>,
}

impl CppVecKernel {
    pub fn new(
        args: Rc<RefCell<KernelArgs>>,
        session: &CodegenSession,
        num_threads: usize,
        isa: VecIsa,
    ) -> CppVecKernel {
        CppVecKernel {
            base: CppKernel::new(args, session, num_threads),
            simd_nelements: isa.nelements,
            reduction_omp_dec: BTreeSet::new(),
            var_vec_buf: HashMap::new(),
        }
    }

    pub fn set_ranges(&mut self, iter: &[i64], reduce: &[i64]) -> Result<(Vec<Expr>, Vec<Expr>)> {
        self.base.set_ranges(iter, reduce)
    }

    pub fn simd_nelements(&self) -> usize {
        self.simd_nelements
    }

    pub fn code(&self) -> KernelCode {
        self.base.code()
    }

    /// Redirect emission into the reduction suffix, as on the scalar kernel.
    pub fn suffix_scope<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CppVecKernel) -> Result<()>,
    {
        let saved = self.base.suffix_begin();
        let result = f(self);
        self.base.suffix_end(saved);
        result
    }

    /// Rewrite the innermost iteration variable `v` to `v*W`, locating the
    /// start of each vector access.
    pub(crate) fn transform_index(&self, index: &Expr) -> Result<Expr> {
        let space = self.base.space()?;
        let innermost = space.itervars.last().ok_or(Error::KernelNotBound)?;
        let Expr::Var(name) = innermost else {
            unreachable!("iteration variables are always plain vars")
        };
        let mut map = HashMap::new();
        map.insert(
            name.clone(),
            Expr::mul(innermost.clone(), Expr::int(self.simd_nelements as i64)),
        );
        Ok(index.subst(&map))
    }
}

impl OpsHandler for CppVecKernel {
    type Value = String;
    type Error = Error;

    fn constant(&mut self, value: ConstValue, dtype: DType) -> Result<String> {
        self.base.space()?;
        let expr = vec::constant(value, dtype);
        Ok(self.base.cse.generate(&mut self.base.compute, &expr))
    }

    fn load(&mut self, buffer: &str, index: &Expr) -> Result<String> {
        if let Some(cached) = self.base.cse.store_cache.get(buffer) {
            return Ok(cached.clone());
        }
        let dtype = self.base.graph.dtype_of(buffer)?;
        let var = self.base.args.borrow_mut().input(buffer);
        let new_index = self.transform_index(index)?;

        let line = if index.linearize() == new_index.linearize() {
            // invariant in the innermost variable: broadcast load
            format!("at::vec::Vectorized<float>({var}[{}])", cexpr(index))
        } else if matches!(dtype, DType::Bool | DType::UInt8) {
            let nelements = self.simd_nelements;
            if !self.var_vec_buf.contains_key(&var) {
                let scratch = format!("g_tmp_buffer_{var}");
                self.base
                    .loads
                    .writeline(format!("float {scratch}[{nelements}] = {{0}};"));
                self.var_vec_buf.insert(var.clone(), scratch);
            }
            let scratch = self.var_vec_buf[&var].clone();
            self.base.loads.writeline(format!(
                "flag_to_float({var} + {}, {scratch}, {nelements});",
                cexpr(&new_index)
            ));
            format!("at::vec::Vectorized<float>::loadu({scratch})")
        } else {
            format!("at::vec::Vectorized<float>::loadu({var} + {})", cexpr(&new_index))
        };
        Ok(self.base.cse.generate(&mut self.base.loads, &line))
    }

    fn store(
        &mut self,
        buffer: &str,
        index: &Expr,
        value: String,
        mode: StoreMode,
    ) -> Result<()> {
        self.base.graph.dtype_of(buffer)?;
        if mode != StoreMode::Plain {
            return Err(Error::UnsupportedOp { op: "vector store mode=atomic_add".to_string() });
        }
        let var = self.base.args.borrow_mut().output(buffer);
        let new_index = self.transform_index(index)?;
        if index.linearize() == new_index.linearize() {
            // stride-0 stores have no vector form
            return Err(Error::IllegalAccess {
                buffer: buffer.to_string(),
                index: cexpr(index),
            });
        }
        self.base.cse.store_cache.insert(buffer.to_string(), value.clone());
        if !self.base.graph.is_removed(buffer) {
            self.base
                .stores
                .writeline(format!("{value}.store({var} + {});", cexpr(&new_index)));
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
        self.base.space()?;
        let vectorizable = matches!(op, ReduceOp::Sum | ReduceOp::Min | ReduceOp::Max)
            && dtype == DType::Float32
            && src_dtype == DType::Float32;
        if !vectorizable {
            return Err(Error::UnsupportedReduction { kind: op, dtype, src_dtype });
        }

        let cpp = cpp_type(dtype);
        let vec_type = format!("at::vec::Vectorized<{cpp}>");
        if self.reduction_omp_dec.insert(op) {
            let mut decl = String::from("#pragma omp declare reduction(");
            decl.push_str(reduction_token(op));
            decl.push(':');
            decl.push_str(&vec_type);
            decl.push(':');
            match op {
                ReduceOp::Sum => decl.push_str("omp_out += omp_in"),
                ReduceOp::Min => decl.push_str("omp_out = at::vec::minimum(omp_out, omp_in)"),
                ReduceOp::Max => decl.push_str("omp_out = at::vec::maximum(omp_out, omp_in)"),
                _ => {}
            }
            decl.push_str(") initializer(omp_priv={{");
            decl.push_str(&reduction_init(op, dtype));
            decl.push_str("}})");
            self.base.reduction_prefix.writeline(decl);
        }

        let tmpvar =
            self.base.cse.generate_nowrite(&format!("reduction {buffer} {}", cexpr(index)));
        let tmpvar_vec = format!("{tmpvar}_vec");
        let first = self.base.reduction_vars.insert(tmpvar_vec.clone(), op).is_none();
        if first {
            self.base.reduction_prefix.writeline(format!(
                "{cpp} {tmpvar} = {};",
                reduction_init(op, dtype)
            ));
            self.base
                .reduction_prefix
                .writeline(format!("auto {tmpvar_vec} = {vec_type}({tmpvar});"));
            self.base.stores.writeline(format!(
                "{};",
                reduction_combine_vec(op, &tmpvar_vec, &value, dtype, src_dtype)?
            ));

            // horizontal reduce-all folded into the scalar shadow; the tail
            // kernel emits the real store
            let reduce_all_body = match op {
                ReduceOp::Sum => "{return x + y;}",
                ReduceOp::Min => "{return at::vec::minimum(x, y);}",
                ReduceOp::Max => "{return at::vec::maximum(x, y);}",
                _ => "",
            };
            let next = format!(
                "at::vec::vec_reduce_all<{cpp}>([]({vec_type}& x, {vec_type}&y) {reduce_all_body}, {tmpvar_vec})"
            );
            self.base
                .reduction_suffix
                .writeline(format!("{};", reduction_combine(op, &tmpvar, &next)));
        }
        self.base.cse.store_cache.insert(buffer.to_string(), tmpvar);
        Ok(())
    }

    fn unary(&mut self, op: UnaryOp, src: String) -> Result<String> {
        self.base.space()?;
        if op == UnaryOp::Sign {
            let zero = format!("decltype({src})(0)");
            let one = format!("decltype({src})(1)");
            let left = self.base.cse.newvar();
            let right = self.base.cse.newvar();
            self.base.compute.writeline(format!(
                "auto {left} = decltype({src})::blendv({zero}, {one}, {zero} < {src});"
            ));
            self.base.compute.writeline(format!(
                "auto {right} = decltype({src})::blendv({zero}, {one}, {src} < {zero});"
            ));
            let expr = format!("{left} - {right}");
            return Ok(self.base.cse.generate(&mut self.base.compute, &expr));
        }
        let expr = vec::unary(op, &src)?;
        Ok(self.base.cse.generate(&mut self.base.compute, &expr))
    }

    fn binary(&mut self, op: BinaryOp, lhs: String, rhs: String) -> Result<String> {
        self.base.space()?;
        let expr = vec::binary(op, &lhs, &rhs)?;
        Ok(self.base.cse.generate(&mut self.base.compute, &expr))
    }

    fn select(&mut self, cond: String, then: String, other: String) -> Result<String> {
        self.base.space()?;
        let expr = vec::where_(&cond, &then, &other);
        Ok(self.base.cse.generate(&mut self.base.compute, &expr))
    }

    fn cast(&mut self, src: String, dtype: DType) -> Result<String> {
        self.base.space()?;
        let expr = vec::to_dtype(&src, dtype)?;
        Ok(self.base.cse.generate(&mut self.base.compute, &expr))
    }

    fn index_expr(&mut self, _expr: &Expr, _dtype: DType) -> Result<String> {
        Err(Error::UnsupportedOp { op: "vector index_expr".to_string() })
    }

    fn indirect_indexing(&mut self, _value: String) -> Result<Expr> {
        Err(Error::UnsupportedOp { op: "vector indirect_indexing".to_string() })
    }

    fn rand(
        &mut self,
        _kind: RandKind,
        _seed: &Expr,
        _offset: &Expr,
        _dtype: DType,
    ) -> Result<String> {
        Err(Error::UnsupportedOp { op: "vector rand".to_string() })
    }

    fn masked(
        &mut self,
        mask: String,
        body: &Op,
        bindings: &Bindings,
        other: f64,
    ) -> Result<String> {
        let other_vec = vec::constant(ConstValue::Float(other), DType::Float32);
        let body_val = eval(body, bindings, self)?;
        let expr = format!("decltype({body_val})::blendv({other_vec}, {body_val}, {mask})");
        Ok(self.base.cse.generate(&mut self.base.compute, &expr))
    }
}
