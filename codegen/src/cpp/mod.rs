//! C++ (OpenMP + `at::vec`) backend for fused element-wise/reduction
//! kernels.
//!
//! Data flow for one fused group: the legality checker dry-runs the node
//! list; if it approves, a vector kernel and a scalar kernel are built over
//! the same ranges; the loop nest built from the scalar kernel's ranges is
//! split at the innermost level with the vector width as tiling factor, the
//! vector kernel bound to the main copy and the scalar kernel to the tail.
//! Kernel groups accumulate loop code under one work-sharing coordinator
//! and flush as a single `extern "C"` function handed to the [`Wrapper`].

pub mod check;
pub mod expr;
pub mod kernel;
pub mod loops;
pub mod ops;
pub mod types;
pub mod vec;

use std::cell::RefCell;
use std::rc::Rc;

use itertools::Itertools;
use weft_ir::{FusedNode, Group};

use self::check::CppVecChecker;
use self::kernel::CppKernel;
use self::loops::{LoopNest, WorkSharing, codegen_loops_impl};
use self::types::cpp_type;
use self::vec::CppVecKernel;
use crate::common::{CodeBuffer, KernelArgs};
use crate::error::{Error, Result};
use crate::isa::VecIsa;
use crate::session::CodegenSession;

/// The wrapper/emission collaborator receiving finished kernels.
pub trait Wrapper {
    /// Full kernel source, ready for compilation.
    fn define_kernel(&mut self, name: &str, code: &str);
    /// Declaration and per-argument native types, for loading the artifact.
    fn load_kernel(&mut self, name: &str, declaration: &str, arg_types: &[String]);
    /// Call-site argument list (buffer names, inputs then outputs).
    fn generate_call(&mut self, name: &str, call_args: &[String]);
}

/// Include line pulling in the runtime helpers the generated code relies
/// on: `atomic_add`, `flag_to_float`, `mod`, the random draws and the
/// `at::vec` wrappers.
pub fn cpp_prefix() -> &'static str {
    "#include \"cpp_prefix.h\""
}

/// Kernels of one generated function: shared argument registry, the
/// accumulated loop code and the work-sharing coordinator spanning it.
pub struct KernelGroup {
    pub(crate) args: Rc<RefCell<KernelArgs>>,
    pub(crate) loops_code: CodeBuffer,
    pub(crate) ws: WorkSharing,
    count: usize,
}

impl KernelGroup {
    fn new() -> KernelGroup {
        KernelGroup {
            args: Rc::new(RefCell::new(KernelArgs::new())),
            loops_code: CodeBuffer::new(),
            ws: WorkSharing::new(),
            count: 0,
        }
    }

    pub fn new_kernel(&self, session: &CodegenSession) -> CppKernel {
        CppKernel::new(self.args.clone(), session, session.cfg.parallel_num_threads())
    }

    pub fn new_vec_kernel(&self, session: &CodegenSession, isa: VecIsa) -> CppVecKernel {
        CppVecKernel::new(self.args.clone(), session, session.cfg.parallel_num_threads(), isa)
    }

    fn finalize_kernel(&mut self, proxy: &CppKernelProxy) -> Result<()> {
        let KernelGroup { loops_code, ws, .. } = self;
        proxy.codegen_loops(loops_code, ws)?;
        self.count += 1;
        Ok(())
    }

    fn close_ws(&mut self) {
        let KernelGroup { loops_code, ws, .. } = self;
        ws.close(loops_code);
    }
}

/// Pairs the vector-main and scalar-tail kernels of one fused group and
/// performs the loop split.
pub struct CppKernelProxy {
    pub simd_vec_kernel: Option<CppVecKernel>,
    pub simd_omp_kernel: CppKernel,
}

impl CppKernelProxy {
    pub fn codegen_loops(&self, code: &mut CodeBuffer, ws: &mut WorkSharing) -> Result<()> {
        let scalar = &self.simd_omp_kernel;
        let Some(vec_kernel) = &self.simd_vec_kernel else {
            return scalar.codegen_loops(code, ws);
        };
        if scalar.cfg.simd.is_none() {
            return scalar.codegen_loops(code, ws);
        }

        let mut nest = LoopNest::build(scalar)?;
        let innermost = scalar.itervars()?.len().saturating_sub(1);
        let (main, tail) =
            nest.split_with_tiling(innermost, vec_kernel.simd_nelements() as i64)?;
        nest.set_kernel_at(main, vec_kernel.code());
        nest.set_kernel_at(tail, scalar.code());
        codegen_loops_impl(&mut nest, scalar.call_ranges()?, &scalar.cfg, code, ws)
    }
}

/// How a node's group relates to the kernel group being compiled.
enum NodeClass {
    /// Same (pointwise, reduction) split.
    Full,
    /// Pointwise over the flattened range tuple.
    Flat,
    /// Pointwise over the pointwise prefix only; fused into the reduction
    /// suffix.
    Suffix,
}

fn pick_group(nodes: &[FusedNode]) -> Option<&Group> {
    nodes.iter().max_by_key(|n| n.is_reduction() as usize).map(|n| &n.group)
}

fn classify(node: &FusedNode, group: &Group) -> Result<NodeClass> {
    if node.group == *group {
        return Ok(NodeClass::Full);
    }
    if node.group.reduce.is_empty() && node.group.iter.as_slice() == group.flattened().as_slice() {
        return Ok(NodeClass::Flat);
    }
    if node.group.reduce.is_empty() && node.group.iter == group.iter {
        return Ok(NodeClass::Suffix);
    }
    Err(Error::BindingMismatch { expected: group.flattened(), actual: node.group.flattened() })
}

/// Turns fused node groups into C++ kernels.
pub struct CppScheduling {
    session: CodegenSession,
    group: KernelGroup,
}

impl CppScheduling {
    pub fn new(session: CodegenSession) -> CppScheduling {
        CppScheduling { session, group: KernelGroup::new() }
    }

    pub fn session(&self) -> &CodegenSession {
        &self.session
    }

    /// Dry-run the node group through the legality checker.
    pub fn can_vec(&self, nodes: &[FusedNode]) -> Result<bool> {
        if self.session.cfg.simd.is_none() {
            return Ok(false);
        }
        let Some(group) = pick_group(nodes) else {
            return Ok(false);
        };
        let mut checker = CppVecChecker::new(self.session.graph.clone());
        let (vars, reduction_vars) = checker.set_ranges(&group.iter, &group.reduce)?;
        for node in nodes {
            match classify(node, group)? {
                NodeClass::Full => node.run(&mut checker, &vars, &reduction_vars)?,
                NodeClass::Flat => {
                    let all = [vars.as_slice(), reduction_vars.as_slice()].concat();
                    node.run(&mut checker, &all, &[])?;
                }
                NodeClass::Suffix => node.run(&mut checker, &vars, &[])?,
            }
        }
        tracing::debug!(vectorizable = checker.simd_vec(), "legality dry run finished");
        Ok(checker.simd_vec())
    }

    /// Compile one fused node group into the current kernel group.
    pub fn codegen_nodes(&mut self, nodes: &[FusedNode]) -> Result<()> {
        let Some(group) = pick_group(nodes) else {
            return Ok(());
        };
        let group = group.clone();

        let simd_vec_kernel = if self.can_vec(nodes)?
            && let Some(isa) = self.session.cfg.simd
        {
            match self.build_vec_kernel(nodes, &group, isa) {
                Ok(kernel) => Some(kernel),
                Err(error) if error.is_fallback() => {
                    tracing::warn!(%error, "vector kernel rejected late; scalar fallback");
                    None
                }
                Err(error) => return Err(error),
            }
        } else {
            None
        };
        let simd_omp_kernel = self.build_scalar_kernel(nodes, &group)?;

        let proxy = CppKernelProxy { simd_vec_kernel, simd_omp_kernel };
        self.group.finalize_kernel(&proxy)
    }

    fn build_scalar_kernel(&self, nodes: &[FusedNode], group: &Group) -> Result<CppKernel> {
        let mut kernel = self.group.new_kernel(&self.session);
        let (vars, reduction_vars) = kernel.set_ranges(&group.iter, &group.reduce)?;
        let mut in_suffix = false;
        for node in nodes {
            match classify(node, group)? {
                NodeClass::Full => {
                    debug_assert!(!in_suffix, "main-group node after a suffix node");
                    node.run(&mut kernel, &vars, &reduction_vars)?;
                }
                NodeClass::Flat => {
                    let all = [vars.as_slice(), reduction_vars.as_slice()].concat();
                    node.run(&mut kernel, &all, &[])?;
                }
                NodeClass::Suffix => {
                    in_suffix = true;
                    kernel.suffix_scope(|k| node.run(k, &vars, &[]))?;
                }
            }
        }
        Ok(kernel)
    }

    fn build_vec_kernel(
        &self,
        nodes: &[FusedNode],
        group: &Group,
        isa: VecIsa,
    ) -> Result<CppVecKernel> {
        let mut kernel = self.group.new_vec_kernel(&self.session, isa);
        let (vars, reduction_vars) = kernel.set_ranges(&group.iter, &group.reduce)?;
        for node in nodes {
            match classify(node, group)? {
                NodeClass::Full => node.run(&mut kernel, &vars, &reduction_vars)?,
                NodeClass::Flat => {
                    let all = [vars.as_slice(), reduction_vars.as_slice()].concat();
                    node.run(&mut kernel, &all, &[])?;
                }
                NodeClass::Suffix => {
                    kernel.suffix_scope(|k| node.run(k, &vars, &[]))?;
                }
            }
        }
        Ok(kernel)
    }

    /// Assemble the accumulated kernel group into one `extern "C"` function
    /// and hand the three artifacts to the wrapper. Starts a fresh group.
    pub fn flush(&mut self, wrapper: &mut dyn Wrapper) -> Result<()> {
        self.group.close_ws();
        if self.group.count == 0 {
            self.group = KernelGroup::new();
            return Ok(());
        }

        let name = format!("kernel_cpp_{}", self.session.counters.next_kernel_id());
        let (arg_defs, call_args, arg_types) =
            cpp_argdefs(&self.group.args.borrow(), &self.session)?;

        let mut code = CodeBuffer::new();
        code.writeline(cpp_prefix());
        code.writeline(format!("extern \"C\" void {name}({})", arg_defs.iter().join(", ")));
        code.open_brace();
        code.splice(&self.group.loops_code);
        code.close_brace();

        let declaration = format!("extern \"C\" void {name}({})", arg_defs.iter().join(", "));
        wrapper.define_kernel(&name, &code.render());
        wrapper.load_kernel(&name, &declaration, &arg_types);
        wrapper.generate_call(&name, &call_args);
        tracing::debug!(kernel = %name, args = call_args.len(), "kernel group flushed");

        self.group = KernelGroup::new();
        Ok(())
    }
}

fn cpp_argdefs(
    args: &KernelArgs,
    session: &CodegenSession,
) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
    let mut arg_defs = Vec::new();
    let mut call_args = Vec::new();
    let mut arg_types = Vec::new();
    for (name, arg, is_input) in args.iter_with_const() {
        let cpp = cpp_type(session.graph.dtype_of(name)?);
        if is_input {
            arg_defs.push(format!("const {cpp}* __restrict__ {arg}"));
            arg_types.push(format!("const {cpp}*"));
        } else {
            arg_defs.push(format!("{cpp}* __restrict__ {arg}"));
            arg_types.push(format!("{cpp}*"));
        }
        call_args.push(name.to_string());
    }
    Ok((arg_defs, call_args, arg_types))
}
