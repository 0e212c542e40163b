//! Loop nest, work sharing and the parallel-depth heuristic.
//!
//! The nest is an arena of [`LoopLevel`] nodes addressed by [`LevelId`]:
//! splitting a level clones its subtree into fresh arena slots and rebuilds
//! the parent's child list, so original and clones never share ownership.
//! Orphaned slots stay in the arena; only ids reachable from `root` are
//! walked.

use std::collections::BTreeMap;

use weft_ir::{Expr, ReduceOp};

use super::expr::cexpr;
use super::kernel::{CppKernel, KernelCode};
use super::types::{INDEX_TYPE, reduction_token};
use crate::common::CodeBuffer;
use crate::error::{Error, Result};
use crate::session::CppConfig;

pub type LevelId = usize;

/// One loop level of the nest.
#[derive(Debug, Clone)]
pub struct LoopLevel {
    pub var: Expr,
    pub size: i64,
    pub offset: i64,
    pub steps: i64,
    /// Dimensions spanned by this level's work-sharing pragma; 0 = serial.
    pub parallel: usize,
    pub simd_omp: bool,
    pub simd_nelements: usize,
    pub simd_vec: bool,
    /// Folded into an enclosing collapse(n) directive.
    pub collapsed: bool,
    pub reduction_vars: BTreeMap<String, ReduceOp>,
    parent: Option<LevelId>,
    inner: Vec<LevelId>,
    kernel: Option<KernelCode>,
}

impl LoopLevel {
    fn new(var: Expr, size: i64, parent: Option<LevelId>) -> LoopLevel {
        LoopLevel {
            var,
            size,
            offset: 0,
            steps: 1,
            parallel: 0,
            simd_omp: false,
            simd_nelements: 0,
            simd_vec: false,
            collapsed: false,
            reduction_vars: BTreeMap::new(),
            parent,
            inner: Vec::new(),
            kernel: None,
        }
    }

    pub fn is_reduction(&self) -> bool {
        !self.reduction_vars.is_empty()
    }

    pub fn inner(&self) -> &[LevelId] {
        &self.inner
    }

    pub fn kernel(&self) -> Option<&KernelCode> {
        self.kernel.as_ref()
    }

    /// Pragma line (if any) and the loop header.
    pub fn lines(&self, gcc_vectorize: bool) -> Vec<String> {
        let reduction: String = self
            .reduction_vars
            .iter()
            .map(|(var, op)| format!(" reduction({}:{var})", reduction_token(*op)))
            .collect();
        let simd = self.simd_omp && self.simd_nelements > 1;
        let line1 = if self.parallel > 0 {
            let mut line = String::from("#pragma omp for");
            if simd {
                line.push_str(&format!(" simd simdlen({})", self.simd_nelements));
            }
            line.push_str(&reduction);
            if self.parallel > 1 {
                line.push_str(&format!(" collapse({})", self.parallel));
            }
            line
        } else if self.simd_vec {
            String::new()
        } else if simd {
            format!("#pragma omp simd simdlen({}){reduction}", self.simd_nelements)
        } else if self.reduction_vars.is_empty() && gcc_vectorize {
            String::from("#pragma GCC ivdep")
        } else {
            String::new()
        };
        let line2 = format!(
            "for({INDEX_TYPE} {var}={}; {var}<{}; {var}+={})",
            self.offset,
            self.size,
            self.steps,
            var = cexpr(&self.var),
        );
        if self.collapsed || line1.is_empty() { vec![line2] } else { vec![line1, line2] }
    }
}

/// A loop nest supporting main/tail splitting of one level.
///
/// In the degenerate zero-dimension case `root` is empty and the kernel is
/// held directly.
#[derive(Debug, Clone, Default)]
pub struct LoopNest {
    levels: Vec<LoopLevel>,
    pub root: Vec<LevelId>,
    pub kernel: Option<KernelCode>,
}

impl LoopNest {
    /// Build a nest from a bound kernel's iteration space, attaching the
    /// kernel's emitted code at the leaf.
    pub fn build(kernel: &CppKernel) -> Result<LoopNest> {
        let space = kernel.space()?;
        let code = kernel.code();
        let simd_nelements = kernel.cfg.simd.map(|isa| isa.nelements).unwrap_or(0);

        let mut nest = LoopNest::default();
        let mut parent: Option<LevelId> = None;
        for (depth, (var, size)) in space.itervars.iter().zip(&space.call_ranges).enumerate() {
            let mut level = LoopLevel::new(var.clone(), *size, parent);
            level.simd_nelements = simd_nelements;
            if depth >= space.reduction_depth {
                level.reduction_vars = code.reduction_vars.clone();
            }
            let id = nest.levels.len();
            nest.levels.push(level);
            match parent {
                Some(p) => nest.levels[p].inner.push(id),
                None => nest.root.push(id),
            }
            parent = Some(id);
        }
        match parent {
            Some(leaf) => nest.levels[leaf].kernel = Some(code),
            None => nest.kernel = Some(code),
        }
        Ok(nest)
    }

    pub fn level(&self, id: LevelId) -> &LoopLevel {
        &self.levels[id]
    }

    pub fn level_mut(&mut self, id: LevelId) -> &mut LoopLevel {
        &mut self.levels[id]
    }

    /// All levels at `depth` (outermost is 0).
    pub fn loops_at(&self, depth: usize) -> Vec<LevelId> {
        fn descend(nest: &LoopNest, id: LevelId, depth: usize, out: &mut Vec<LevelId>) {
            if depth == 0 {
                out.push(id);
            } else {
                for &child in &nest.levels[id].inner {
                    descend(nest, child, depth - 1, out);
                }
            }
        }
        let mut out = Vec::new();
        for &id in &self.root {
            descend(self, id, depth, &mut out);
        }
        out
    }

    /// Maximal depth over which parallel marking is legal: single-child
    /// levels of uniform reduction-ness from the root down.
    pub fn max_parallel_depth(&self) -> usize {
        let mut depth = 0;
        let mut loops: &[LevelId] = &self.root;
        let is_reduction =
            loops.first().map(|&id| self.levels[id].is_reduction()).unwrap_or(false);
        while loops.len() == 1 && self.levels[loops[0]].is_reduction() == is_reduction {
            depth += 1;
            loops = &self.levels[loops[0]].inner;
        }
        depth
    }

    /// Whether all loops are reduction loops (reductions are always the
    /// innermost contiguous suffix, so checking the root is enough).
    pub fn is_reduction_only(&self) -> bool {
        self.root.first().map(|&id| self.levels[id].is_reduction()).unwrap_or(false)
    }

    /// Mark the leading `par_depth` levels as one collapsed parallel group.
    pub fn mark_parallel(&mut self, par_depth: usize) -> Result<()> {
        let max = self.max_parallel_depth();
        if par_depth > max {
            return Err(Error::SplitDepthExceeded { depth: par_depth, max });
        }
        if let Some(&first) = self.root.first() {
            self.levels[first].parallel = par_depth;
            let mut current = first;
            for _ in 1..par_depth {
                current = self.levels[current].inner[0];
                self.levels[current].collapsed = true;
            }
        }
        Ok(())
    }

    /// Split the level at `depth` into a main copy iterating
    /// `floor(size/factor)` times (the vector kernel scales its index by
    /// `factor`) and a tail copy covering `[floor(size/factor)*factor,
    /// size)`. Both copies deep-clone all descendants; kernels are
    /// re-attached afterwards with [`LoopNest::set_kernel_at`].
    pub fn split_with_tiling(&mut self, depth: usize, factor: i64) -> Result<(LevelId, LevelId)> {
        let ids = self.loops_at(depth);
        let id = match ids.as_slice() {
            &[id] => id,
            _ => return Err(Error::SplitDepthExceeded { depth, max: self.max_parallel_depth() }),
        };
        let template = self.levels[id].clone();

        let main_size = template.size / factor;
        let tail_offset = main_size * factor;

        let main_id = self.levels.len();
        let mut main = LoopLevel::new(template.var.clone(), main_size, template.parent);
        main.parallel = template.parallel;
        main.simd_nelements = template.simd_nelements;
        main.simd_vec = true;
        main.reduction_vars = template.reduction_vars.clone();
        self.levels.push(main);
        for &child in &template.inner {
            let cloned = self.clone_subtree(child, Some(main_id));
            self.levels[main_id].inner.push(cloned);
        }

        let tail_id = self.levels.len();
        let mut tail = LoopLevel::new(template.var.clone(), template.size, template.parent);
        tail.offset = tail_offset;
        tail.parallel = template.parallel;
        tail.simd_nelements = template.simd_nelements;
        tail.reduction_vars = template.reduction_vars.clone();
        self.levels.push(tail);
        for &child in &template.inner {
            let cloned = self.clone_subtree(child, Some(tail_id));
            self.levels[tail_id].inner.push(cloned);
        }

        match template.parent {
            Some(parent) => self.levels[parent].inner = vec![main_id, tail_id],
            None => self.root = vec![main_id, tail_id],
        }
        tracing::debug!(depth, factor, main_size, tail_offset, "split loop with tiling");
        Ok((main_id, tail_id))
    }

    fn clone_subtree(&mut self, id: LevelId, parent: Option<LevelId>) -> LevelId {
        let mut level = self.levels[id].clone();
        level.parent = parent;
        let children = std::mem::take(&mut level.inner);
        let new_id = self.levels.len();
        self.levels.push(level);
        for child in children {
            let cloned = self.clone_subtree(child, Some(new_id));
            self.levels[new_id].inner.push(cloned);
        }
        new_id
    }

    /// Attach `code` at the leaf under `id` and propagate its reduction
    /// accumulators up the contiguous reduction parent chain.
    pub fn set_kernel_at(&mut self, id: LevelId, code: KernelCode) {
        let mut current = id;
        while !self.levels[current].inner.is_empty() {
            debug_assert_eq!(self.levels[current].inner.len(), 1, "no split below a kernel");
            current = self.levels[current].inner[0];
        }
        if self.levels[current].is_reduction() {
            self.levels[current].reduction_vars = code.reduction_vars.clone();
            let mut up = self.levels[current].parent;
            while let Some(p) = up {
                if !self.levels[p].is_reduction() {
                    break;
                }
                let vars = code.reduction_vars.clone();
                self.levels[p].reduction_vars.extend(vars);
                up = self.levels[p].parent;
            }
        }
        self.levels[current].kernel = Some(code);
    }

    /// All kernels under a level, left to right.
    pub fn kernels_under(&self, id: LevelId) -> Vec<&KernelCode> {
        let mut out = Vec::new();
        self.collect_kernels(id, &mut out);
        out
    }

    fn collect_kernels<'a>(&'a self, id: LevelId, out: &mut Vec<&'a KernelCode>) {
        if let Some(kernel) = &self.levels[id].kernel {
            out.push(kernel);
        }
        for &child in &self.levels[id].inner {
            self.collect_kernels(child, out);
        }
    }
}

/// Emits parallel-region boundaries without nesting or duplicating them.
///
/// One coordinator spans all kernels of a kernel group; opening a region
/// while one with a different thread count is active closes the old region
/// first.
#[derive(Debug, Default)]
pub struct WorkSharing {
    in_parallel: bool,
    num_threads: usize,
}

impl WorkSharing {
    pub fn new() -> WorkSharing {
        WorkSharing::default()
    }

    pub fn in_parallel(&self) -> bool {
        self.in_parallel
    }

    pub fn parallel(&mut self, code: &mut CodeBuffer, threads: usize, dynamic: bool) {
        if self.in_parallel && threads != self.num_threads {
            // wrong thread count for the open region
            self.close(code);
        }
        if !self.in_parallel {
            self.num_threads = threads;
            self.in_parallel = true;
            if dynamic {
                code.writeline("#pragma omp parallel");
            } else {
                code.writeline(format!("#pragma omp parallel num_threads({threads})"));
            }
            code.open_brace();
        }
    }

    /// Serialize the following block when already inside a region.
    pub fn single(&mut self, code: &mut CodeBuffer) -> bool {
        if self.in_parallel {
            code.writeline("#pragma omp single");
        }
        self.in_parallel
    }

    pub fn close(&mut self, code: &mut CodeBuffer) {
        if self.in_parallel {
            code.close_brace();
            self.in_parallel = false;
        }
    }
}

/// Greedily accumulate leading dimensions into the parallel group while
/// the parallel factor is below the thread count and enough serial work
/// per thread remains.
pub fn decide_parallel_depth(
    ranges: &[i64],
    total_work: i64,
    threads: usize,
    cfg: &CppConfig,
) -> usize {
    let threads = threads as i64;
    let mut seq = total_work;
    let mut par: i64 = 1;
    let mut depth = 0;
    for &extent in ranges {
        if par >= 2 * threads || par == threads {
            break;
        }
        if seq / threads < cfg.min_chunk_size {
            // not enough work
            break;
        }
        depth += 1;
        par *= extent;
        seq /= extent;
    }
    // with a runtime-sized pool, keep at least one parallel scope and let
    // the OpenMP runtime arbitrate serial vs. parallel
    if cfg.dynamic_threads && depth == 0 && !ranges.is_empty() {
        depth = 1;
    }
    depth
}

/// Walk the nest and emit loops, work-sharing boundaries, reduction
/// prefixes/suffixes and kernel bodies.
pub(crate) fn codegen_loops_impl(
    nest: &mut LoopNest,
    call_ranges: &[i64],
    cfg: &CppConfig,
    code: &mut CodeBuffer,
    ws: &mut WorkSharing,
) -> Result<()> {
    let threads = cfg.parallel_num_threads();
    let max_depth = nest.max_parallel_depth();
    let total_work: i64 = call_ranges.iter().product();
    let par_depth = decide_parallel_depth(&call_ranges[..max_depth], total_work, threads, cfg);
    tracing::debug!(par_depth, threads, ranges = ?call_ranges, "loop nest codegen");

    let mut opened_single = false;
    if par_depth > 0 {
        if nest.is_reduction_only() {
            // reduction accumulators must be declared outside the region
            // whose directive names them as reduction targets
            ws.close(code);
        } else {
            ws.parallel(code, threads, cfg.dynamic_threads);
        }
        nest.mark_parallel(par_depth)?;
    } else if threads > 1 && ws.single(code) {
        code.open_brace();
        opened_single = true;
    }

    code.open_brace();
    if nest.root.is_empty() {
        if let Some(kernel) = &nest.kernel {
            gen_kernel(code, kernel);
        }
    } else {
        let root = nest.root.clone();
        gen_loops(nest, &root, false, threads, cfg, code, ws)?;
    }
    code.close_brace();
    if opened_single {
        code.close_brace();
    }
    Ok(())
}

fn gen_kernel(code: &mut CodeBuffer, kernel: &KernelCode) {
    code.splice(&kernel.loads);
    code.splice(&kernel.compute);
    code.splice(&kernel.stores);
}

fn gen_loops(
    nest: &LoopNest,
    ids: &[LevelId],
    in_reduction: bool,
    threads: usize,
    cfg: &CppConfig,
    code: &mut CodeBuffer,
    ws: &mut WorkSharing,
) -> Result<()> {
    let mut opened_prefix = false;
    if let Some(&first) = ids.first() {
        if nest.level(first).is_reduction() && !in_reduction {
            // with a split level the vector kernel's prefix declares the
            // accumulators for both halves
            let kernels = nest.kernels_under(first);
            if let Some(k0) = kernels.first() {
                if !k0.reduction_prefix.is_empty() {
                    code.open_brace();
                    opened_prefix = true;
                }
                code.splice(&k0.reduction_prefix);
            }
        }
        if nest.is_reduction_only() && nest.level(first).parallel > 0 {
            ws.parallel(code, threads, cfg.dynamic_threads);
        }
    }

    for &id in ids {
        gen_loop(nest, id, in_reduction, threads, cfg, code, ws)?;
    }

    if let Some(&last) = ids.last() {
        if nest.is_reduction_only() && nest.level(last).parallel > 0 {
            ws.close(code);
        }
        for &id in ids {
            if nest.level(id).is_reduction() && !in_reduction {
                for kernel in nest.kernels_under(id) {
                    code.splice(&kernel.reduction_suffix);
                }
            }
        }
    }
    if opened_prefix {
        code.close_brace();
    }
    Ok(())
}

fn gen_loop(
    nest: &LoopNest,
    id: LevelId,
    in_reduction: bool,
    threads: usize,
    cfg: &CppConfig,
    code: &mut CodeBuffer,
    ws: &mut WorkSharing,
) -> Result<()> {
    let level = nest.level(id);
    code.writelines(level.lines(cfg.gcc_vectorize));
    code.open_brace();
    if level.inner().is_empty() {
        let kernel = level.kernel().ok_or(Error::KernelNotBound)?;
        gen_kernel(code, kernel);
    } else {
        gen_loops(nest, level.inner(), level.is_reduction(), threads, cfg, code, ws)?;
    }
    code.close_brace();
    Ok(())
}
