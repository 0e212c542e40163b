//! Loop nest, work-sharing and parallel-depth heuristic tests.

use proptest::prelude::*;
use test_case::test_case;
use weft_dtype::DType;
use weft_ir::{Expr, OpsHandler, ReduceOp};

use super::support::{config, f32_graph, scalar_kernel, session};
use crate::common::CodeBuffer;
use crate::cpp::kernel::CppKernel;
use crate::cpp::loops::{LoopNest, WorkSharing, decide_parallel_depth};
use crate::error::Error;
use crate::session::{CodegenSession, CppConfig};

fn pointwise_nest(sess: &CodegenSession, ranges: &[i64]) -> (CppKernel, LoopNest) {
    let mut kernel = scalar_kernel(sess);
    kernel.set_ranges(ranges, &[]).unwrap();
    let nest = LoopNest::build(&kernel).unwrap();
    (kernel, nest)
}

fn reduction_kernel(sess: &CodegenSession, iter: &[i64], reduce: &[i64]) -> CppKernel {
    let mut kernel = scalar_kernel(sess);
    kernel.set_ranges(iter, reduce).unwrap();
    let v = kernel.load("in0", &Expr::var(format!("i{}", iter.len()))).unwrap();
    kernel
        .reduction("out0", DType::Float32, DType::Float32, ReduceOp::Sum, &Expr::int(0), v)
        .unwrap();
    kernel
}

#[test]
fn build_chains_levels_and_marks_reductions() {
    let sess = session(1, None, f32_graph(&["in0", "out0"]));
    let kernel = reduction_kernel(&sess, &[4], &[8]);
    let nest = LoopNest::build(&kernel).unwrap();

    assert_eq!(nest.root.len(), 1);
    let outer = nest.root[0];
    assert!(!nest.level(outer).is_reduction());
    assert_eq!(nest.level(outer).size, 4);

    let inner = nest.loops_at(1);
    assert_eq!(inner.len(), 1);
    assert!(nest.level(inner[0]).is_reduction());
    assert_eq!(nest.level(inner[0]).size, 8);

    // uniform reduction-ness bounds the parallel prefix
    assert_eq!(nest.max_parallel_depth(), 1);
}

#[test]
fn zero_dimensional_nest_holds_the_kernel_directly() {
    let sess = session(1, None, f32_graph(&[]));
    let (_kernel, nest) = pointwise_nest(&sess, &[]);
    assert!(nest.root.is_empty());
    assert!(nest.kernel.is_some());
    assert_eq!(nest.max_parallel_depth(), 0);
}

proptest! {
    /// Main indices cover `[0, floor(n/w)*w)` in vector steps and the tail
    /// covers `[floor(n/w)*w, n)`: exactly `[0, n)`, no overlap, no gap.
    #[test]
    fn split_covers_the_range_exactly(n in 1i64..10_000, w in 1i64..64) {
        let sess = session(1, None, f32_graph(&[]));
        let (_kernel, mut nest) = pointwise_nest(&sess, &[n]);
        let (main, tail) = nest.split_with_tiling(0, w).unwrap();

        let main = nest.level(main);
        let tail = nest.level(tail);
        prop_assert_eq!(main.offset, 0);
        prop_assert_eq!(main.size, n / w);
        prop_assert_eq!(main.steps, 1);
        prop_assert_eq!(tail.offset, (n / w) * w);
        prop_assert_eq!(tail.size, n);

        // vector main loop covers w iterations per step
        prop_assert_eq!(main.size * w + (tail.size - tail.offset), n);
        prop_assert!(tail.offset >= 0 && tail.offset <= n);
    }
}

#[test]
fn split_replaces_the_level_with_main_and_tail() {
    let sess = session(1, None, f32_graph(&["in0", "out0"]));
    let kernel = reduction_kernel(&sess, &[4], &[33]);
    let mut nest = LoopNest::build(&kernel).unwrap();

    let (main, tail) = nest.split_with_tiling(1, 8).unwrap();
    let outer = nest.root[0];
    assert_eq!(nest.level(outer).inner(), &[main, tail]);
    assert!(nest.level(main).is_reduction());
    assert!(nest.level(main).simd_vec);
    assert!(!nest.level(tail).simd_vec);
    assert_eq!(nest.level(main).size, 4);
    assert_eq!(nest.level(tail).offset, 32);

    // the split point now has two children, so no parallel depth remains
    // past the outer level
    assert_eq!(nest.max_parallel_depth(), 1);
}

#[test]
fn split_depth_must_resolve_to_exactly_one_level() {
    let sess = session(1, None, f32_graph(&[]));
    let (_kernel, mut nest) = pointwise_nest(&sess, &[100]);
    nest.split_with_tiling(0, 8).unwrap();
    let err = nest.split_with_tiling(0, 8).unwrap_err();
    assert!(matches!(err, Error::SplitDepthExceeded { .. }));
}

#[test]
fn set_kernel_replaces_leaf_reduction_state() {
    let sess = session(1, None, f32_graph(&["in0", "out0"]));
    let kernel = reduction_kernel(&sess, &[], &[64]);
    let mut nest = LoopNest::build(&kernel).unwrap();
    let (main, tail) = nest.split_with_tiling(0, 8).unwrap();

    let mut vec_code = kernel.code();
    vec_code.reduction_vars.clear();
    vec_code.reduction_vars.insert("tmp1_vec".to_string(), ReduceOp::Sum);
    nest.set_kernel_at(main, vec_code);
    nest.set_kernel_at(tail, kernel.code());

    assert!(nest.level(main).reduction_vars.contains_key("tmp1_vec"));
    assert!(nest.level(tail).reduction_vars.contains_key("tmp1"));
    assert!(nest.level(main).kernel().is_some());
}

#[test]
fn mark_parallel_collapses_inner_levels() {
    let sess = session(1, None, f32_graph(&[]));
    let (_kernel, mut nest) = pointwise_nest(&sess, &[128, 64]);
    nest.mark_parallel(2).unwrap();

    let outer = nest.root[0];
    let inner = nest.level(outer).inner()[0];
    assert_eq!(nest.level(outer).parallel, 2);
    assert!(nest.level(inner).collapsed);

    assert_eq!(
        nest.level(outer).lines(false),
        vec!["#pragma omp for collapse(2)", "for(long i0=0; i0<128; i0+=1)"]
    );
    assert_eq!(nest.level(inner).lines(false), vec!["for(long i1=0; i1<64; i1+=1)"]);
}

#[test]
fn mark_parallel_beyond_the_nest_fails() {
    let sess = session(1, None, f32_graph(&[]));
    let (_kernel, mut nest) = pointwise_nest(&sess, &[128, 64]);
    let err = nest.mark_parallel(3).unwrap_err();
    assert!(matches!(err, Error::SplitDepthExceeded { depth: 3, max: 2 }));
}

#[test]
fn parallel_reduction_loop_lists_its_accumulators() {
    let sess = session(1, None, f32_graph(&["in0", "out0"]));
    let kernel = reduction_kernel(&sess, &[], &[4096]);
    let mut nest = LoopNest::build(&kernel).unwrap();
    nest.mark_parallel(1).unwrap();

    let lines = nest.level(nest.root[0]).lines(false);
    assert_eq!(lines[0], "#pragma omp for reduction(+:tmp1)");
}

#[test]
fn omp_simd_loops_carry_the_lane_count() {
    let sess = session(1, None, f32_graph(&[]));
    let (_kernel, mut nest) = pointwise_nest(&sess, &[64]);
    let root = nest.root[0];
    nest.level_mut(root).simd_omp = true;
    nest.level_mut(root).simd_nelements = 8;

    let lines = nest.level(root).lines(false);
    assert_eq!(lines[0], "#pragma omp simd simdlen(8)");

    // folded into the enclosing parallel directive instead
    nest.level_mut(root).parallel = 1;
    let lines = nest.level(root).lines(false);
    assert_eq!(lines[0], "#pragma omp for simd simdlen(8)");
}

#[test]
fn serial_loops_can_request_ivdep() {
    let sess = session(1, None, f32_graph(&[]));
    let (_kernel, nest) = pointwise_nest(&sess, &[64]);
    let lines = nest.level(nest.root[0]).lines(true);
    assert_eq!(lines, vec!["#pragma GCC ivdep", "for(long i0=0; i0<64; i0+=1)"]);

    let lines = nest.level(nest.root[0]).lines(false);
    assert_eq!(lines, vec!["for(long i0=0; i0<64; i0+=1)"]);
}

#[test]
fn work_sharing_never_nests_and_reopens_on_thread_count_change() {
    let mut code = CodeBuffer::new();
    let mut ws = WorkSharing::new();

    ws.parallel(&mut code, 4, false);
    ws.parallel(&mut code, 4, false);
    assert!(ws.in_parallel());
    ws.parallel(&mut code, 8, false);
    ws.close(&mut code);
    ws.close(&mut code);

    let text = code.render();
    assert_eq!(text.matches("#pragma omp parallel num_threads(4)").count(), 1);
    assert_eq!(text.matches("#pragma omp parallel num_threads(8)").count(), 1);
    assert_eq!(text.matches('{').count(), text.matches('}').count());
}

#[test]
fn work_sharing_single_only_inside_a_region() {
    let mut code = CodeBuffer::new();
    let mut ws = WorkSharing::new();
    assert!(!ws.single(&mut code));
    assert!(code.render().is_empty());

    ws.parallel(&mut code, 4, false);
    assert!(ws.single(&mut code));
    assert!(code.render().contains("#pragma omp single"));
}

#[test]
fn dynamic_regions_omit_the_thread_count() {
    let mut code = CodeBuffer::new();
    let mut ws = WorkSharing::new();
    ws.parallel(&mut code, 4, true);
    ws.close(&mut code);
    let text = code.render();
    assert!(text.contains("#pragma omp parallel\n"));
    assert!(!text.contains("num_threads"));
}

#[test_case(2; "two threads")]
#[test_case(4; "four threads")]
#[test_case(8; "eight threads")]
fn parallel_depth_stops_once_the_pool_is_covered(threads: usize) {
    // [1000, 4] with min chunk 16: dimension 0 alone already saturates the
    // pool, so depth must stop at 1
    let cfg = CppConfig { min_chunk_size: 16, ..config(threads, None) };
    let depth = decide_parallel_depth(&[1000, 4], 4000, threads, &cfg);
    assert_eq!(depth, 1);
}

#[test]
fn parallel_depth_respects_the_chunk_threshold() {
    let cfg = CppConfig { min_chunk_size: 4096, ..config(8, None) };
    assert_eq!(decide_parallel_depth(&[64, 64], 4096, 8, &cfg), 0);

    // dynamic pools force one level so the runtime can arbitrate
    let cfg = CppConfig { dynamic_threads: true, ..cfg };
    assert_eq!(decide_parallel_depth(&[64, 64], 4096, 8, &cfg), 1);
    assert_eq!(decide_parallel_depth(&[], 1, 8, &cfg), 0);
}

#[test]
fn parallel_depth_grows_until_the_thread_count() {
    let cfg = CppConfig { min_chunk_size: 1, ..config(16, None) };
    // 4 * 4 == threads: both levels join the group
    assert_eq!(decide_parallel_depth(&[4, 4, 1024], 16384, 16, &cfg), 2);
}
