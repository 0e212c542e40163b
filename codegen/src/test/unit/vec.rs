//! Vector kernel tests: index transformation, access forms, reductions.

use weft_dtype::DType;
use weft_ir::{Expr, OpsHandler, ReduceOp, StoreMode};

use super::support::{TEST_ISA, f32_graph, session, vec_kernel};
use crate::error::Error;

fn i0() -> Expr {
    Expr::var("i0")
}

#[test]
fn transform_index_scales_the_innermost_variable() {
    let sess = session(1, Some(TEST_ISA), f32_graph(&[]));
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[16, 64], &[]).unwrap();

    let transformed = kernel.transform_index(&Expr::var("i1")).unwrap();
    assert_eq!(transformed, Expr::mul(Expr::var("i1"), Expr::int(8)));

    // outer variables are untouched
    let transformed = kernel.transform_index(&Expr::var("i0")).unwrap();
    assert_eq!(transformed, Expr::var("i0"));
}

#[test]
fn unit_stride_load_is_a_vector_load() {
    let sess = session(1, Some(TEST_ISA), f32_graph(&["in0"]));
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[64], &[]).unwrap();

    kernel.load("in0", &i0()).unwrap();
    let loads = kernel.code().loads.render();
    assert!(loads.contains("at::vec::Vectorized<float>::loadu(in_ptr0 + i0*8)"), "{loads}");
}

#[test]
fn invariant_load_broadcasts() {
    let sess = session(1, Some(TEST_ISA), f32_graph(&["in0"]));
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[16, 64], &[]).unwrap();

    kernel.load("in0", &i0()).unwrap();
    let loads = kernel.code().loads.render();
    assert!(loads.contains("at::vec::Vectorized<float>(in_ptr0[i0])"), "{loads}");
    assert!(!loads.contains("loadu"));
}

#[test]
fn bool_loads_expand_through_the_scratch_buffer_once_per_argument() {
    let mut graph = f32_graph(&[]);
    graph.declare_buffer("flags", DType::Bool);
    let sess = session(1, Some(TEST_ISA), graph);
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[64], &[]).unwrap();

    let a = kernel.load("flags", &i0()).unwrap();
    let b = kernel.load("flags", &i0()).unwrap();
    assert_eq!(a, b);

    let loads = kernel.code().loads.render();
    assert_eq!(loads.matches("float g_tmp_buffer_in_ptr0[8] = {0};").count(), 1, "{loads}");
    assert_eq!(loads.matches("flag_to_float(in_ptr0 + i0*8, g_tmp_buffer_in_ptr0, 8);").count(), 1);
    assert!(loads.contains("at::vec::Vectorized<float>::loadu(g_tmp_buffer_in_ptr0)"));
}

#[test]
fn broadcast_store_is_illegal() {
    let sess = session(1, Some(TEST_ISA), f32_graph(&["out0"]));
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[16, 64], &[]).unwrap();

    // the index ignores the innermost variable
    let err = kernel.store("out0", &i0(), "tmp0".to_string(), StoreMode::Plain).unwrap_err();
    assert!(matches!(err, Error::IllegalAccess { .. }));
}

#[test]
fn store_modes_have_no_vector_form() {
    let sess = session(1, Some(TEST_ISA), f32_graph(&["out0"]));
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[64], &[]).unwrap();

    let err = kernel.store("out0", &i0(), "tmp0".to_string(), StoreMode::AtomicAdd).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOp { .. }));
}

#[test]
fn unit_stride_store_scales_the_index() {
    let sess = session(1, Some(TEST_ISA), f32_graph(&["out0"]));
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[64], &[]).unwrap();

    kernel.store("out0", &i0(), "tmp0".to_string(), StoreMode::Plain).unwrap();
    let stores = kernel.code().stores.render();
    assert!(stores.contains("tmp0.store(out_ptr0 + i0*8);"), "{stores}");
}

#[test]
fn vector_reduction_keeps_a_scalar_shadow_and_never_stores() {
    let sess = session(1, Some(TEST_ISA), f32_graph(&["in0", "out0"]));
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[], &[64]).unwrap();

    let v = kernel.load("in0", &i0()).unwrap();
    kernel
        .reduction("out0", DType::Float32, DType::Float32, ReduceOp::Max, &Expr::int(0), v)
        .unwrap();

    let code = kernel.code();
    let prefix = code.reduction_prefix.render();
    assert!(
        prefix.contains(
            "#pragma omp declare reduction(max:at::vec::Vectorized<float>:\
             omp_out = at::vec::maximum(omp_out, omp_in)) \
             initializer(omp_priv={{-std::numeric_limits<float>::infinity()}})"
        ),
        "{prefix}"
    );
    assert!(prefix.contains("float tmp1 = -std::numeric_limits<float>::infinity();"));
    assert!(prefix.contains("auto tmp1_vec = at::vec::Vectorized<float>(tmp1);"));

    assert!(code.stores.render().contains("tmp1_vec = at::vec::maximum(tmp1_vec, tmp0);"));

    let suffix = code.reduction_suffix.render();
    assert!(suffix.contains("tmp1 = std::max(tmp1, at::vec::vec_reduce_all<float>"), "{suffix}");
    // the scalar tail kernel owns the final store
    assert!(!suffix.contains("out_ptr"));

    assert_eq!(code.reduction_vars.get("tmp1_vec"), Some(&ReduceOp::Max));
}

#[test]
fn vector_reductions_are_float32_sum_min_max_only() {
    let sess = session(1, Some(TEST_ISA), f32_graph(&["in0", "out0"]));
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[], &[64]).unwrap();

    let err = kernel
        .reduction(
            "out0",
            DType::Float32,
            DType::Float32,
            ReduceOp::Argmax,
            &Expr::int(0),
            "tmp0".to_string(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedReduction { kind: ReduceOp::Argmax, .. }));

    let err = kernel
        .reduction(
            "out0",
            DType::Float64,
            DType::Float64,
            ReduceOp::Sum,
            &Expr::int(0),
            "tmp0".to_string(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedReduction { dtype: DType::Float64, .. }));
}

#[test]
fn relu_uses_the_vector_clamp() {
    let sess = session(1, Some(TEST_ISA), f32_graph(&["in0"]));
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[64], &[]).unwrap();

    let v = kernel.load("in0", &i0()).unwrap();
    kernel.unary(weft_ir::UnaryOp::Relu, v).unwrap();
    let compute = kernel.code().compute.render();
    assert!(compute.contains("at::vec::clamp_min(tmp0, decltype(tmp0)(0))"), "{compute}");
}

#[test]
fn scalar_only_operations_are_rejected() {
    let sess = session(1, Some(TEST_ISA), f32_graph(&["in0"]));
    let mut kernel = vec_kernel(&sess);
    kernel.set_ranges(&[64], &[]).unwrap();

    let err = kernel.unary(weft_ir::UnaryOp::IsNan, "tmp0".to_string()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOp { .. }));
    let err = kernel
        .binary(weft_ir::BinaryOp::Lt, "tmp0".to_string(), "tmp1".to_string())
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedOp { .. }));
    let err = kernel.index_expr(&i0(), DType::Int64).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOp { .. }));
}
