//! Reduction identity and combine-rule tests.

use test_case::test_case;
use weft_dtype::DType;
use weft_ir::ReduceOp;

use crate::cpp::types::{
    argmax_argmin_prefix, narrow_float_reduction_prefix, reduction_combine,
    reduction_combine_vec, reduction_init,
};
use crate::error::Error;

#[test_case(ReduceOp::Sum, DType::Float32, "0"; "sum identity")]
#[test_case(ReduceOp::Any, DType::Bool, "0"; "any identity")]
#[test_case(
    ReduceOp::Max,
    DType::Float32,
    "-std::numeric_limits<float>::infinity()";
    "float max identity"
)]
#[test_case(
    ReduceOp::Min,
    DType::Float32,
    "std::numeric_limits<float>::infinity()";
    "float min identity"
)]
#[test_case(
    ReduceOp::Max,
    DType::Int32,
    "std::numeric_limits<int>::min()";
    "int max identity"
)]
#[test_case(
    ReduceOp::Min,
    DType::Int64,
    "std::numeric_limits<long>::max()";
    "int min identity"
)]
#[test_case(
    ReduceOp::Argmax,
    DType::Float32,
    "-std::numeric_limits<float>::infinity()";
    "argmax identity"
)]
fn identities(op: ReduceOp, dtype: DType, expected: &str) {
    assert_eq!(reduction_init(op, dtype), expected);
}

#[test]
fn combine_rules() {
    assert_eq!(reduction_combine(ReduceOp::Sum, "acc", "x"), "acc += x");
    assert_eq!(reduction_combine(ReduceOp::Any, "acc", "x"), "acc = acc || x");
    assert_eq!(reduction_combine(ReduceOp::Min, "acc", "x"), "acc = std::min(acc, x)");
    assert_eq!(reduction_combine(ReduceOp::Max, "acc", "x"), "acc = std::max(acc, x)");
}

#[test]
fn vector_combine_rules() {
    assert_eq!(
        reduction_combine_vec(ReduceOp::Sum, "acc", "x", DType::Float32, DType::Float32)
            .unwrap(),
        "acc += x"
    );
    assert_eq!(
        reduction_combine_vec(ReduceOp::Max, "acc", "x", DType::Float32, DType::Float32)
            .unwrap(),
        "acc = at::vec::maximum(acc, x)"
    );
    let err = reduction_combine_vec(ReduceOp::Argmax, "acc", "x", DType::Float32, DType::Float32)
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedReduction { kind: ReduceOp::Argmax, .. }));
}

#[test]
fn argmax_prefix_declares_struct_and_operator() {
    let lines = argmax_argmin_prefix(ReduceOp::Argmax, DType::Float32, "tmp0", 1);
    assert_eq!(lines[0], "struct IndexValue_1 {size_t index; float value;};");
    assert_eq!(lines[1], "IndexValue_1 tmp0{0, -std::numeric_limits<float>::infinity()};");
    assert!(lines[2].starts_with("#pragma omp declare reduction(argmax : struct IndexValue_1 :"));
    assert!(lines.iter().any(|l| l.contains("initializer(omp_priv = {0,")));
}

#[test]
fn argmin_prefix_uses_opposite_comparison() {
    let lines = argmax_argmin_prefix(ReduceOp::Argmin, DType::Float32, "tmp0", 2);
    assert_eq!(lines[1], "IndexValue_2 tmp0{0, std::numeric_limits<float>::infinity()};");
    assert!(lines.iter().any(|l| l.contains("omp_in.value > omp_out.value")));
}

#[test]
fn narrow_float_combine_is_sum_and_any_only() {
    let lines = narrow_float_reduction_prefix(ReduceOp::Sum, DType::Float16).unwrap();
    assert_eq!(lines, vec!["#pragma omp declare reduction(+:half:omp_out = omp_out + omp_in)"]);

    let lines = narrow_float_reduction_prefix(ReduceOp::Any, DType::BFloat16).unwrap();
    assert_eq!(
        lines,
        vec!["#pragma omp declare reduction(||:bfloat16:omp_out = omp_out || omp_in)"]
    );

    let err = narrow_float_reduction_prefix(ReduceOp::Max, DType::Float16).unwrap_err();
    assert!(matches!(err, Error::UnsupportedReduction { kind: ReduceOp::Max, .. }));
}

/// `reduce(identity, x) == x` for the numeric identities.
#[test]
fn identity_is_neutral() {
    for x in [-3.5f32, 0.0, 7.25] {
        assert_eq!(0.0 + x, x);
        assert_eq!(f32::NEG_INFINITY.max(x), x);
        assert_eq!(f32::INFINITY.min(x), x);
    }
    assert_eq!(i32::MIN.max(-7), -7);
    assert_eq!(i64::MAX.min(42), 42);
}
