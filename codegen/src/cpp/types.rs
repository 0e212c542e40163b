//! C++ type mapping and reduction identity/combine rules.

use weft_dtype::DType;
use weft_ir::ReduceOp;

use crate::error::{Error, Result};

/// Loop index type of all generated loops. 64-bit signed.
pub const INDEX_TYPE: &str = "long";

/// C++ spelling of a scalar element type.
pub fn cpp_type(dtype: DType) -> &'static str {
    match dtype {
        DType::Bool => "bool",
        DType::Int8 => "signed char",
        DType::UInt8 => "unsigned char",
        DType::Int16 => "short",
        DType::Int32 => "int",
        DType::Int64 => "long",
        DType::Float16 => "half",
        DType::BFloat16 => "bfloat16",
        DType::Float32 => "float",
        DType::Float64 => "double",
    }
}

/// Token naming a reduction kind inside OpenMP reduction clauses.
pub fn reduction_token(op: ReduceOp) -> &'static str {
    match op {
        ReduceOp::Sum => "+",
        ReduceOp::Any => "||",
        ReduceOp::Min => "min",
        ReduceOp::Max => "max",
        ReduceOp::Argmin => "argmin",
        ReduceOp::Argmax => "argmax",
    }
}

/// Identity value seeding a reduction accumulator.
///
/// `reduce(identity, x) == x` for every `x` of the element type.
pub fn reduction_init(op: ReduceOp, dtype: DType) -> String {
    let cpp = cpp_type(dtype);
    match op {
        ReduceOp::Sum | ReduceOp::Any => "0".to_string(),
        ReduceOp::Max | ReduceOp::Argmax => {
            if dtype.is_float() {
                format!("-std::numeric_limits<{cpp}>::infinity()")
            } else {
                format!("std::numeric_limits<{cpp}>::min()")
            }
        }
        ReduceOp::Min | ReduceOp::Argmin => {
            if dtype.is_float() {
                format!("std::numeric_limits<{cpp}>::infinity()")
            } else {
                format!("std::numeric_limits<{cpp}>::max()")
            }
        }
    }
}

/// Scalar combine statement for a plain (non index-carrying) reduction.
pub fn reduction_combine(op: ReduceOp, var: &str, next: &str) -> String {
    match op {
        ReduceOp::Sum => format!("{var} += {next}"),
        ReduceOp::Any => format!("{var} = {var} || {next}"),
        ReduceOp::Min => format!("{var} = std::min({var}, {next})"),
        ReduceOp::Max => format!("{var} = std::max({var}, {next})"),
        ReduceOp::Argmin | ReduceOp::Argmax => {
            unreachable!("index-carrying reductions combine inline in the kernel body")
        }
    }
}

/// Vector combine statement. Only sum/min/max have a vector form.
pub fn reduction_combine_vec(
    op: ReduceOp,
    var: &str,
    next: &str,
    dtype: DType,
    src_dtype: DType,
) -> Result<String> {
    match op {
        ReduceOp::Sum => Ok(format!("{var} += {next}")),
        ReduceOp::Min => Ok(format!("{var} = at::vec::minimum({var}, {next})")),
        ReduceOp::Max => Ok(format!("{var} = at::vec::maximum({var}, {next})")),
        _ => Err(Error::UnsupportedReduction { kind: op, dtype, src_dtype }),
    }
}

/// Declarations opening an argmax/argmin reduction: the paired
/// (index, value) accumulator struct, its identity-seeded instance and the
/// OpenMP declare-reduction operator. The combine keeps the accumulator on
/// ties, so the first-seen extremal index wins.
pub fn argmax_argmin_prefix(
    op: ReduceOp,
    src_dtype: DType,
    tmpvar: &str,
    struct_id: usize,
) -> Vec<String> {
    debug_assert!(op.is_arg());
    let struct_name = format!("IndexValue_{struct_id}");
    let init = reduction_init(op, src_dtype);
    let mut prefix = vec![
        format!("struct {struct_name} {{size_t index; {} value;}};", cpp_type(src_dtype)),
        format!("{struct_name} {tmpvar}{{0, {init}}};"),
    ];
    let cmp = if op == ReduceOp::Argmax { "<" } else { ">" };
    prefix.extend([
        format!("#pragma omp declare reduction({} : struct {struct_name} :\\", reduction_token(op)),
        format!("    omp_out.value = omp_in.value {cmp} omp_out.value ? omp_out.value : omp_in.value,\\"),
        format!("    omp_out.index = omp_in.value {cmp} omp_out.value ? omp_out.index : omp_in.index)\\"),
        format!("\tinitializer(omp_priv = {{0, {init}}})"),
    ]);
    prefix
}

/// Declare-reduction operator for narrow-float accumulation. Only sum and
/// any have a narrow combine rule; every other kind must be rejected by the
/// caller before emission.
pub fn narrow_float_reduction_prefix(op: ReduceOp, dtype: DType) -> Result<Vec<String>> {
    if !matches!(op, ReduceOp::Sum | ReduceOp::Any) {
        return Err(Error::UnsupportedReduction { kind: op, dtype, src_dtype: dtype });
    }
    let token = reduction_token(op);
    Ok(vec![format!(
        "#pragma omp declare reduction({token}:{}:omp_out = omp_out {token} omp_in)",
        cpp_type(dtype)
    )])
}
