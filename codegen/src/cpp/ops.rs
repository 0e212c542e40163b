//! Per-element operation text templates.
//!
//! Two parallel tables: [`scalar`] maps operations onto plain C++
//! expressions, [`vec`] onto the `at::vec::Vectorized` object dialect. The
//! vector table is partial; its `supports_*` predicates double as the
//! legality checker's allow-list, so the checker accepts exactly what the
//! vector kernel can emit.

use weft_dtype::DType;
use weft_ir::{BinaryOp, ConstValue, RandKind, UnaryOp};

use super::types::cpp_type;
use crate::error::{Error, Result};

pub(crate) fn float_literal(value: f64) -> String {
    format!("{value:?}")
}

/// Scalar C++ expression templates.
pub mod scalar {
    use super::*;

    /// Single-expression unary templates. `sign` is multi-statement and is
    /// emitted by the kernel itself.
    pub fn unary(op: UnaryOp, x: &str) -> String {
        match op {
            UnaryOp::Abs => format!("std::abs({x})"),
            UnaryOp::Neg => format!("-{x}"),
            UnaryOp::Exp => format!("std::exp({x})"),
            UnaryOp::Expm1 => format!("std::expm1({x})"),
            UnaryOp::Log => format!("std::log({x})"),
            UnaryOp::Log1p => format!("std::log1p({x})"),
            UnaryOp::Sqrt => format!("std::sqrt({x})"),
            UnaryOp::Rsqrt => format!("1 / std::sqrt({x})"),
            UnaryOp::Sin => format!("std::sin({x})"),
            UnaryOp::Cos => format!("std::cos({x})"),
            UnaryOp::Tanh => format!("std::tanh({x})"),
            UnaryOp::Erf => format!("std::erf({x})"),
            UnaryOp::Lgamma => format!("std::lgamma({x})"),
            UnaryOp::Floor => format!("std::floor({x})"),
            UnaryOp::Ceil => format!("std::ceil({x})"),
            UnaryOp::Trunc => format!("std::trunc({x})"),
            UnaryOp::Round => format!("std::nearbyint({x})"),
            UnaryOp::Relu => format!("{x} * ({x}>0)"),
            UnaryOp::Sigmoid => format!("1 / (1 + std::exp(-{x}))"),
            UnaryOp::Signbit => format!("std::signbit({x})"),
            UnaryOp::Reciprocal => format!("1 / {x}"),
            UnaryOp::Square => format!("{x} * {x}"),
            UnaryOp::IsInf => format!("std::isinf({x})"),
            UnaryOp::IsNan => format!("std::isnan({x})"),
            UnaryOp::Sign => unreachable!("sign is emitted statement-wise by the kernel"),
        }
    }

    pub fn binary(op: BinaryOp, a: &str, b: &str) -> String {
        match op {
            BinaryOp::Add => format!("{a} + {b}"),
            BinaryOp::Sub => format!("{a} - {b}"),
            BinaryOp::Mul => format!("{a} * {b}"),
            BinaryOp::Div => format!("{a} / {b}"),
            BinaryOp::Pow => format!("std::pow({a}, {b})"),
            BinaryOp::Fmod => format!("std::fmod({a}, {b})"),
            // positive-modulus helper from the kernel prefix header
            BinaryOp::Mod => format!("mod({a}, {b})"),
            BinaryOp::FloorDiv => {
                let quot = format!("{a} / {b}");
                let rem = format!("{a} % {b}");
                format!("(({a} < 0) != ({b} < 0) ? ({rem} != 0 ? {quot} - 1 : {quot}) : {quot})")
            }
            BinaryOp::TruncDiv => format!("{a} / {b}"),
            BinaryOp::Minimum => format!("({b} != {b}) ? {b} : std::min({a}, {b})"),
            BinaryOp::Maximum => format!("({b} != {b}) ? {b} : std::max({a}, {b})"),
            BinaryOp::LogicalAnd => format!("{a} && {b}"),
            BinaryOp::LogicalOr => format!("{a} || {b}"),
            BinaryOp::Eq => format!("{a} == {b}"),
            BinaryOp::Ne => format!("{a} != {b}"),
            BinaryOp::Lt => format!("{a} < {b}"),
            BinaryOp::Le => format!("{a} <= {b}"),
            BinaryOp::Gt => format!("{a} > {b}"),
            BinaryOp::Ge => format!("{a} >= {b}"),
        }
    }

    pub fn to_dtype(x: &str, dtype: DType) -> String {
        format!("static_cast<{}>({x})", cpp_type(dtype))
    }

    pub fn where_(cond: &str, then: &str, other: &str) -> String {
        format!("{cond} ? {then} : {other}")
    }

    pub fn constant(value: ConstValue, dtype: DType) -> String {
        let cpp = cpp_type(dtype);
        match value {
            ConstValue::Bool(b) => format!("static_cast<{cpp}>({b})"),
            ConstValue::Int(i) => format!("static_cast<{cpp}>({i})"),
            ConstValue::Float(f) if f.is_infinite() && f > 0.0 => {
                format!("std::numeric_limits<{cpp}>::infinity()")
            }
            ConstValue::Float(f) if f.is_infinite() => {
                format!("-std::numeric_limits<{cpp}>::infinity()")
            }
            ConstValue::Float(f) if f.is_nan() => {
                format!("std::numeric_limits<{cpp}>::quiet_NaN()")
            }
            ConstValue::Float(f) => format!("static_cast<{cpp}>({})", float_literal(f)),
        }
    }

    pub fn rand(kind: RandKind, seed: &str, offset: &str, dtype: DType) -> String {
        let helper = match kind {
            RandKind::Uniform => "normalized_rand_cpu",
            RandKind::Normal => "randn_cpu",
        };
        format!("static_cast<{}>({helper}({seed}, {offset}))", cpp_type(dtype))
    }
}

/// Vector (`at::vec::Vectorized`) expression templates.
pub mod vec {
    use super::*;

    /// Vector unary template, `None` when no vector form exists.
    pub fn try_unary(op: UnaryOp, x: &str) -> Option<String> {
        let text = match op {
            UnaryOp::Abs => format!("{x}.abs()"),
            UnaryOp::Neg => format!("{x}.neg()"),
            UnaryOp::Exp => format!("{x}.exp()"),
            UnaryOp::Expm1 => format!("{x}.expm1()"),
            UnaryOp::Log => format!("{x}.log()"),
            UnaryOp::Log1p => format!("{x}.log1p()"),
            UnaryOp::Sqrt => format!("{x}.sqrt()"),
            UnaryOp::Rsqrt => format!("{x}.rsqrt()"),
            UnaryOp::Sin => format!("{x}.sin()"),
            UnaryOp::Cos => format!("{x}.cos()"),
            UnaryOp::Tanh => format!("{x}.tanh()"),
            UnaryOp::Erf => format!("{x}.erf()"),
            UnaryOp::Lgamma => format!("{x}.lgamma()"),
            UnaryOp::Floor => format!("{x}.floor()"),
            UnaryOp::Ceil => format!("{x}.ceil()"),
            UnaryOp::Trunc => format!("{x}.trunc()"),
            UnaryOp::Round => format!("{x}.round()"),
            UnaryOp::Relu => format!("at::vec::clamp_min({x}, decltype({x})(0))"),
            UnaryOp::Sigmoid => {
                format!("decltype({x})(1)/(decltype({x})(1) + {x}.neg().exp())")
            }
            UnaryOp::Reciprocal => format!("{x}.reciprocal()"),
            UnaryOp::Square => format!("{x}.pow(2)"),
            // no vector form; these force the scalar fallback
            UnaryOp::Signbit | UnaryOp::IsInf | UnaryOp::IsNan => return None,
            UnaryOp::Sign => unreachable!("sign is emitted statement-wise by the kernel"),
        };
        Some(text)
    }

    pub fn unary(op: UnaryOp, x: &str) -> Result<String> {
        try_unary(op, x).ok_or_else(|| Error::UnsupportedOp { op: format!("vector {}", op.as_ref()) })
    }

    pub fn try_binary(op: BinaryOp, a: &str, b: &str) -> Option<String> {
        let text = match op {
            BinaryOp::Add => format!("{a} + {b}"),
            BinaryOp::Sub => format!("{a} - {b}"),
            BinaryOp::Mul => format!("{a} * {b}"),
            BinaryOp::Div => format!("{a} / {b}"),
            BinaryOp::Pow => format!("{a}.pow({b})"),
            BinaryOp::Fmod => format!("{a}.fmod({b})"),
            BinaryOp::FloorDiv => {
                let t = format!("decltype({a})");
                let quot = format!("{a} / {b}");
                let rem = format!("{a} % {b}");
                format!(
                    "(({a} < {t}(0)) != ({b} < {t}(0)) ? ({rem} != {t}(0) ? {quot} - {t}(1) : {quot}) : {quot})"
                )
            }
            BinaryOp::TruncDiv => format!("{a} / {b}"),
            BinaryOp::Minimum => format!("at::vec::minimum({a}, {b})"),
            BinaryOp::Maximum => format!("at::vec::maximum({a}, {b})"),
            BinaryOp::LogicalAnd => format!("{a} && {b}"),
            BinaryOp::LogicalOr => format!("{a} || {b}"),
            // no vector form for modulus and comparisons
            BinaryOp::Mod
            | BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => return None,
        };
        Some(text)
    }

    pub fn binary(op: BinaryOp, a: &str, b: &str) -> Result<String> {
        try_binary(op, a, b)
            .ok_or_else(|| Error::UnsupportedOp { op: format!("vector {}", op.as_ref()) })
    }

    pub fn constant(value: ConstValue, dtype: DType) -> String {
        let cpp = cpp_type(dtype);
        let quote = match value {
            ConstValue::Float(f) if f.is_infinite() && f > 0.0 => {
                format!("std::numeric_limits<{cpp}>::infinity()")
            }
            ConstValue::Float(f) if f.is_infinite() => {
                format!("-std::numeric_limits<{cpp}>::infinity()")
            }
            ConstValue::Float(f) if f.is_nan() => {
                format!("std::numeric_limits<{cpp}>::quiet_NaN()")
            }
            ConstValue::Float(f) => format!("static_cast<{cpp}>({})", float_literal(f)),
            ConstValue::Bool(b) => format!("static_cast<{cpp}>({b})"),
            ConstValue::Int(i) => format!("static_cast<{cpp}>({i})"),
        };
        format!("at::vec::Vectorized<{cpp}>({quote})")
    }

    pub fn where_(cond: &str, then: &str, other: &str) -> String {
        format!("decltype({then})::blendv({other}, {then}, {cond})")
    }

    /// Vector `to_dtype` is an identity on bool masks only.
    pub fn to_dtype(x: &str, dtype: DType) -> Result<String> {
        if dtype == DType::Bool {
            Ok(format!("({x})"))
        } else {
            Err(Error::UnsupportedOp { op: format!("vector to_dtype({dtype:?})") })
        }
    }

    // Allow-list predicates: one entry per operation the vector kernel
    // actually knows how to emit.

    pub fn supports_unary(op: UnaryOp) -> bool {
        op == UnaryOp::Sign || try_unary(op, "x").is_some()
    }

    pub fn supports_binary(op: BinaryOp) -> bool {
        try_binary(op, "x", "y").is_some()
    }
}
