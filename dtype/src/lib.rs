//! Scalar element types for weft kernels.
//!
//! Buffers handed to the code generator are typed with a [`DType`]; the
//! classification helpers here drive widening, reduction-identity and
//! vectorization-legality decisions downstream.

/// Scalar data types supported by generated kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::AsRefStr)]
pub enum DType {
    Bool,

    Int8,
    UInt8,
    Int16,
    Int32,
    Int64,

    Float16,
    BFloat16,
    Float32,
    Float64,
}

impl DType {
    /// Whether this is a floating-point type (including the narrow ones).
    pub fn is_float(self) -> bool {
        matches!(self, DType::Float16 | DType::BFloat16 | DType::Float32 | DType::Float64)
    }

    /// Half-precision floats that are widened to `float` before arithmetic.
    pub fn is_narrow_float(self) -> bool {
        matches!(self, DType::Float16 | DType::BFloat16)
    }

    pub fn is_signed_int(self) -> bool {
        matches!(self, DType::Int8 | DType::Int16 | DType::Int32 | DType::Int64)
    }

    pub fn is_integer(self) -> bool {
        self.is_signed_int() || matches!(self, DType::UInt8)
    }

    /// Size of one element in bytes.
    pub fn bytes(self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::UInt8 => 1,
            DType::Int16 | DType::Float16 | DType::BFloat16 => 2,
            DType::Int32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 => 8,
        }
    }
}
