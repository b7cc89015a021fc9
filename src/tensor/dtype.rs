//! Element type definitions
//!
//! Element types carried on graph edges and the predicates the matcher uses
//! to tell float attention from its int8 quantized variant.

use std::fmt;

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// 32-bit float
    F32,
    /// 16-bit float
    F16,
    /// bfloat16
    Bf16,
    /// 64-bit signed integer
    I64,
    /// 32-bit signed integer
    I32,
    /// 8-bit signed integer
    I8,
    /// 8-bit unsigned integer
    U8,
    /// Boolean
    Boolean,
}

impl ElementType {
    /// Size in bytes of one element
    pub fn size(self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F16 | ElementType::Bf16 => 2,
            ElementType::I64 => 8,
            ElementType::I8 | ElementType::U8 | ElementType::Boolean => 1,
        }
    }

    /// Check if the type is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F16 | ElementType::Bf16)
    }

    /// Check if the type is an integer type
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            ElementType::I64 | ElementType::I32 | ElementType::I8 | ElementType::U8
        )
    }

    /// Check if the type is one of the 8-bit quantized storage types
    pub fn is_quantized(self) -> bool {
        matches!(self, ElementType::I8 | ElementType::U8)
    }

    /// Check if the type is signed
    pub fn is_signed(self) -> bool {
        !matches!(self, ElementType::U8 | ElementType::Boolean)
    }

    /// Representable value range, if the type is a bounded integer
    pub fn integral_range(self) -> Option<(f32, f32)> {
        match self {
            ElementType::I8 => Some((i8::MIN as f32, i8::MAX as f32)),
            ElementType::U8 => Some((u8::MIN as f32, u8::MAX as f32)),
            ElementType::I32 => Some((i32::MIN as f32, i32::MAX as f32)),
            ElementType::Boolean => Some((0.0, 1.0)),
            _ => None,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::Bf16 => "bf16",
            ElementType::I64 => "i64",
            ElementType::I32 => "i32",
            ElementType::I8 => "i8",
            ElementType::U8 => "u8",
            ElementType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}
