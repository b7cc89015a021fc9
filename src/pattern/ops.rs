//! Operation categories and transpose support tables
//!
//! Classifies op kinds for the matcher and answers which transpose orders a
//! fused attention body can execute for each operand position.

use crate::config::TokenizationConfig;
use crate::graph::Op;
use crate::traits::OpCapabilities;

/// Head swap at rank 4: `[B, S, H, D] -> [B, H, S, D]`
pub const HEAD_SWAP_4D: &[usize] = &[0, 2, 1, 3];

/// Head swap at rank 3: `[S, H, D] -> [H, S, D]`
pub const HEAD_SWAP_3D: &[usize] = &[1, 0, 2];

/// Key layout at rank 4: `[B, S, H, D] -> [B, H, D, S]`
pub const KEY_DECOMPOSED_4D: &[usize] = &[0, 2, 3, 1];

/// Key layout at rank 3: `[S, H, D] -> [H, D, S]`
pub const KEY_DECOMPOSED_3D: &[usize] = &[1, 2, 0];

/// Op categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCategory {
    /// Graph inputs and constants
    Source,
    /// Graph outputs
    Sink,
    /// Matrix multiplication
    MatMul,
    /// Binary element-wise operations
    Binary,
    /// Unary element-wise operations
    Unary,
    /// Conditional selection
    Select,
    /// Reduction operations
    Reduction,
    /// Quantization and type conversion
    Quantization,
    /// Shape manipulation
    Shape,
    /// Already fused
    Fused,
}

/// Categorize an operation
pub fn categorize_op(op: &Op) -> OpCategory {
    match op {
        Op::Parameter | Op::Constant(_) => OpCategory::Source,
        Op::Result => OpCategory::Sink,
        Op::MatMul { .. } => OpCategory::MatMul,
        Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::Maximum | Op::Minimum => {
            OpCategory::Binary
        }
        Op::Relu | Op::Exp | Op::Negative => OpCategory::Unary,
        Op::Select => OpCategory::Select,
        Op::Softmax { .. } => OpCategory::Reduction,
        Op::Convert { .. } | Op::Quantize { .. } | Op::Dequantize { .. } => {
            OpCategory::Quantization
        }
        Op::Transpose { .. } | Op::Reshape { .. } => OpCategory::Shape,
        Op::Subgraph(_) => OpCategory::Fused,
    }
}

/// Check if an op is a binary element-wise operation
pub fn is_binary_op(op: &Op) -> bool {
    categorize_op(op) == OpCategory::Binary
}

impl OpCapabilities for Op {
    fn is_elementwise(&self) -> bool {
        matches!(
            categorize_op(self),
            OpCategory::Binary | OpCategory::Unary | OpCategory::Select | OpCategory::Quantization
        )
    }

    fn is_layout_invariant(&self) -> bool {
        self.is_elementwise()
    }

    fn is_quantization(&self) -> bool {
        matches!(self, Op::Quantize { .. } | Op::Dequantize { .. })
    }
}

/// Position of a transposed operand relative to the attention MatMuls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransposeRole {
    /// First input of the first MatMul
    Query,
    /// Second input of the first MatMul
    Key,
    /// Second input of the second MatMul
    Value,
    /// Output of the second MatMul
    Output,
}

/// Order that swaps the last two axes
pub fn last_two_swap(rank: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..rank).collect();
    if rank >= 2 {
        order.swap(rank - 1, rank - 2);
    }
    order
}

/// Check if `order` only swaps the last two axes
pub fn is_last_two_swap(order: &[usize]) -> bool {
    order.len() >= 2 && order == last_two_swap(order.len()).as_slice()
}

/// Head swap order for `rank`, if the rank has one
pub fn head_swap(rank: usize) -> Option<&'static [usize]> {
    match rank {
        3 => Some(HEAD_SWAP_3D),
        4 => Some(HEAD_SWAP_4D),
        _ => None,
    }
}

/// Check if a fused body can execute a Transpose with `order` at `role`
pub fn is_supported_transpose(order: &[usize], role: TransposeRole, config: &TokenizationConfig) -> bool {
    let rank = order.len();
    if !config.is_transpose_rank_supported(rank) {
        return false;
    }
    let is_head_swap = head_swap(rank).map(|o| o == order).unwrap_or(false);
    match role {
        TransposeRole::Query | TransposeRole::Value => is_head_swap,
        TransposeRole::Output => is_head_swap && config.enable_transpose_on_output,
        TransposeRole::Key => {
            let decomposed = match rank {
                3 => order == KEY_DECOMPOSED_3D,
                4 => order == KEY_DECOMPOSED_4D,
                _ => false,
            };
            decomposed || is_last_two_swap(order)
        }
    }
}
