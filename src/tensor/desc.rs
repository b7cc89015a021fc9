//! Tensor descriptors carried on graph edges

use std::fmt;

use super::dtype::ElementType;
use super::shape::PartialShape;

/// Element type and shape of one edge
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    /// Element type
    pub element_type: ElementType,
    /// Shape (may contain dynamic dimensions)
    pub shape: PartialShape,
}

impl TensorDesc {
    /// Create a descriptor
    pub fn new(element_type: ElementType, shape: PartialShape) -> Self {
        Self {
            element_type,
            shape,
        }
    }

    /// f32 descriptor of the given shape
    pub fn f32(shape: PartialShape) -> Self {
        Self::new(ElementType::F32, shape)
    }

    /// Rank of the shape
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Check if any dimension is dynamic
    pub fn is_dynamic(&self) -> bool {
        self.shape.is_dynamic()
    }

    /// Same element type with a different shape
    pub fn with_shape(&self, shape: PartialShape) -> Self {
        Self::new(self.element_type, shape)
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.element_type, self.shape)
    }
}
