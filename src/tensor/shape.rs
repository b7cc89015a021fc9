//! Shape utilities for graph tensors
//!
//! Shapes have a known rank; each dimension is either static or dynamic.

use std::fmt;

use smallvec::SmallVec;

use crate::error::{TokenizeError, TokenizeResult};

/// A single tensor dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Known extent
    Static(usize),
    /// Unknown until runtime
    Dynamic,
}

impl Dim {
    /// Static extent, if known
    pub fn get(self) -> Option<usize> {
        match self {
            Dim::Static(v) => Some(v),
            Dim::Dynamic => None,
        }
    }

    /// Check if the dimension is dynamic
    pub fn is_dynamic(self) -> bool {
        matches!(self, Dim::Dynamic)
    }

    /// Check if the dimension is statically one
    pub fn is_one(self) -> bool {
        self == Dim::Static(1)
    }

    /// Check if two dimensions may describe the same extent
    pub fn compatible(self, other: Dim) -> bool {
        match (self, other) {
            (Dim::Static(a), Dim::Static(b)) => a == b,
            _ => true,
        }
    }

    /// Merge two compatible dimensions, preferring the static one
    pub fn merge(self, other: Dim) -> Option<Dim> {
        match (self, other) {
            (Dim::Static(a), Dim::Static(b)) if a == b => Some(Dim::Static(a)),
            (Dim::Static(_), Dim::Static(_)) => None,
            (Dim::Dynamic, d) | (d, Dim::Dynamic) => Some(d),
        }
    }

    /// Numpy-style broadcast of two dimensions
    pub fn broadcast(self, other: Dim) -> Option<Dim> {
        match (self, other) {
            (Dim::Static(1), d) | (d, Dim::Static(1)) => Some(d),
            (Dim::Static(a), Dim::Static(b)) if a == b => Some(Dim::Static(a)),
            (Dim::Static(_), Dim::Static(_)) => None,
            (Dim::Dynamic, d) | (d, Dim::Dynamic) => Some(d),
        }
    }
}

impl From<usize> for Dim {
    fn from(value: usize) -> Self {
        Dim::Static(value)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(v) => write!(f, "{}", v),
            Dim::Dynamic => f.write_str("?"),
        }
    }
}

/// Shape with known rank and possibly dynamic dimensions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PartialShape {
    dims: SmallVec<[Dim; 6]>,
}

impl PartialShape {
    /// Create a shape from dimensions
    pub fn new(dims: impl IntoIterator<Item = Dim>) -> Self {
        Self {
            dims: dims.into_iter().collect(),
        }
    }

    /// Create a fully static shape
    pub fn from_static(dims: &[usize]) -> Self {
        Self::new(dims.iter().map(|&d| Dim::Static(d)))
    }

    /// Create a shape where negative values mark dynamic dimensions
    pub fn from_i64(dims: &[i64]) -> Self {
        Self::new(dims.iter().map(|&d| {
            if d < 0 {
                Dim::Dynamic
            } else {
                Dim::Static(d as usize)
            }
        }))
    }

    /// Create a fully dynamic shape of the given rank
    pub fn dynamic(rank: usize) -> Self {
        Self::new(std::iter::repeat(Dim::Dynamic).take(rank))
    }

    /// Scalar (rank 0) shape
    pub fn scalar() -> Self {
        Self::default()
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Dimensions as a slice
    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    /// Dimension at `axis`
    pub fn dim(&self, axis: usize) -> Dim {
        self.dims[axis]
    }

    /// Check if every dimension is static
    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|d| !d.is_dynamic())
    }

    /// Check if any dimension is dynamic
    pub fn is_dynamic(&self) -> bool {
        !self.is_static()
    }

    /// Static extents, if every dimension is known
    pub fn to_static(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(|d| d.get()).collect()
    }

    /// Dimensions as `i64`, dynamic dimensions as `-1`
    pub fn to_i64(&self) -> Vec<i64> {
        self.dims
            .iter()
            .map(|d| d.get().map(|v| v as i64).unwrap_or(-1))
            .collect()
    }

    /// Element count, if static
    pub fn numel(&self) -> Option<usize> {
        self.to_static().map(|dims| numel(&dims))
    }

    /// Check if the shape holds exactly one element (any rank)
    pub fn is_scalar_like(&self) -> bool {
        self.dims.iter().all(|d| d.is_one())
    }

    /// Shape with an axis inserted
    pub fn with_inserted(&self, axis: usize, dim: Dim) -> Self {
        let mut dims = self.dims.clone();
        dims.insert(axis, dim);
        Self { dims }
    }

    /// Shape with one axis replaced by two
    pub fn with_split(&self, axis: usize, outer: usize, inner: usize) -> Self {
        let mut dims = self.dims.clone();
        dims[axis] = Dim::Static(outer);
        dims.insert(axis + 1, Dim::Static(inner));
        Self { dims }
    }

    /// Shape permuted by `order`
    pub fn permuted(&self, order: &[usize]) -> TokenizeResult<Self> {
        if !is_permutation(order, self.rank()) {
            return Err(TokenizeError::ShapeInferenceFailed(format!(
                "Order {:?} is not a permutation of rank {}",
                order,
                self.rank()
            )));
        }
        Ok(Self::new(order.iter().map(|&axis| self.dims[axis])))
    }

    /// Shape padded with leading ones up to `rank`
    pub fn aligned_to(&self, rank: usize) -> Self {
        let pad = rank.saturating_sub(self.rank());
        Self::new(
            std::iter::repeat(Dim::Static(1))
                .take(pad)
                .chain(self.dims.iter().copied()),
        )
    }
}

impl From<&[usize]> for PartialShape {
    fn from(dims: &[usize]) -> Self {
        Self::from_static(dims)
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", d)?;
        }
        f.write_str("]")
    }
}

/// Calculate total number of elements from static extents
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Compute the numpy broadcast of two shapes
pub fn broadcast_shape(a: &PartialShape, b: &PartialShape) -> TokenizeResult<PartialShape> {
    let rank = a.rank().max(b.rank());
    let a = a.aligned_to(rank);
    let b = b.aligned_to(rank);

    a.dims()
        .iter()
        .zip(b.dims())
        .map(|(&da, &db)| {
            da.broadcast(db).ok_or_else(|| {
                TokenizeError::ShapeInferenceFailed(format!(
                    "Shapes {} and {} are not broadcastable",
                    a, b
                ))
            })
        })
        .collect::<TokenizeResult<Vec<_>>>()
        .map(PartialShape::new)
}

/// Normalize axis to positive index
pub fn normalize_axis(axis: i64, rank: usize) -> TokenizeResult<usize> {
    let rank_i64 = rank as i64;
    let normalized = if axis < 0 { axis + rank_i64 } else { axis };

    if normalized < 0 || normalized >= rank_i64 {
        return Err(TokenizeError::InvalidNode(format!(
            "Axis {} out of bounds for rank {}",
            axis, rank
        )));
    }

    Ok(normalized as usize)
}

/// Check if `order` is a permutation of `0..rank`
pub fn is_permutation(order: &[usize], rank: usize) -> bool {
    if order.len() != rank {
        return false;
    }
    let mut seen = vec![false; rank];
    for &axis in order {
        if axis >= rank || seen[axis] {
            return false;
        }
        seen[axis] = true;
    }
    true
}

/// Check if `order` leaves every axis in place
pub fn is_identity_order(order: &[usize]) -> bool {
    order.iter().enumerate().all(|(i, &axis)| i == axis)
}

/// Order that applies `first` and then `second`
pub fn compose_orders(first: &[usize], second: &[usize]) -> Vec<usize> {
    second.iter().map(|&axis| first[axis]).collect()
}

/// Inverse of a permutation
pub fn inverse_order(order: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; order.len()];
    for (i, &axis) in order.iter().enumerate() {
        inv[axis] = i;
    }
    inv
}

/// Check if `value` is prime
pub fn is_prime(value: usize) -> bool {
    if value < 2 {
        return false;
    }
    let mut divisor = 2;
    while divisor * divisor <= value {
        if value % divisor == 0 {
            return false;
        }
        divisor += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numel() {
        assert_eq!(numel(&[2, 3, 4]), 24);
        assert_eq!(numel(&[]), 1); // scalar
    }

    #[test]
    fn test_dim_broadcast() {
        assert_eq!(Dim::Static(1).broadcast(Dim::Static(8)), Some(Dim::Static(8)));
        assert_eq!(Dim::Dynamic.broadcast(Dim::Static(8)), Some(Dim::Static(8)));
        assert_eq!(Dim::Dynamic.broadcast(Dim::Static(1)), Some(Dim::Dynamic));
        assert_eq!(Dim::Static(3).broadcast(Dim::Static(8)), None);
    }

    #[test]
    fn test_broadcast_shape() {
        let a = PartialShape::from_static(&[1, 12, 128, 128]);
        let b = PartialShape::from_static(&[128]);
        assert_eq!(broadcast_shape(&a, &b).unwrap(), a);

        let c = PartialShape::from_i64(&[-1, 1, 64]);
        let d = PartialShape::from_static(&[4, 1]);
        assert_eq!(
            broadcast_shape(&c, &d).unwrap(),
            PartialShape::from_i64(&[-1, 4, 64])
        );

        let e = PartialShape::from_static(&[3, 4]);
        let f = PartialShape::from_static(&[5]);
        assert!(broadcast_shape(&e, &f).is_err());
    }

    #[test]
    fn test_static_queries() {
        let shape = PartialShape::from_i64(&[1, -1, 12, 64]);
        assert!(shape.is_dynamic());
        assert_eq!(shape.to_static(), None);
        assert_eq!(shape.dim(3), Dim::Static(64));
        assert_eq!(shape.to_string(), "[1,?,12,64]");

        let shape = PartialShape::from_static(&[2, 3]);
        assert_eq!(shape.numel(), Some(6));
    }

    #[test]
    fn test_split_and_insert() {
        let shape = PartialShape::from_static(&[12, 128, 64]);
        assert_eq!(
            shape.with_split(1, 2, 64),
            PartialShape::from_static(&[12, 2, 64, 64])
        );
        assert_eq!(
            shape.with_inserted(1, Dim::Static(1)),
            PartialShape::from_static(&[12, 1, 128, 64])
        );
    }

    #[test]
    fn test_normalize_axis() {
        assert_eq!(normalize_axis(-1, 4).unwrap(), 3);
        assert!(normalize_axis(4, 4).is_err());
        assert!(normalize_axis(-5, 4).is_err());
    }

    #[test]
    fn test_orders() {
        assert!(is_permutation(&[0, 2, 1, 3], 4));
        assert!(!is_permutation(&[0, 2, 2, 3], 4));
        assert_eq!(compose_orders(&[0, 2, 1, 3], &[0, 1, 3, 2]), vec![0, 2, 3, 1]);
        assert_eq!(inverse_order(&[0, 2, 3, 1]), vec![0, 3, 1, 2]);
        assert!(is_identity_order(&[0, 1, 2]));
    }

    #[test]
    fn test_is_prime() {
        assert!(is_prime(2));
        assert!(is_prime(97));
        assert!(!is_prime(1));
        assert!(!is_prime(384));
    }
}
