//! Variable shapes.

use std::fmt;

/// Dimensions of a variable or host tensor. Always at least rank one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Panics on an empty dimension list; use [`Shape::try_new`] for user input.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "shape must have at least one dimension");
        Shape { dims }
    }

    /// `None` for empty shapes, zero-sized axes or an element count that overflows `usize`.
    pub fn try_new<D: Into<Vec<usize>>>(dims: D) -> Option<Self> {
        let dims = dims.into();
        if dims.is_empty() || dims.iter().any(|&d| d == 0) {
            return None;
        }
        checked_product(&dims)?;
        Some(Shape { dims })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Payload size for elements of `elem_size` bytes, `None` on overflow.
    pub fn checked_byte_len(&self, elem_size: usize) -> Option<usize> {
        checked_product(&self.dims)?.checked_mul(elem_size)
    }
}

fn checked_product(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}
