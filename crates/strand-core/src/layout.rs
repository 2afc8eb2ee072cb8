use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — shape + strides + offset
//
// The layout maps a tensor's logical indices to positions in flat storage.
// Permute and narrow only rewrite the layout, so they never copy data.
// Broadcasting is expressed the same way: a broadcast dimension gets stride 0,
// so every logical index along it reads the same element.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Where this tensor's first element lives in the storage buffer.
    offset: usize,
}

impl Layout {
    /// A row-major layout starting at offset 0.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major with no gaps and no offset.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Reorder dimensions: output dim `i` is input dim `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if perm.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: perm.len(),
            });
        }
        let mut seen = vec![false; rank];
        for &p in perm {
            if p >= rank || seen[p] {
                return Err(Error::msg(format!(
                    "permute: {:?} is not a permutation of 0..{}",
                    perm, rank
                )));
            }
            seen[p] = true;
        }
        let dims = perm.iter().map(|&p| self.dims()[p]).collect();
        let strides = perm.iter().map(|&p| self.strides[p]).collect();
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// View of `len` entries of dimension `dim`, starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank,
            });
        }
        let dim_size = self.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        Ok(Layout::new(
            self.shape.with_dim(dim, len),
            self.strides.clone(),
            self.offset + start * self.strides[dim],
        ))
    }

    /// View of this layout broadcast to `target` (leading dims and size-1 dims
    /// get stride 0). Fails if the shapes are not broadcast-compatible.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        let src = self.dims();
        let dst = target.dims();
        if src.len() > dst.len() {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: self.shape.clone(),
            });
        }
        let lead = dst.len() - src.len();
        let mut strides = vec![0usize; dst.len()];
        for (i, &d) in src.iter().enumerate() {
            if d == dst[i + lead] {
                strides[i + lead] = self.strides[i];
            } else if d != 1 {
                return Err(Error::ShapeMismatch {
                    expected: target.clone(),
                    got: self.shape.clone(),
                });
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Storage position of a multi-dimensional index.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        self.offset
            + index
                .iter()
                .zip(self.strides.iter())
                .map(|(i, s)| i * s)
                .sum::<usize>()
    }

    /// Iterator over storage positions of every element, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Yields the storage index of each element of a [`Layout`] in row-major
/// logical order, following strides (so transposed and sliced views work).
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    next_flat: usize,
    remaining: usize,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            next_flat: layout.offset(),
            remaining: layout.elem_count(),
        }
    }

    // Bump the rightmost index, carrying leftwards, and keep the flat
    // position in step without recomputing the full dot product.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            self.next_flat += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.next_flat -= self.strides[i] * self.dims[i];
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let flat = self.next_flat;
        self.remaining -= 1;
        if self.remaining > 0 {
            self.advance();
        }
        Some(flat)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_indices() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_permuted_indices() {
        // [2, 3] read column-major.
        let layout = Layout::contiguous(Shape::from((2, 3)))
            .permute(&[1, 0])
            .unwrap();
        assert_eq!(layout.dims(), &[3, 2]);
        assert!(!layout.is_contiguous());
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_narrow_offset() {
        let layout = Layout::contiguous(Shape::from((4, 6)))
            .narrow(1, 2, 3)
            .unwrap();
        assert_eq!(layout.dims(), &[4, 3]);
        assert_eq!(layout.offset(), 2);
        let first_row: Vec<usize> = layout.strided_indices().take(3).collect();
        assert_eq!(first_row, vec![2, 3, 4]);
        assert!(Layout::contiguous(Shape::from((4, 6)))
            .narrow(1, 5, 2)
            .is_err());
    }

    #[test]
    fn test_broadcast_strides() {
        let layout = Layout::contiguous(Shape::from((1, 3)))
            .broadcast_as(&Shape::from((2, 2, 3)))
            .unwrap();
        assert_eq!(layout.strides(), &[0, 0, 1]);
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_bad_permutation() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.permute(&[0, 0]).is_err());
        assert!(layout.permute(&[0]).is_err());
    }
}
