// rust/reshard-core/src/shard/unflatten.rs

//! Index arithmetic for mapping flat runs back onto N-D boxes.

use super::descriptor::FlatRange;
use crate::error::{ReshardError, Result};
use crate::tensor::{numel, strides};

/// Row-major flat position of `index` within `shape`.
pub fn ravel_index(index: &[u64], shape: &[u64]) -> u64 {
    index
        .iter()
        .zip(strides(shape))
        .map(|(i, stride)| i * stride)
        .sum()
}

/// Inverse of [`ravel_index`].
pub fn unravel_index(mut flat: u64, shape: &[u64]) -> Vec<u64> {
    let mut index = vec![0u64; shape.len()];
    for d in (0..shape.len()).rev() {
        index[d] = flat % shape[d];
        flat /= shape[d];
    }
    index
}

/// Smallest N-D box containing a flat run, and where the run sits inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimalSlice {
    /// Start of the box inside the enclosing shape.
    pub start: Vec<u64>,
    pub shape: Vec<u64>,
    /// The run, relative to the box's own row-major order.
    pub flat_range: FlatRange,
}

impl MinimalSlice {
    /// True when the run fills the box exactly.
    pub fn is_exact(&self) -> bool {
        self.flat_range.start == 0 && self.flat_range.end == numel(&self.shape)
    }
}

/// Finds the minimal box of `shape` that contains the run `range`.
///
/// Axes are fixed while the start and end coordinates agree; the first axis
/// where they differ spans `[start, end]`, and every later axis is taken
/// whole. The box is therefore contiguous in the enclosing row-major order.
pub fn minimal_nd_slice(shape: &[u64], range: FlatRange) -> Result<MinimalSlice> {
    if range.is_empty() || range.end > numel(shape) {
        return Err(ReshardError::tensor(format!(
            "flat run [{}, {}) is empty or exceeds shape {shape:?}",
            range.start, range.end
        )));
    }

    let first = unravel_index(range.start, shape);
    let last = unravel_index(range.end - 1, shape);

    let mut start = Vec::with_capacity(shape.len());
    let mut box_shape = Vec::with_capacity(shape.len());
    let mut prefix_equal = true;
    for d in 0..shape.len() {
        if prefix_equal {
            start.push(first[d]);
            box_shape.push(last[d] - first[d] + 1);
            prefix_equal = first[d] == last[d];
        } else {
            start.push(0);
            box_shape.push(shape[d]);
        }
    }

    let base = ravel_index(&start, shape);
    Ok(MinimalSlice {
        start,
        shape: box_shape,
        flat_range: FlatRange::new(range.start - base, range.end - base),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ravel_unravel_inverse() {
        let shape = [3, 4, 5];
        for flat in 0..60 {
            assert_eq!(ravel_index(&unravel_index(flat, &shape), &shape), flat);
        }
    }

    #[test]
    fn test_run_inside_one_row() {
        let slice = minimal_nd_slice(&[4, 8], FlatRange::new(10, 14)).unwrap();
        assert_eq!(slice.start, vec![1, 2]);
        assert_eq!(slice.shape, vec![1, 4]);
        assert_eq!(slice.flat_range, FlatRange::new(0, 4));
        assert!(slice.is_exact());
    }

    #[test]
    fn test_run_across_rows() {
        // (0,1,2) .. (0,2,1) in a [2,3,4] tensor
        let slice = minimal_nd_slice(&[2, 3, 4], FlatRange::new(6, 10)).unwrap();
        assert_eq!(slice.start, vec![0, 1, 0]);
        assert_eq!(slice.shape, vec![1, 2, 4]);
        assert_eq!(slice.flat_range, FlatRange::new(2, 6));
        assert!(!slice.is_exact());
    }

    #[test]
    fn test_run_across_outer_axis_takes_inner_axes_whole() {
        // (0,1,1) .. (1,1,2): the box must include (0,2,0)
        let start = ravel_index(&[0, 1, 1], &[2, 3, 4]);
        let end = ravel_index(&[1, 1, 2], &[2, 3, 4]) + 1;
        let slice = minimal_nd_slice(&[2, 3, 4], FlatRange::new(start, end)).unwrap();

        assert_eq!(slice.start, vec![0, 0, 0]);
        assert_eq!(slice.shape, vec![2, 3, 4]);
        assert_eq!(slice.flat_range, FlatRange::new(start, end));
    }

    #[test]
    fn test_whole_rows_are_exact() {
        let slice = minimal_nd_slice(&[4, 8], FlatRange::new(8, 24)).unwrap();
        assert_eq!(slice.start, vec![1, 0]);
        assert_eq!(slice.shape, vec![2, 8]);
        assert!(slice.is_exact());
    }

    #[test]
    fn test_invalid_runs() {
        assert!(minimal_nd_slice(&[4], FlatRange::new(2, 2)).is_err());
        assert!(minimal_nd_slice(&[4], FlatRange::new(2, 5)).is_err());
    }
}
