//! The record linking a forward pass to its backward pass.

use ndarray::prelude::*;

/// For every pooled output cell, which input element produced the max.
///
/// Indices are flat positions `h * width + w` within one channel plane of the
/// sample the region refers to. `None` marks an empty bin, which routes no
/// gradient. Index 0 is an ordinary valid position.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgmaxMap {
    /// Shape `(num_rois, channels, pooled_height, pooled_width)`.
    indices: Array4<Option<usize>>,
    /// Sample referenced by each region.
    batch_indices: Vec<usize>,
    /// Shape of the feature map the forward pass read.
    input_dim: Ix4,
}

impl ArgmaxMap {
    pub(crate) fn new(indices: Array4<Option<usize>>, batch_indices: Vec<usize>, input_dim: Ix4) -> Self {
        assert_eq!(indices.len_of(Axis(0)), batch_indices.len());
        assert_eq!(indices.len_of(Axis(1)), input_dim[1]);
        ArgmaxMap {
            indices,
            batch_indices,
            input_dim,
        }
    }

    /// Shape of the pooled output this map describes.
    pub fn dim(&self) -> Ix4 {
        self.indices.raw_dim()
    }

    pub fn num_rois(&self) -> usize {
        self.batch_indices.len()
    }

    /// Shape `(batch_size, channels, height, width)` of the forward input, and
    /// so of the gradient buffer the backward pass writes.
    pub fn input_dim(&self) -> Ix4 {
        self.input_dim
    }

    pub fn batch_index(&self, roi: usize) -> usize {
        self.batch_indices[roi]
    }

    pub fn batch_indices(&self) -> &[usize] {
        &self.batch_indices
    }

    pub fn get(&self, roi: usize, channel: usize, ph: usize, pw: usize) -> Option<usize> {
        self.indices[[roi, channel, ph, pw]]
    }

    pub fn indices(&self) -> ArrayView4<'_, Option<usize>> {
        self.indices.view()
    }

    /// Convert a flat index back to `(h, w)` within a channel plane.
    pub fn position(&self, index: usize) -> (usize, usize) {
        let width = self.input_dim[3];
        (index / width, index % width)
    }

    /// Number of output cells whose bin was empty.
    pub fn num_empty(&self) -> usize {
        self.indices.iter().filter(|i| i.is_none()).count()
    }
}
