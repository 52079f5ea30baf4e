use ndarray::prelude::*;

use crate::argmax::ArgmaxMap;
use crate::config::{FrameSize, RoiPoolConfig};
use crate::error::{Result, RoiPoolError};
use crate::pool;

/// ROI max pooling layer.
///
/// Holds the fixed configuration and the argmax map of the most recent
/// forward pass, which the matching backward pass consumes. The layer has no
/// learnable parameters, and the regions input gets no gradient.
#[derive(Debug)]
pub struct RoiPoolLayer {
    config: RoiPoolConfig,
    argmax: Option<ArgmaxMap>,
}

impl RoiPoolLayer {
    pub fn new(config: RoiPoolConfig) -> Self {
        RoiPoolLayer {
            config,
            argmax: None,
        }
    }

    pub fn config(&self) -> &RoiPoolConfig {
        &self.config
    }

    /// Argmax map retained from the last successful forward pass.
    pub fn argmax(&self) -> Option<&ArgmaxMap> {
        self.argmax.as_ref()
    }

    /// For input of shape `(batch_size, channels, height, width)` and
    /// `num_rois` regions, compute the output shape.
    pub fn output_shape(&self, input_shape: Ix4, num_rois: usize) -> Ix4 {
        Ix4(
            num_rois,
            input_shape[1],
            self.config.pooled_height(),
            self.config.pooled_width(),
        )
    }

    /// Pool `x` over each row of `rois`.
    ///
    /// On success the previous argmax map is replaced. On failure it is
    /// dropped, so a stale map can't be paired with a later backward call.
    pub fn forward(&mut self, x: ArrayView4<'_, f32>, rois: ArrayView2<'_, f32>) -> Result<Array4<f32>> {
        self.argmax = None;
        let (y, argmax) = pool::forward(&self.config, x, rois)?;
        self.argmax = Some(argmax);
        Ok(y)
    }

    /// Add the gradient of the loss with respect to the input into `dx`,
    /// given `dz`, the gradient with respect to the last forward's output.
    pub fn backward(&self, dz: ArrayView4<'_, f32>, dx: ArrayViewMut4<'_, f32>) -> Result<()> {
        let argmax = self.argmax.as_ref().ok_or(RoiPoolError::NoForwardPass)?;
        pool::backward(argmax, dz, dx)
    }

    /// Forward pass on flattened rows, the layout host frameworks hand over.
    ///
    /// Each row of `x` is one sample, `channels * height * width` values wide;
    /// `frame` says how to split it (falling back on the configured default
    /// frame). The result has one row per region, `channels * pooled_height *
    /// pooled_width` wide.
    pub fn forward_rows(
        &mut self,
        x: ArrayView2<'_, f32>,
        frame: FrameSize,
        rois: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        let geometry = self.config.resolve_frame(x.ncols(), frame)?;
        let x = as_frames(x, geometry.dim(x.nrows()), "input rows")?;
        let y = self.forward(x, rois)?;
        let num_rois = y.len_of(Axis(0));
        Ok(y.into_shape((num_rois, geometry.channels * self.config.cells_per_channel()))
            .expect("freshly allocated output is contiguous"))
    }

    /// Backward pass on flattened rows; the row counterpart of [`backward`].
    ///
    /// `dz` has one row per region and `dx` one row per sample, laid out as
    /// in the matching [`forward_rows`] call.
    ///
    /// [`backward`]: RoiPoolLayer::backward
    /// [`forward_rows`]: RoiPoolLayer::forward_rows
    pub fn backward_rows(&self, dz: ArrayView2<'_, f32>, dx: ArrayViewMut2<'_, f32>) -> Result<()> {
        let argmax = self.argmax.as_ref().ok_or(RoiPoolError::NoForwardPass)?;
        let out_dim = argmax.dim();
        let in_dim = argmax.input_dim();
        let dz = as_frames(dz, out_dim, "output gradient rows")?;
        let dx_rows = [in_dim[0], in_dim[1] * in_dim[2] * in_dim[3]];
        if dx.shape() != dx_rows {
            return Err(RoiPoolError::shape("input gradient rows", &dx_rows, dx.shape()));
        }
        let dx = dx
            .into_shape(in_dim)
            .map_err(|_| RoiPoolError::NotContiguous {
                what: "input gradient rows",
            })?;
        pool::backward(argmax, dz, dx)
    }
}

/// View rows of `dim[1] * dim[2] * dim[3]` values as a 4-D array of shape `dim`.
fn as_frames<'a>(rows: ArrayView2<'a, f32>, dim: Ix4, what: &'static str) -> Result<ArrayView4<'a, f32>> {
    let expected = [dim[0], dim[1] * dim[2] * dim[3]];
    if rows.shape() != expected {
        return Err(RoiPoolError::shape(what, &expected, rows.shape()));
    }
    rows.into_shape(dim)
        .map_err(|_| RoiPoolError::NotContiguous { what })
}
