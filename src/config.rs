//! Layer configuration and input frame geometry.

use ndarray::Ix4;

use crate::error::{Result, RoiPoolError};

/// Fixed configuration of a ROI pooling layer.
///
/// Invariants: `pooled_height > 0`, `pooled_width > 0`, and `spatial_scale`
/// is finite and positive. They are checked once at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiPoolConfig {
    pooled_height: usize,
    pooled_width: usize,
    spatial_scale: f32,
    /// Frame size used when the host doesn't declare one.
    default_frame: FrameSize,
}

impl RoiPoolConfig {
    /// Create a config producing `pooled_height x pooled_width` cells per
    /// channel per region.
    ///
    /// `spatial_scale` converts region coordinates (image space) into feature
    /// map coordinates. A backbone with a total stride of 16 uses `1.0 / 16.0`.
    pub fn new(pooled_height: usize, pooled_width: usize, spatial_scale: f32) -> Result<Self> {
        if pooled_height == 0 || pooled_width == 0 {
            return Err(RoiPoolError::InvalidConfig(format!(
                "pooled size must be positive, got {pooled_height}x{pooled_width}"
            )));
        }
        if !(spatial_scale.is_finite() && spatial_scale > 0.0) {
            return Err(RoiPoolError::InvalidConfig(format!(
                "spatial scale must be positive and finite, got {spatial_scale}"
            )));
        }
        Ok(RoiPoolConfig {
            pooled_height,
            pooled_width,
            spatial_scale,
            default_frame: FrameSize::default(),
        })
    }

    pub fn square(size: usize, spatial_scale: f32) -> Result<Self> {
        Self::new(size, size, spatial_scale)
    }

    /// Set the frame height and width to fall back on when the input rows
    /// come without a declared frame size.
    pub fn with_default_frame(mut self, height: usize, width: usize) -> Self {
        self.default_frame = FrameSize::new(height, width);
        self
    }

    pub fn pooled_height(&self) -> usize {
        self.pooled_height
    }

    pub fn pooled_width(&self) -> usize {
        self.pooled_width
    }

    pub fn spatial_scale(&self) -> f32 {
        self.spatial_scale
    }

    /// Number of output cells per channel.
    pub fn cells_per_channel(&self) -> usize {
        self.pooled_height * self.pooled_width
    }

    /// Work out the `(channels, height, width)` layout of flattened input rows
    /// that are `row_width` values wide.
    ///
    /// Each declared dimension wins over the configured default; a dimension
    /// that is zero in both places is an error, as is a row that isn't a whole
    /// number of `height x width` planes.
    pub fn resolve_frame(&self, row_width: usize, declared: FrameSize) -> Result<FrameGeometry> {
        let height = declared.height.or(self.default_frame.height).unwrap_or(0);
        let width = declared.width.or(self.default_frame.width).unwrap_or(0);
        let mismatch = || RoiPoolError::ShapeMismatch {
            what: "input row width (channels * height * width)",
            expected: vec![height, width],
            actual: vec![row_width],
        };
        let plane = height.checked_mul(width).ok_or_else(mismatch)?;
        if plane == 0 || row_width % plane != 0 {
            return Err(mismatch());
        }
        Ok(FrameGeometry {
            channels: row_width / plane,
            height,
            width,
        })
    }
}

/// Spatial size of each input sample, as declared by the host.
///
/// A dimension that is `None` (or zero, through [`FrameSize::new`]) is
/// undeclared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSize {
    pub height: Option<usize>,
    pub width: Option<usize>,
}

impl FrameSize {
    pub fn new(height: usize, width: usize) -> Self {
        FrameSize {
            height: Some(height).filter(|&h| h > 0),
            width: Some(width).filter(|&w| w > 0),
        }
    }

    pub fn undeclared() -> Self {
        FrameSize::default()
    }
}

/// Resolved per-sample layout of the input feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl FrameGeometry {
    /// Full 4-D shape `(batch_size, channels, height, width)`.
    pub fn dim(&self, batch_size: usize) -> Ix4 {
        Ix4(batch_size, self.channels, self.height, self.width)
    }
}
