//! Regions of interest and the adaptive bins they are divided into.

use std::ops::Range;

use ndarray::prelude::*;

use crate::config::RoiPoolConfig;
use crate::error::{Result, RoiPoolError};

/// Number of values describing one region: `{batch_index, x1, y1, x2, y2}`.
pub const REGION_WIDTH: usize = 5;

/// One row of the regions tensor, in image coordinates (not yet scaled).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub batch_index: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Region {
    /// Read a region from the first five values of `row`.
    ///
    /// *Panics* if `row` is shorter than [`REGION_WIDTH`]; callers check the
    /// width of the whole regions tensor up front.
    pub fn from_row(row: ArrayView1<'_, f32>) -> Self {
        assert!(row.len() >= REGION_WIDTH, "region rows have 5 values");
        Region {
            batch_index: row[0],
            x1: row[1],
            y1: row[2],
            x2: row[3],
            y2: row[4],
        }
    }

    /// The sample this region refers to, checked against `batch_size`.
    ///
    /// Fractional indices truncate toward zero. `roi` is only used to report
    /// which region was bad.
    pub fn batch_index(&self, roi: usize, batch_size: usize) -> Result<usize> {
        let b = self.batch_index;
        if b.is_finite() && b >= 0.0 && b < batch_size as f32 && (b as usize) < batch_size {
            Ok(b as usize)
        } else {
            Err(RoiPoolError::BatchIndexOutOfRange {
                roi,
                batch_index: b,
                batch_size,
            })
        }
    }
}

/// A region mapped into feature-map coordinates and split into bins.
///
/// Coordinates are kept signed so that regions hanging off the top or left of
/// the map clamp to zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiGeometry {
    start_h: i64,
    start_w: i64,
    bin_h: f32,
    bin_w: f32,
    pooled_height: usize,
    pooled_width: usize,
}

fn scaled(coord: f32, spatial_scale: f32) -> i64 {
    // `as` saturates, and maps NaN to 0.
    (coord * spatial_scale).round() as i64
}

impl RoiGeometry {
    pub fn new(region: &Region, config: &RoiPoolConfig) -> Self {
        let scale = config.spatial_scale();
        let start_w = scaled(region.x1, scale);
        let start_h = scaled(region.y1, scale);
        let end_w = scaled(region.x2, scale);
        let end_h = scaled(region.y2, scale);

        // Malformed regions (end before start) still get one row and column.
        let roi_height = end_h.saturating_sub(start_h).saturating_add(1).max(1);
        let roi_width = end_w.saturating_sub(start_w).saturating_add(1).max(1);

        RoiGeometry {
            start_h,
            start_w,
            bin_h: roi_height as f32 / config.pooled_height() as f32,
            bin_w: roi_width as f32 / config.pooled_width() as f32,
            pooled_height: config.pooled_height(),
            pooled_width: config.pooled_width(),
        }
    }

    /// Height and width of one bin, in feature-map cells. Generally not whole
    /// numbers, so neighboring bins may overlap by a row or column.
    pub fn bin_size(&self) -> (f32, f32) {
        (self.bin_h, self.bin_w)
    }

    /// Extent of output cell `(ph, pw)` within a `height x width` plane.
    pub fn bin(&self, ph: usize, pw: usize, height: usize, width: usize) -> BinExtent {
        let edge = |offset: f32, start: i64, limit: usize| -> usize {
            (offset as i64).saturating_add(start).clamp(0, limit as i64) as usize
        };
        let h0 = edge((ph as f32 * self.bin_h).floor(), self.start_h, height);
        let h1 = edge(((ph + 1) as f32 * self.bin_h).ceil(), self.start_h, height);
        let w0 = edge((pw as f32 * self.bin_w).floor(), self.start_w, width);
        let w1 = edge(((pw + 1) as f32 * self.bin_w).ceil(), self.start_w, width);
        BinExtent {
            rows: h0..h1,
            cols: w0..w1,
        }
    }

    /// Extents of every output cell, shaped `(pooled_height, pooled_width)`.
    pub fn bins(&self, height: usize, width: usize) -> Array2<BinExtent> {
        Array2::from_shape_fn((self.pooled_height, self.pooled_width), |(ph, pw)| {
            self.bin(ph, pw, height, width)
        })
    }
}

/// Half-open rectangle of input cells feeding one output cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinExtent {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl BinExtent {
    /// A bin with no input cells pools to zero and has no argmax.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.cols.is_empty()
    }
}
