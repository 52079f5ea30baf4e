//! ROI max pooling: the forward reduction and the backward gradient routing.
//!
//! Feature maps have the shape `(batch_size, channels, height, width)`.
//! Regions are rows of `{batch_index, x1, y1, x2, y2}`. Pooled output and the
//! argmax map have the shape `(num_rois, channels, pooled_height, pooled_width)`.

use log::{debug, log_enabled, trace, Level};
use ndarray::prelude::*;
use ndarray::Zip;
use rayon::prelude::*;

use crate::argmax::ArgmaxMap;
use crate::config::RoiPoolConfig;
use crate::error::{Result, RoiPoolError};
use crate::region::{BinExtent, Region, RoiGeometry, REGION_WIDTH};

/// Largest value in one bin of a channel plane, with its flat index.
///
/// Scans in row-major order and only replaces the running max on a strictly
/// greater value, so ties go to the first element scanned. `None` for an
/// empty bin.
fn max_in_bin(plane: ArrayView2<'_, f32>, bin: &BinExtent) -> Option<(f32, usize)> {
    if bin.is_empty() {
        return None;
    }
    let width = plane.ncols();
    plane
        .slice(s![bin.rows.clone(), bin.cols.clone()])
        .indexed_iter()
        .map(|((i, j), &v)| (v, (bin.rows.start + i) * width + bin.cols.start + j))
        .reduce(|best, next| if next.0 > best.0 { next } else { best })
}

/// Pool every channel of one region.
///
/// `x` is the `(channels, height, width)` sample the region refers to; `y` and
/// `argmax` are that region's `(channels, pooled_height, pooled_width)` slices.
fn pool_region(
    x: ArrayView3<'_, f32>,
    bins: ArrayView2<'_, BinExtent>,
    mut y: ArrayViewMut3<'_, f32>,
    mut argmax: ArrayViewMut3<'_, Option<usize>>,
) {
    debug_assert_eq!(y.raw_dim(), argmax.raw_dim());
    for ((plane, mut y), mut argmax) in x
        .outer_iter()
        .zip(y.outer_iter_mut())
        .zip(argmax.outer_iter_mut())
    {
        Zip::from(&mut y)
            .and(&mut argmax)
            .and(&bins)
            .for_each(|y, argmax, bin| match max_in_bin(plane, bin) {
                Some((v, i)) => {
                    *y = v;
                    *argmax = Some(i);
                }
                None => {
                    *y = 0.0;
                    *argmax = None;
                }
            });
    }
}

/// Max-pool each region of `x` into a fixed `pooled_height x pooled_width`
/// grid per channel.
///
/// Returns the pooled output together with the argmax map needed by
/// [`backward`]. Every region's batch index is checked before any pooling is
/// done; a bad one fails the whole call.
pub fn forward(
    config: &RoiPoolConfig,
    x: ArrayView4<'_, f32>,
    rois: ArrayView2<'_, f32>,
) -> Result<(Array4<f32>, ArgmaxMap)> {
    let (batch_size, channels, height, width) = x.dim();
    let num_rois = rois.nrows();
    if rois.ncols() < REGION_WIDTH {
        return Err(RoiPoolError::shape(
            "regions",
            &[num_rois, REGION_WIDTH],
            rois.shape(),
        ));
    }
    debug!(
        "roi pool forward: {num_rois} regions over {batch_size}x{channels}x{height}x{width}, pooled to {}x{}",
        config.pooled_height(),
        config.pooled_width()
    );

    let regions: Vec<Region> = rois.outer_iter().map(Region::from_row).collect();
    let batch_indices = regions
        .iter()
        .enumerate()
        .map(|(n, region)| region.batch_index(n, batch_size))
        .collect::<Result<Vec<usize>>>()?;

    let out_dim = Ix4(num_rois, channels, config.pooled_height(), config.pooled_width());
    let mut y = Array4::<f32>::zeros(out_dim);
    let mut argmax = Array4::<Option<usize>>::from_elem(out_dim, None);

    // Regions are independent; each task owns one region's output slices.
    y.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(argmax.axis_iter_mut(Axis(0)))
        .zip(regions.par_iter().zip(batch_indices.par_iter()))
        .for_each(|((y, argmax), (region, &b))| {
            let bins = RoiGeometry::new(region, config).bins(height, width);
            pool_region(x.index_axis(Axis(0), b), bins.view(), y, argmax);
        });

    let argmax = ArgmaxMap::new(argmax, batch_indices, x.raw_dim());
    if log_enabled!(Level::Trace) {
        trace!(
            "roi pool forward: {} of {} pooled cells empty",
            argmax.num_empty(),
            out_dim.size()
        );
    }
    Ok((y, argmax))
}

/// Route the pooled-output gradient `dz` back to the input elements that
/// produced each max, adding into `dx`.
///
/// `dx` is accumulated into, not overwritten: pass zeros for a fresh gradient.
/// Overlapping regions and overlapping bins that picked the same element all
/// contribute. Empty bins contribute nothing.
pub fn backward(argmax: &ArgmaxMap, dz: ArrayView4<'_, f32>, mut dx: ArrayViewMut4<'_, f32>) -> Result<()> {
    if dz.raw_dim() != argmax.dim() {
        return Err(RoiPoolError::shape(
            "output gradient",
            argmax.dim().slice(),
            dz.shape(),
        ));
    }
    if dx.raw_dim() != argmax.input_dim() {
        return Err(RoiPoolError::shape(
            "input gradient",
            argmax.input_dim().slice(),
            dx.shape(),
        ));
    }
    debug!(
        "roi pool backward: {} regions into {:?}",
        argmax.num_rois(),
        dx.shape()
    );

    // Two regions can pick the same input element, so work is split by input
    // plane: each task owns one (sample, channel) plane of `dx` and visits the
    // regions reading that sample in order.
    let mut by_sample = vec![Vec::new(); dx.len_of(Axis(0))];
    for (n, &b) in argmax.batch_indices().iter().enumerate() {
        by_sample[b].push(n);
    }
    let indices = argmax.indices();

    dx.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(by_sample.par_iter())
        .for_each(|(mut dx, rois)| {
            dx.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(c, mut plane)| {
                    let width = plane.ncols();
                    for &n in rois {
                        Zip::from(dz.slice(s![n, c, .., ..]))
                            .and(indices.slice(s![n, c, .., ..]))
                            .for_each(|&g, &i| {
                                if let Some(i) = i {
                                    plane[(i / width, i % width)] += g;
                                }
                            });
                    }
                });
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, c: usize, h: usize, w: usize) -> Array4<f32> {
        Array::range(0.0, (n * c * h * w) as f32, 1.0)
            .into_shape((n, c, h, w))
            .unwrap()
    }

    /// A 4-D array from row-major `values`.
    fn planes<T>(shape: (usize, usize, usize, usize), values: Vec<T>) -> Array4<T> {
        Array::from_shape_vec(shape, values).unwrap()
    }

    #[test]
    fn quadrants() {
        let config = RoiPoolConfig::square(2, 1.0).unwrap();
        let x = ramp(1, 1, 4, 4);
        let rois = array![[0.0, 0.0, 0.0, 3.0, 3.0]];
        let (y, argmax) = forward(&config, x.view(), rois.view()).unwrap();
        assert_eq!(y, planes((1, 1, 2, 2), vec![5.0, 7.0, 13.0, 15.0]));
        assert_eq!(
            argmax.indices(),
            planes((1, 1, 2, 2), vec![Some(5), Some(7), Some(13), Some(15)])
        );
        assert_eq!(argmax.position(13), (3, 1));
    }

    #[test]
    fn negative_maxima() {
        let config = RoiPoolConfig::square(1, 1.0).unwrap();
        let x = -ramp(1, 1, 2, 2) - 1.0;
        let rois = array![[0.0, 0.0, 0.0, 1.0, 1.0]];
        let (y, argmax) = forward(&config, x.view(), rois.view()).unwrap();
        assert_eq!(y[[0, 0, 0, 0]], -1.0);
        assert_eq!(argmax.get(0, 0, 0, 0), Some(0));
    }

    #[test]
    fn ties_go_to_first_scanned() {
        let config = RoiPoolConfig::square(1, 1.0).unwrap();
        let x = planes((1, 1, 2, 2), vec![1.0, 3.0, 3.0, 3.0]);
        let rois = array![[0.0, 0.0, 0.0, 1.0, 1.0]];
        let (_, argmax) = forward(&config, x.view(), rois.view()).unwrap();
        assert_eq!(argmax.get(0, 0, 0, 0), Some(1));
    }

    #[test]
    fn gradient_reaches_index_zero() {
        let config = RoiPoolConfig::square(1, 1.0).unwrap();
        let x = planes((1, 1, 2, 2), vec![9.0, 1.0, 2.0, 3.0]);
        let rois = array![[0.0, 0.0, 0.0, 1.0, 1.0]];
        let (_, argmax) = forward(&config, x.view(), rois.view()).unwrap();
        assert_eq!(argmax.get(0, 0, 0, 0), Some(0));

        let mut dx = Array4::zeros(x.raw_dim());
        backward(&argmax, planes((1, 1, 1, 1), vec![0.5]).view(), dx.view_mut()).unwrap();
        assert_eq!(dx, planes((1, 1, 2, 2), vec![0.5, 0.0, 0.0, 0.0]));
    }

    #[test]
    fn empty_region() {
        let config = RoiPoolConfig::square(2, 2.0).unwrap();
        let x = ramp(1, 2, 4, 4) + 1.0;
        let rois = array![[0.0, 100.0, 100.0, 100.0, 100.0]];
        let (y, argmax) = forward(&config, x.view(), rois.view()).unwrap();
        assert!(y.iter().all(|&v| v == 0.0));
        assert_eq!(argmax.num_empty(), 8);

        let mut dx = Array4::zeros(x.raw_dim());
        backward(&argmax, Array4::ones(y.raw_dim()).view(), dx.view_mut()).unwrap();
        assert!(dx.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn regions_pick_their_sample_and_channels() {
        let config = RoiPoolConfig::square(1, 1.0).unwrap();
        let x = ramp(2, 3, 2, 2);
        let rois = array![[1.0, 0.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0, 1.0]];
        let (y, argmax) = forward(&config, x.view(), rois.view()).unwrap();
        // Sample 1 starts at 12; each channel plane holds 4 values.
        assert_eq!(y.slice(s![0, .., 0, 0]), array![12.0, 16.0, 20.0]);
        assert_eq!(y.slice(s![1, .., 0, 0]), array![3.0, 7.0, 11.0]);
        assert_eq!(argmax.batch_indices(), &[1, 0]);
        assert_eq!(argmax.get(0, 2, 0, 0), Some(0));
        assert_eq!(argmax.get(1, 2, 0, 0), Some(3));
    }

    #[test]
    fn overlapping_regions_accumulate() {
        let config = RoiPoolConfig::square(1, 1.0).unwrap();
        let x = ramp(1, 1, 3, 3);
        let rois = array![
            [0.0, 0.0, 0.0, 2.0, 2.0],
            [0.0, 1.0, 1.0, 2.0, 2.0],
            [0.0, 0.0, 0.0, 0.0, 0.0],
        ];
        let (_, argmax) = forward(&config, x.view(), rois.view()).unwrap();
        let mut dx = Array4::from_elem(x.raw_dim(), 1.0);
        let dz = planes((3, 1, 1, 1), vec![0.25, 0.5, 2.0]);
        backward(&argmax, dz.view(), dx.view_mut()).unwrap();
        assert_eq!(
            dx,
            planes((1, 1, 3, 3), vec![3.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.75])
        );
    }

    #[test]
    fn bad_batch_index_fails_whole_call() {
        let config = RoiPoolConfig::square(2, 1.0).unwrap();
        let x = ramp(2, 1, 4, 4);
        let rois = array![[0.0, 0.0, 0.0, 3.0, 3.0], [2.0, 0.0, 0.0, 3.0, 3.0]];
        assert_eq!(
            forward(&config, x.view(), rois.view()),
            Err(RoiPoolError::BatchIndexOutOfRange {
                roi: 1,
                batch_index: 2.0,
                batch_size: 2
            })
        );
    }

    #[test]
    fn shape_checks() {
        let config = RoiPoolConfig::square(2, 1.0).unwrap();
        let x = ramp(1, 1, 4, 4);
        assert!(matches!(
            forward(&config, x.view(), Array2::zeros((1, 4)).view()),
            Err(RoiPoolError::ShapeMismatch { .. })
        ));

        let rois = array![[0.0, 0.0, 0.0, 3.0, 3.0]];
        let (y, argmax) = forward(&config, x.view(), rois.view()).unwrap();
        let mut dx = Array4::zeros(x.raw_dim());
        assert!(backward(&argmax, Array4::zeros((1, 1, 3, 2)).view(), dx.view_mut()).is_err());
        let mut wrong = Array4::zeros((2, 1, 4, 4));
        assert!(backward(&argmax, y.view(), wrong.view_mut()).is_err());
        assert!(dx.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn no_regions() {
        let config = RoiPoolConfig::square(3, 1.0).unwrap();
        let x = ramp(1, 2, 4, 4);
        let (y, argmax) = forward(&config, x.view(), Array2::zeros((0, 5)).view()).unwrap();
        assert_eq!(y.shape(), &[0, 2, 3, 3]);
        assert_eq!(argmax.num_rois(), 0);
    }
}
