//! # Geometry and Index Utilities
//!
//! Shape bookkeeping, bilinear corner weights and ROI scaling shared by the
//! deformable column transform and the ROI pooling engines.

use crate::error::{check_len, KernelError, KernelResult};

/// Number of values in one ROI record: `[batch_index, x1, y1, x2, y2]`.
pub const ROI_RECORD_LEN: usize = 5;

/// Output extent of a convolution along one spatial axis.
///
/// Returns `None` when the dilated kernel does not fit into the padded input
/// or when `kernel` or `stride` is zero.
pub const fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
    dilation: usize,
) -> Option<usize> {
    if kernel == 0 || stride == 0 {
        return None;
    }
    let extent = dilation * (kernel - 1) + 1;
    let padded = input + 2 * pad;
    if padded < extent {
        None
    } else {
        Some((padded - extent) / stride + 1)
    }
}

/// A fractional sampling location inside a feature plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePoint {
    pub y: f32,
    pub x: f32,
}

impl SamplePoint {
    pub const fn new(y: f32, x: f32) -> Self {
        Self { y, x }
    }

    /// Whether the point lies in `[0, height) x [0, width)`.
    pub fn is_inside(&self, height: usize, width: usize) -> bool {
        self.y >= 0.0 && self.x >= 0.0 && self.y < height as f32 && self.x < width as f32
    }
}

/// The four integer neighbours of a sample point and their bilinear weights.
///
/// Corner `(yc, xc)` carries weight `(1 - |y - yc|) * (1 - |x - xc|)`. A corner
/// outside `[0, height) x [0, width)` has no index and contributes nothing,
/// neither to sampled values nor to scattered gradients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BilinearCorners {
    /// Plane offsets of the corners in `(low, low)`, `(low, high)`, `(high, low)`,
    /// `(high, high)` order as `(y, x)` pairs.
    index: [Option<usize>; 4],
    ly: f32,
    lx: f32,
}

impl BilinearCorners {
    pub fn new(point: SamplePoint, height: usize, width: usize) -> Self {
        let y_low = point.y.floor();
        let x_low = point.x.floor();
        let ly = point.y - y_low;
        let lx = point.x - x_low;

        let y_low = y_low as isize;
        let x_low = x_low as isize;
        let locate = |y: isize, x: isize| {
            (y >= 0 && x >= 0 && (y as usize) < height && (x as usize) < width)
                .then(|| y as usize * width + x as usize)
        };

        Self {
            index: [
                locate(y_low, x_low),
                locate(y_low, x_low + 1),
                locate(y_low + 1, x_low),
                locate(y_low + 1, x_low + 1),
            ],
            ly,
            lx,
        }
    }

    fn weights(&self) -> [f32; 4] {
        let (hy, hx) = (1.0 - self.ly, 1.0 - self.lx);
        [hy * hx, hy * self.lx, self.ly * hx, self.ly * self.lx]
    }

    /// Valid corners as `(plane offset, weight)` pairs.
    pub fn taps(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.index
            .into_iter()
            .zip(self.weights())
            .filter_map(|(index, weight)| index.map(|i| (i, weight)))
    }

    /// Interpolated value of `plane` at the sample point.
    pub fn sample(&self, plane: &[f32]) -> f32 {
        self.taps().map(|(i, w)| w * plane[i]).sum()
    }

    /// Adds `value` times each corner weight into `plane`.
    pub fn scatter(&self, plane: &mut [f32], value: f32) {
        for (i, w) in self.taps() {
            plane[i] += w * value;
        }
    }

    /// Derivative of [`sample`](Self::sample) with respect to the y coordinate.
    pub fn grad_y(&self, plane: &[f32]) -> f32 {
        let hx = 1.0 - self.lx;
        let coeff = [-hx, -self.lx, hx, self.lx];
        self.weighted_sum(plane, coeff)
    }

    /// Derivative of [`sample`](Self::sample) with respect to the x coordinate.
    pub fn grad_x(&self, plane: &[f32]) -> f32 {
        let hy = 1.0 - self.ly;
        let coeff = [-hy, hy, -self.ly, self.ly];
        self.weighted_sum(plane, coeff)
    }

    fn weighted_sum(&self, plane: &[f32], coeff: [f32; 4]) -> f32 {
        self.index
            .iter()
            .zip(coeff)
            .filter_map(|(index, c)| index.map(|i| c * plane[i]))
            .sum()
    }
}

/// Number of ROI records in a flat `(R, 5)` buffer, checking its length.
pub fn roi_count(rois: &[f32]) -> KernelResult<usize> {
    let count = rois.len() / ROI_RECORD_LEN;
    check_len("rois", rois.len(), count * ROI_RECORD_LEN)?;
    Ok(count)
}

/// Validates the batch index stored in an ROI record.
///
/// The index must be a non-negative whole number below `batch`.
pub fn validate_batch_index(value: f32, batch: usize) -> KernelResult<usize> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && (value as usize) < batch {
        Ok(value as usize)
    } else {
        Err(KernelError::InvalidBatchIndex { value, batch })
    }
}

/// Batch index of every ROI record, validated against the feature batch.
pub fn roi_batch_indices(rois: &[f32], num: usize) -> KernelResult<Vec<usize>> {
    roi_count(rois)?;
    rois.chunks_exact(ROI_RECORD_LEN)
        .map(|record| validate_batch_index(record[0], num))
        .collect()
}

/// An ROI scaled into feature-map coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiBox {
    pub batch_index: usize,
    pub start_h: f32,
    pub start_w: f32,
    pub height: f32,
    pub width: f32,
}

impl RoiBox {
    /// Scales a record and clips its corners to `[0, dim - 1]`.
    ///
    /// The extent has no `+1` adjustment and may collapse to zero.
    pub fn clipped(
        record: &[f32],
        spatial_scale: f32,
        batch: usize,
        height: usize,
        width: usize,
    ) -> KernelResult<Self> {
        let batch_index = validate_batch_index(record[0], batch)?;
        let max_h = height.saturating_sub(1) as f32;
        let max_w = width.saturating_sub(1) as f32;
        let start_w = (record[1] * spatial_scale).clamp(0.0, max_w);
        let start_h = (record[2] * spatial_scale).clamp(0.0, max_h);
        let end_w = (record[3] * spatial_scale).clamp(0.0, max_w);
        let end_h = (record[4] * spatial_scale).clamp(0.0, max_h);
        Ok(Self {
            batch_index,
            start_h,
            start_w,
            height: (end_h - start_h).max(0.0),
            width: (end_w - start_w).max(0.0),
        })
    }

    /// Rounds the raw corners, extends the end by one pixel and scales.
    ///
    /// The extent is floored at 0.1 so malformed boxes still get tiny bins.
    pub fn rounded(record: &[f32], spatial_scale: f32, batch: usize) -> KernelResult<Self> {
        let batch_index = validate_batch_index(record[0], batch)?;
        let start_w = record[1].round() * spatial_scale;
        let start_h = record[2].round() * spatial_scale;
        let end_w = (record[3] + 1.0).round() * spatial_scale;
        let end_h = (record[4] + 1.0).round() * spatial_scale;
        Ok(Self {
            batch_index,
            start_h,
            start_w,
            height: (end_h - start_h).max(0.1),
            width: (end_w - start_w).max(0.1),
        })
    }

    /// The fractional bin `(ph, pw)` of a `pooled_h x pooled_w` grid over the box.
    pub fn bin(&self, ph: usize, pw: usize, pooled_h: usize, pooled_w: usize) -> AlignedBin {
        let bin_h = self.height / pooled_h as f32;
        let bin_w = self.width / pooled_w as f32;
        AlignedBin {
            hstart: self.start_h + ph as f32 * bin_h,
            wstart: self.start_w + pw as f32 * bin_w,
            bin_h,
            bin_w,
        }
    }
}

/// One pooling bin with fractional bounds, sampled on a regular sub-grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignedBin {
    pub hstart: f32,
    pub wstart: f32,
    pub bin_h: f32,
    pub bin_w: f32,
}

impl AlignedBin {
    pub fn is_empty(&self) -> bool {
        self.bin_h <= 0.0 || self.bin_w <= 0.0
    }

    /// `ratio x ratio` points at `start + (i + 0.5) * bin / ratio`, row-major.
    ///
    /// With `ratio == 2` these are the quarter and three-quarter points of the bin.
    pub fn samples(&self, ratio: usize) -> impl Iterator<Item = SamplePoint> + '_ {
        let step_h = self.bin_h / ratio as f32;
        let step_w = self.bin_w / ratio as f32;
        (0..ratio).flat_map(move |iy| {
            let y = self.hstart + (iy as f32 + 0.5) * step_h;
            (0..ratio).map(move |ix| SamplePoint::new(y, self.wstart + (ix as f32 + 0.5) * step_w))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_output_size_matches_convolution_arithmetic() {
        assert_eq!(conv_output_size(3, 3, 1, 1, 1), Some(3));
        assert_eq!(conv_output_size(7, 3, 2, 0, 1), Some(3));
        assert_eq!(conv_output_size(7, 3, 1, 0, 2), Some(3));
        assert_eq!(conv_output_size(2, 5, 1, 0, 1), None);
        assert_eq!(conv_output_size(4, 0, 1, 0, 1), None);
    }

    #[test]
    fn bilinear_sample_interpolates_plane() {
        // 2 x 3 plane [[1, 2, 3], [4, 5, 6]]
        let plane = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let corners = BilinearCorners::new(SamplePoint::new(0.5, 0.5), 2, 3);
        assert!((corners.sample(&plane) - 3.0).abs() < 1e-6);

        let corners = BilinearCorners::new(SamplePoint::new(1.0, 2.0), 2, 3);
        assert!((corners.sample(&plane) - 6.0).abs() < 1e-6);
    }

    #[test]
    fn corners_outside_plane_contribute_nothing() {
        let plane = [1.0, 2.0, 3.0, 4.0];
        let corners = BilinearCorners::new(SamplePoint::new(1.5, 1.5), 2, 2);
        assert_eq!(corners.taps().count(), 1);
        assert!((corners.sample(&plane) - 1.0).abs() < 1e-6);

        let mut grad = [0.0; 4];
        corners.scatter(&mut grad, 2.0);
        assert_eq!(grad, [0.0, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn coordinate_gradients_match_finite_differences() {
        let plane = [1.0, 4.0, 2.0, 8.0, 3.0, 5.0, 7.0, 6.0, 0.5];
        let point = SamplePoint::new(0.3, 1.2);
        let corners = BilinearCorners::new(point, 3, 3);
        let eps = 1e-3;
        let at = |y: f32, x: f32| BilinearCorners::new(SamplePoint::new(y, x), 3, 3).sample(&plane);
        let dy = (at(point.y + eps, point.x) - at(point.y - eps, point.x)) / (2.0 * eps);
        let dx = (at(point.y, point.x + eps) - at(point.y, point.x - eps)) / (2.0 * eps);
        assert!((corners.grad_y(&plane) - dy).abs() < 1e-2);
        assert!((corners.grad_x(&plane) - dx).abs() < 1e-2);
    }

    #[test]
    fn clipped_roi_collapses_to_zero_extent() {
        let roi = RoiBox::clipped(&[0.0, 10.0, 10.0, 12.0, 12.0], 1.0, 1, 5, 5).unwrap();
        assert_eq!(roi.height, 0.0);
        assert!(roi.bin(0, 0, 2, 2).is_empty());
    }

    #[test]
    fn rounded_roi_extends_end_by_one() {
        let roi = RoiBox::rounded(&[0.0, 0.4, 0.6, 3.4, 3.4], 0.5, 1).unwrap();
        assert_eq!(roi.start_w, 0.0);
        assert_eq!(roi.start_h, 0.5);
        assert_eq!(roi.width, 2.0);
        assert_eq!(roi.height, 1.5);
    }

    #[test]
    fn aligned_bin_samples_quarter_points() {
        let roi = RoiBox::clipped(&[0.0, 0.0, 0.0, 3.0, 3.0], 1.0, 1, 5, 5).unwrap();
        let bin = roi.bin(0, 1, 2, 2);
        let points: Vec<_> = bin.samples(2).collect();
        assert_eq!(
            points,
            vec![
                SamplePoint::new(0.375, 1.875),
                SamplePoint::new(0.375, 2.625),
                SamplePoint::new(1.125, 1.875),
                SamplePoint::new(1.125, 2.625),
            ]
        );
    }

    #[test]
    fn batch_index_is_validated() {
        assert_eq!(validate_batch_index(1.0, 2), Ok(1));
        assert!(validate_batch_index(2.0, 2).is_err());
        assert!(validate_batch_index(-1.0, 2).is_err());
        assert!(validate_batch_index(0.5, 2).is_err());
        assert!(validate_batch_index(f32::NAN, 2).is_err());
    }

    #[test]
    fn batch_indices_are_validated() {
        let rois = [1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        assert_eq!(roi_batch_indices(&rois, 2).unwrap(), vec![1, 0]);
        assert!(roi_batch_indices(&rois, 1).is_err());
    }
}
