//! # Position-Sensitive ROI Align
//!
//! Position-sensitive pooling on clipped, fractional bins: each bin averages
//! `sampling_ratio x sampling_ratio` bilinear samples of its own score map.

use rayon::prelude::*;

use crate::{
    error::{check_len, KernelResult},
    geometry::{roi_count, BilinearCorners, RoiBox, ROI_RECORD_LEN},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsRoiAlignParams {
    pub output_dim: usize,
    pub group_size: usize,
    pub spatial_scale: f32,
    pub sampling_ratio: usize,
}

impl PsRoiAlignParams {
    /// Input channels the feature map must carry, `output_dim * group_size^2`.
    pub const fn input_channels(&self) -> usize {
        self.output_dim * self.group_size * self.group_size
    }

    const fn samples_per_bin(&self) -> usize {
        self.sampling_ratio * self.sampling_ratio
    }
}

fn clipped_boxes(rois: &[f32], params: &PsRoiAlignParams, dims: [usize; 4]) -> KernelResult<Vec<RoiBox>> {
    let [num, _, height, width] = dims;
    rois.chunks_exact(ROI_RECORD_LEN)
        .map(|record| RoiBox::clipped(record, params.spatial_scale, num, height, width))
        .collect()
}

/// Averages the bilinear samples of each position-sensitive bin.
///
/// `output` holds `(R, output_dim, group, group)` elements.
pub fn psroi_align_forward(
    features: &[f32],
    dims: [usize; 4],
    rois: &[f32],
    params: &PsRoiAlignParams,
    output: &mut [f32],
) -> KernelResult<()> {
    let [_, channels, height, width] = dims;
    check_len("features", features.len(), dims.iter().product())?;
    check_len("feature channels", channels, params.input_channels())?;
    let num_rois = roi_count(rois)?;
    let per_roi = params.input_channels();
    check_len("output", output.len(), num_rois * per_roi)?;
    if per_roi == 0 {
        return Ok(());
    }

    let boxes = clipped_boxes(rois, params, dims)?;
    let group = params.group_size;
    let plane = height * width;
    output
        .par_chunks_mut(per_roi)
        .zip(boxes.par_iter())
        .for_each(|(out, roi)| {
            for (index, value) in out.iter_mut().enumerate() {
                // output index and source channel coincide
                let (ph, pw) = ((index / group) % group, index % group);
                let bin = roi.bin(ph, pw, group, group);
                if bin.is_empty() || params.samples_per_bin() == 0 {
                    *value = 0.0;
                    continue;
                }
                let channel = &features[(roi.batch_index * channels + index) * plane..][..plane];
                let total: f32 = bin
                    .samples(params.sampling_ratio)
                    .map(|point| BilinearCorners::new(point, height, width).sample(channel))
                    .sum();
                *value = total / params.samples_per_bin() as f32;
            }
        });
    Ok(())
}

/// Distributes `grad / samples` to the bilinear corners of every sample of
/// every bin. Values are added into `bottom_diff`.
pub fn psroi_align_backward(
    top_diff: &[f32],
    rois: &[f32],
    dims: [usize; 4],
    params: &PsRoiAlignParams,
    bottom_diff: &mut [f32],
) -> KernelResult<()> {
    let [_, channels, height, width] = dims;
    check_len("bottom diff", bottom_diff.len(), dims.iter().product())?;
    check_len("feature channels", channels, params.input_channels())?;
    let num_rois = roi_count(rois)?;
    let per_roi = params.input_channels();
    check_len("top diff", top_diff.len(), num_rois * per_roi)?;

    let boxes = clipped_boxes(rois, params, dims)?;
    let group = params.group_size;
    let plane = height * width;
    if plane == 0 || group == 0 || params.samples_per_bin() == 0 {
        return Ok(());
    }
    let samples = params.samples_per_bin() as f32;
    bottom_diff
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(plane_index, grad)| {
            let (n, c) = (plane_index / channels, plane_index % channels);
            let (ph, pw) = ((c / group) % group, c % group);
            for (r, roi) in boxes.iter().enumerate().filter(|(_, roi)| roi.batch_index == n) {
                let bin = roi.bin(ph, pw, group, group);
                if bin.is_empty() {
                    continue;
                }
                let share = top_diff[r * per_roi + c] / samples;
                for point in bin.samples(params.sampling_ratio) {
                    BilinearCorners::new(point, height, width).scatter(grad, share);
                }
            }
        });
    Ok(())
}
