//! # Position-Sensitive ROI Pooling
//!
//! Each output channel `ctop` of bin `(ph, pw)` averages the integer cells of
//! that bin taken from its own input channel `(ctop * group + gh) * group + gw`,
//! so a `group x group` grid of score maps votes for the parts of an ROI.

use rayon::prelude::*;

use crate::{
    error::{check_len, KernelResult},
    geometry::{roi_count, RoiBox, ROI_RECORD_LEN},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsRoiPoolParams {
    pub output_dim: usize,
    pub group_size: usize,
    pub spatial_scale: f32,
}

impl PsRoiPoolParams {
    /// Input channels the feature map must carry, `output_dim * group_size^2`.
    pub const fn input_channels(&self) -> usize {
        self.output_dim * self.group_size * self.group_size
    }

    /// Output elements per ROI.
    pub const fn per_roi(&self) -> usize {
        self.input_channels()
    }

    /// Input channel read by output channel `ctop` at bin `(ph, pw)`.
    pub const fn source_channel(&self, ctop: usize, ph: usize, pw: usize) -> usize {
        (ctop * self.group_size + ph) * self.group_size + pw
    }
}

/// Integer cell range `[hstart, hend) x [wstart, wend)` of one bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellBin {
    hstart: usize,
    hend: usize,
    wstart: usize,
    wend: usize,
}

impl CellBin {
    fn new(roi: &RoiBox, ph: usize, pw: usize, group: usize, height: usize, width: usize) -> Self {
        let bin_h = roi.height / group as f32;
        let bin_w = roi.width / group as f32;
        let clamp = |v: f32, max: usize| (v.max(0.0) as usize).min(max);
        Self {
            hstart: clamp((ph as f32 * bin_h + roi.start_h).floor(), height),
            hend: clamp(((ph + 1) as f32 * bin_h + roi.start_h).ceil(), height),
            wstart: clamp((pw as f32 * bin_w + roi.start_w).floor(), width),
            wend: clamp(((pw + 1) as f32 * bin_w + roi.start_w).ceil(), width),
        }
    }

    fn area(&self) -> usize {
        self.hend.saturating_sub(self.hstart) * self.wend.saturating_sub(self.wstart)
    }

    fn cells(&self, width: usize) -> impl Iterator<Item = usize> + '_ {
        (self.hstart..self.hend)
            .flat_map(move |h| (self.wstart..self.wend).map(move |w| h * width + w))
    }
}

/// Averages each position-sensitive bin of every ROI.
///
/// `output` and `mapping_channel` hold `(R, output_dim, group, group)`
/// elements; `mapping_channel` records the input channel each output read.
pub fn psroi_pool_forward(
    features: &[f32],
    dims: [usize; 4],
    rois: &[f32],
    params: &PsRoiPoolParams,
    output: &mut [f32],
    mapping_channel: &mut [usize],
) -> KernelResult<()> {
    let [num, channels, height, width] = dims;
    check_len("features", features.len(), dims.iter().product())?;
    check_len("feature channels", channels, params.input_channels())?;
    let num_rois = roi_count(rois)?;
    let per_roi = params.per_roi();
    check_len("output", output.len(), num_rois * per_roi)?;
    check_len("mapping channel", mapping_channel.len(), num_rois * per_roi)?;
    if per_roi == 0 {
        return Ok(());
    }

    let boxes = rois
        .chunks_exact(ROI_RECORD_LEN)
        .map(|record| RoiBox::rounded(record, params.spatial_scale, num))
        .collect::<KernelResult<Vec<_>>>()?;

    let group = params.group_size;
    let plane = height * width;
    output
        .par_chunks_mut(per_roi)
        .zip(mapping_channel.par_chunks_mut(per_roi))
        .zip(boxes.par_iter())
        .for_each(|((out, mapping), roi)| {
            for ctop in 0..params.output_dim {
                for ph in 0..group {
                    for pw in 0..group {
                        let index = (ctop * group + ph) * group + pw;
                        let c = params.source_channel(ctop, ph, pw);
                        let bin = CellBin::new(roi, ph, pw, group, height, width);
                        let area = bin.area();
                        out[index] = if area == 0 {
                            0.0
                        } else {
                            let channel =
                                &features[(roi.batch_index * channels + c) * plane..][..plane];
                            bin.cells(width).map(|i| channel[i]).sum::<f32>() / area as f32
                        };
                        mapping[index] = c;
                    }
                }
            }
        });
    Ok(())
}

/// Spreads each output gradient evenly over the cells of its bin in the
/// recorded channel. Values are added into `bottom_diff`.
pub fn psroi_pool_backward(
    top_diff: &[f32],
    rois: &[f32],
    mapping_channel: &[usize],
    dims: [usize; 4],
    params: &PsRoiPoolParams,
    bottom_diff: &mut [f32],
) -> KernelResult<()> {
    let [num, channels, height, width] = dims;
    check_len("bottom diff", bottom_diff.len(), dims.iter().product())?;
    check_len("feature channels", channels, params.input_channels())?;
    let num_rois = roi_count(rois)?;
    let per_roi = params.per_roi();
    check_len("top diff", top_diff.len(), num_rois * per_roi)?;
    check_len("mapping channel", mapping_channel.len(), num_rois * per_roi)?;

    let boxes = rois
        .chunks_exact(ROI_RECORD_LEN)
        .map(|record| RoiBox::rounded(record, params.spatial_scale, num))
        .collect::<KernelResult<Vec<_>>>()?;

    let group = params.group_size;
    let plane = height * width;
    if plane == 0 || group == 0 {
        return Ok(());
    }
    bottom_diff
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(plane_index, grad)| {
            let (n, c) = (plane_index / channels, plane_index % channels);
            // every input channel feeds exactly one (ctop, ph, pw)
            let (ctop, ph, pw) = (c / (group * group), (c / group) % group, c % group);
            let index = (ctop * group + ph) * group + pw;
            for (r, roi) in boxes.iter().enumerate().filter(|(_, roi)| roi.batch_index == n) {
                let element = r * per_roi + index;
                if mapping_channel[element] != c {
                    continue;
                }
                let bin = CellBin::new(roi, ph, pw, group, height, width);
                let area = bin.area();
                if area == 0 {
                    continue;
                }
                let share = top_diff[element] / area as f32;
                for i in bin.cells(width) {
                    grad[i] += share;
                }
            }
        });
    Ok(())
}
