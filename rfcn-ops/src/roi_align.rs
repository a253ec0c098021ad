//! # ROI Align
//!
//! Max pooling over bilinearly sampled points of each ROI bin. ROIs are scaled
//! into feature coordinates and clipped to the map; every bin is sampled on a
//! `sampling_ratio x sampling_ratio` grid and the largest sample wins. The
//! winning location is kept so the backward pass can route the gradient to the
//! corners it was interpolated from.

use rayon::prelude::*;

use crate::{
    error::{check_len, KernelResult},
    geometry::{
        roi_batch_indices, roi_count, BilinearCorners, RoiBox, SamplePoint, ROI_RECORD_LEN,
    },
};

/// Pooling parameters shared by the forward and backward passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiAlignParams {
    pub pooled_h: usize,
    pub pooled_w: usize,
    pub spatial_scale: f32,
    pub sampling_ratio: usize,
}

impl RoiAlignParams {
    pub const fn bins(&self) -> usize {
        self.pooled_h * self.pooled_w
    }
}

/// Pools every ROI over `features`, a `[num, channels, height, width]` map.
///
/// `output` and `argmax` hold `(R, channels, pooled_h, pooled_w)` elements.
/// Bins of zero extent produce 0 with no arg-max.
pub fn roi_align_forward(
    features: &[f32],
    dims: [usize; 4],
    rois: &[f32],
    params: &RoiAlignParams,
    output: &mut [f32],
    argmax: &mut [Option<SamplePoint>],
) -> KernelResult<()> {
    let [num, channels, height, width] = dims;
    check_len("features", features.len(), dims.iter().product())?;
    let num_rois = roi_count(rois)?;
    let per_roi = channels * params.bins();
    check_len("output", output.len(), num_rois * per_roi)?;
    check_len("argmax", argmax.len(), num_rois * per_roi)?;
    if per_roi == 0 {
        return Ok(());
    }

    let boxes = rois
        .chunks_exact(ROI_RECORD_LEN)
        .map(|record| RoiBox::clipped(record, params.spatial_scale, num, height, width))
        .collect::<KernelResult<Vec<_>>>()?;

    let plane = height * width;
    output
        .par_chunks_mut(per_roi)
        .zip(argmax.par_chunks_mut(per_roi))
        .zip(boxes.par_iter())
        .for_each(|((out, arg), roi)| {
            for c in 0..channels {
                let channel = &features[(roi.batch_index * channels + c) * plane..][..plane];
                for ph in 0..params.pooled_h {
                    for pw in 0..params.pooled_w {
                        let index = (c * params.pooled_h + ph) * params.pooled_w + pw;
                        let bin = roi.bin(ph, pw, params.pooled_h, params.pooled_w);
                        if bin.is_empty() {
                            out[index] = 0.0;
                            arg[index] = None;
                            continue;
                        }

                        let mut best = f32::NEG_INFINITY;
                        let mut best_point = None;
                        for point in bin.samples(params.sampling_ratio) {
                            let value = BilinearCorners::new(point, height, width).sample(channel);
                            if value > best {
                                best = value;
                                best_point = Some(point);
                            }
                        }
                        out[index] = if best_point.is_some() { best } else { 0.0 };
                        arg[index] = best_point;
                    }
                }
            }
        });
    Ok(())
}

/// Routes `top_diff` back to the bilinear corners of every stored arg-max.
///
/// Gradients are added into `bottom_diff`, which is processed one
/// `(image, channel)` plane at a time.
pub fn roi_align_backward(
    top_diff: &[f32],
    rois: &[f32],
    argmax: &[Option<SamplePoint>],
    dims: [usize; 4],
    params: &RoiAlignParams,
    bottom_diff: &mut [f32],
) -> KernelResult<()> {
    let [num, channels, height, width] = dims;
    check_len("bottom diff", bottom_diff.len(), dims.iter().product())?;
    let num_rois = roi_count(rois)?;
    let per_roi = channels * params.bins();
    check_len("top diff", top_diff.len(), num_rois * per_roi)?;
    check_len("argmax", argmax.len(), num_rois * per_roi)?;

    let batch_indices = roi_batch_indices(rois, num)?;

    let plane = height * width;
    if plane == 0 {
        return Ok(());
    }
    bottom_diff
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(plane_index, grad)| {
            let (n, c) = (plane_index / channels, plane_index % channels);
            for (r, _) in batch_indices.iter().enumerate().filter(|&(_, &b)| b == n) {
                let start = r * per_roi + c * params.bins();
                let diffs = &top_diff[start..start + params.bins()];
                let points = &argmax[start..start + params.bins()];
                for (&diff, point) in diffs.iter().zip(points) {
                    if let Some(point) = point {
                        BilinearCorners::new(*point, height, width).scatter(grad, diff);
                    }
                }
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;

    const PARAMS: RoiAlignParams = RoiAlignParams {
        pooled_h: 2,
        pooled_w: 2,
        spatial_scale: 1.0,
        sampling_ratio: 2,
    };

    fn ramp(len: usize) -> Vec<f32> {
        (1..=len).map(|v| v as f32).collect()
    }

    #[test]
    fn pools_maximum_of_quarter_point_samples() {
        let features = ramp(25);
        let rois = [0.0, 0.0, 0.0, 3.0, 3.0];
        let mut output = [0.0; 4];
        let mut argmax = [None; 4];
        roi_align_forward(&features, [1, 1, 5, 5], &rois, &PARAMS, &mut output, &mut argmax)
            .unwrap();

        let expected = [7.75, 9.25, 15.25, 16.75];
        for (got, want) in output.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "{got} != {want}");
        }
        assert_eq!(argmax[0], Some(SamplePoint::new(1.125, 1.125)));
        assert_eq!(argmax[3], Some(SamplePoint::new(2.625, 2.625)));
    }

    #[test]
    fn roi_outside_the_map_gives_empty_bins() {
        let features = ramp(25);
        let rois = [0.0, 10.0, 10.0, 12.0, 12.0];
        let mut output = [1.0; 4];
        let mut argmax = [Some(SamplePoint::new(0.0, 0.0)); 4];
        roi_align_forward(&features, [1, 1, 5, 5], &rois, &PARAMS, &mut output, &mut argmax)
            .unwrap();
        assert_eq!(output, [0.0; 4]);
        assert_eq!(argmax, [None; 4]);
    }

    #[test]
    fn empty_bins_receive_no_gradient() {
        let rois = [0.0, 10.0, 10.0, 12.0, 12.0];
        let mut output = [0.0; 4];
        let mut argmax = [None; 4];
        roi_align_forward(&ramp(25), [1, 1, 5, 5], &rois, &PARAMS, &mut output, &mut argmax)
            .unwrap();

        let mut grad = vec![0.0; 25];
        roi_align_backward(&[1.0, -2.0, 3.0, 4.0], &rois, &argmax, [1, 1, 5, 5], &PARAMS, &mut grad)
            .unwrap();
        assert!(grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn backward_scatters_to_argmax_corners() {
        let features = ramp(25);
        let rois = [0.0, 0.0, 0.0, 3.0, 3.0];
        let mut output = [0.0; 4];
        let mut argmax = [None; 4];
        roi_align_forward(&features, [1, 1, 5, 5], &rois, &PARAMS, &mut output, &mut argmax)
            .unwrap();

        let mut grad = vec![0.0; 25];
        roi_align_backward(&[1.0, 0.0, 0.0, 0.0], &rois, &argmax, [1, 1, 5, 5], &PARAMS, &mut grad)
            .unwrap();
        // arg-max (1.125, 1.125) spreads over cells (1,1), (1,2), (2,1), (2,2)
        assert!((grad[6] - 0.765625).abs() < 1e-6);
        assert!((grad[7] - 0.109375).abs() < 1e-6);
        assert!((grad[11] - 0.109375).abs() < 1e-6);
        assert!((grad[12] - 0.015625).abs() < 1e-6);
        assert!((grad.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn backward_routes_to_the_roi_batch_entry() {
        let features = ramp(2 * 2 * 25);
        let dims = [2, 2, 5, 5];
        let rois = [1.0, 0.0, 0.0, 3.0, 3.0];
        let mut output = [0.0; 8];
        let mut argmax = [None; 8];
        roi_align_forward(&features, dims, &rois, &PARAMS, &mut output, &mut argmax).unwrap();
        // image 1, channel 1 starts at 76
        assert!((output[4] - (75.0 + 7.75)).abs() < 1e-4);

        let mut grad = vec![0.0; 100];
        roi_align_backward(&[1.0; 8], &rois, &argmax, dims, &PARAMS, &mut grad).unwrap();
        assert!(grad[..50].iter().all(|&g| g == 0.0));
        assert!((grad[50..75].iter().sum::<f32>() - 4.0).abs() < 1e-5);
        assert!((grad[75..].iter().sum::<f32>() - 4.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_out_of_range_batch_index() {
        let features = ramp(25);
        let mut output = [0.0; 4];
        let mut argmax = [None; 4];
        let err = roi_align_forward(
            &features,
            [1, 1, 5, 5],
            &[3.0, 0.0, 0.0, 1.0, 1.0],
            &PARAMS,
            &mut output,
            &mut argmax,
        )
        .unwrap_err();
        assert_eq!(err, KernelError::InvalidBatchIndex { value: 3.0, batch: 1 });
    }

    #[test]
    fn rejects_truncated_roi_buffer() {
        let mut output = [0.0; 4];
        let mut argmax = [None; 4];
        let result = roi_align_forward(
            &ramp(25),
            [1, 1, 5, 5],
            &[0.0, 0.0, 0.0, 1.0],
            &PARAMS,
            &mut output,
            &mut argmax,
        );
        assert!(matches!(result, Err(KernelError::BufferLength { name: "rois", .. })));
    }
}
