//! ROI Align layer: max over bilinear samples of every ROI bin.

use burn::prelude::*;
use log::{debug, info};
use rfcn_ops::{roi_align_backward, roi_align_forward, Blob, RoiAlignParams, SamplePoint};

use crate::{
    error::{LayerError, LayerResult},
    layer::{
        check_backward_counts, check_blob_counts, check_num_bottoms, check_shape, roi_records,
        shape4, Layer,
    },
};

/// Configuration for [`RoiAlign`].
#[derive(Config, Debug)]
pub struct RoiAlignConfig {
    pub pooled_h: usize,
    pub pooled_w: usize,
    /// Factor mapping ROI coordinates onto the feature map.
    #[config(default = "1.0")]
    pub spatial_scale: f32,
    /// Samples per bin along each axis.
    #[config(default = "2")]
    pub sampling_ratio: usize,
}

impl RoiAlignConfig {
    pub fn validate(&self) -> LayerResult<()> {
        if self.pooled_h == 0 || self.pooled_w == 0 {
            return Err(LayerError::config(format!(
                "pooled size must be positive, got {}x{}",
                self.pooled_h, self.pooled_w
            )));
        }
        if !(self.spatial_scale.is_finite() && self.spatial_scale > 0.0) {
            return Err(LayerError::config(format!(
                "spatial_scale must be positive, got {}",
                self.spatial_scale
            )));
        }
        if self.sampling_ratio == 0 {
            return Err(LayerError::config("sampling_ratio must be positive"));
        }
        Ok(())
    }

    pub fn init(&self) -> LayerResult<RoiAlign> {
        self.validate()?;
        info!("ROIAlign spatial scale: {}", self.spatial_scale);
        Ok(RoiAlign {
            params: RoiAlignParams {
                pooled_h: self.pooled_h,
                pooled_w: self.pooled_w,
                spatial_scale: self.spatial_scale,
                sampling_ratio: self.sampling_ratio,
            },
            dims: [0; 4],
            argmax: Vec::new(),
        })
    }
}

#[derive(Debug)]
pub struct RoiAlign {
    params: RoiAlignParams,
    dims: [usize; 4],
    argmax: Vec<Option<SamplePoint>>,
}

impl Layer for RoiAlign {
    fn layer_type(&self) -> &'static str {
        "ROIAlign"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        2
    }

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    fn reshape(&mut self, bottom: &[&[usize]]) -> LayerResult<Vec<Vec<usize>>> {
        check_num_bottoms(self, bottom)?;
        self.dims = shape4(bottom[0], "feature map")?;
        let num_rois = roi_records(bottom[1])?;
        let top = vec![num_rois, self.dims[1], self.params.pooled_h, self.params.pooled_w];
        self.argmax.resize(top.iter().product(), None);
        debug!("ROIAlign reshaped to {top:?}");
        Ok(vec![top])
    }

    fn forward(&mut self, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()> {
        check_blob_counts(self, bottom.len(), top.len())?;
        check_shape(bottom[0], &self.dims, "feature map")?;
        roi_align_forward(
            bottom[0].data(),
            self.dims,
            bottom[1].data(),
            &self.params,
            top[0].data_mut(),
            &mut self.argmax,
        )?;
        Ok(())
    }

    fn backward(
        &mut self,
        top: &[&Blob],
        propagate_down: &[bool],
        bottom: &mut [Blob],
    ) -> LayerResult<()> {
        check_backward_counts(self, top.len(), propagate_down.len(), bottom.len())?;
        check_shape(&bottom[0], &self.dims, "feature map")?;
        let (features, rois) = bottom.split_at_mut(1);
        if propagate_down[1] {
            rois[0].fill_diff(0.0);
        }
        if !propagate_down[0] {
            return Ok(());
        }
        let grad = features[0].diff_mut();
        grad.fill(0.0);
        roi_align_backward(
            top[0].diff(),
            rois[0].data(),
            &self.argmax,
            self.dims,
            &self.params,
            grad,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gradient_check::{random_values, GradientChecker},
        layer::setup,
    };
    use rfcn_ops::KernelError;

    fn ramp(dims: [usize; 4]) -> Blob {
        let len = dims.iter().product();
        Blob::from_vec(dims, (1..=len).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn pools_quarter_point_maxima() {
        let features = ramp([1, 1, 5, 5]);
        let rois = Blob::from_vec([1, 5], vec![0.0, 0.0, 0.0, 3.0, 3.0]).unwrap();
        let mut layer = RoiAlignConfig::new(2, 2).init().unwrap();
        let mut top = vec![Blob::default()];
        setup(&mut layer, &[&features, &rois], &mut top).unwrap();
        layer.forward(&[&features, &rois], &mut top).unwrap();

        assert_eq!(top[0].dims(), &[1, 1, 2, 2]);
        for (got, want) in top[0].data().iter().zip([7.75, 9.25, 15.25, 16.75]) {
            assert!((got - want).abs() < 1e-5, "{got} != {want}");
        }
    }

    #[test]
    fn empty_roi_pools_to_zero() {
        let features = ramp([1, 1, 5, 5]);
        let rois = Blob::from_vec([1, 5, 1, 1], vec![0.0, 40.0, 40.0, 50.0, 50.0]).unwrap();
        let mut layer = RoiAlignConfig::new(2, 2).init().unwrap();
        let mut top = vec![Blob::default()];
        setup(&mut layer, &[&features, &rois], &mut top).unwrap();
        layer.forward(&[&features, &rois], &mut top).unwrap();
        assert_eq!(top[0].data(), &[0.0; 4]);
    }

    #[test]
    fn gradients_match_finite_differences() {
        // a steep ramp keeps the winning sample of every bin well separated
        let noise = random_values(100, 0.0, 0.1, 4);
        let mut features = ramp([2, 2, 5, 5]);
        features.data_mut().iter_mut().zip(noise).for_each(|(v, n)| *v += n);
        let rois = Blob::from_vec(
            [2, 5],
            vec![0.0, 0.5, 0.5, 3.5, 3.0, 1.0, 1.0, 0.0, 4.0, 3.5],
        )
        .unwrap();
        let mut layer = RoiAlignConfig::new(2, 3).init().unwrap();
        let mut bottom = vec![features, rois];
        let mut top = vec![Blob::default()];
        GradientChecker::default().check(&mut layer, &mut bottom, &mut top, &[0]);
    }

    #[test]
    fn invalid_batch_index_leaves_top_untouched() {
        let features = ramp([1, 1, 5, 5]);
        let rois = Blob::from_vec([1, 5], vec![1.0, 0.0, 0.0, 3.0, 3.0]).unwrap();
        let mut layer = RoiAlignConfig::new(2, 2).init().unwrap();
        let mut top = vec![Blob::default()];
        setup(&mut layer, &[&features, &rois], &mut top).unwrap();
        top[0].fill_data(-1.0);

        let err = layer.forward(&[&features, &rois], &mut top).unwrap_err();
        assert!(matches!(
            err,
            LayerError::Kernel(KernelError::InvalidBatchIndex { batch: 1, .. })
        ));
        assert!(top[0].data().iter().all(|&v| v == -1.0));
    }

    #[test]
    fn rejects_malformed_inputs() {
        let mut layer = RoiAlignConfig::new(2, 2).init().unwrap();
        let mut top = vec![Blob::default()];
        let features = ramp([1, 1, 5, 5]);
        let rois = Blob::new([3, 4]);
        assert!(matches!(
            setup(&mut layer, &[&features, &rois], &mut top),
            Err(LayerError::InvalidTensorShape { .. })
        ));
        assert!(matches!(
            setup(&mut layer, &[&features], &mut top),
            Err(LayerError::WrongBlobCount { expected: 2, actual: 1, .. })
        ));
        assert!(RoiAlignConfig::new(0, 2).init().is_err());
        assert!(RoiAlignConfig::new(2, 2).with_spatial_scale(0.0).init().is_err());
    }

    #[test]
    fn roi_gradient_is_zeroed_on_request() {
        let features = ramp([1, 1, 5, 5]);
        let mut rois = Blob::from_vec([1, 5], vec![0.0, 0.0, 0.0, 3.0, 3.0]).unwrap();
        rois.fill_diff(3.0);
        let mut layer = RoiAlignConfig::new(2, 2).init().unwrap();
        let mut top = vec![Blob::default()];
        setup(&mut layer, &[&features, &rois], &mut top).unwrap();
        layer.forward(&[&features, &rois], &mut top).unwrap();
        top[0].fill_diff(1.0);

        let mut bottom = vec![features, rois];
        layer.backward(&[&top[0]], &[true, true], &mut bottom).unwrap();
        assert!(bottom[1].diff().iter().all(|&g| g == 0.0));
        assert!((bottom[0].diff().iter().sum::<f32>() - 4.0).abs() < 1e-5);
    }

    #[test]
    fn forward_rejects_features_that_were_not_reshaped() {
        let features = ramp([1, 1, 5, 5]);
        let rois = Blob::from_vec([1, 5], vec![0.0, 0.0, 0.0, 3.0, 3.0]).unwrap();
        let mut layer = RoiAlignConfig::new(2, 2).init().unwrap();
        let mut top = vec![Blob::default()];
        setup(&mut layer, &[&features, &rois], &mut top).unwrap();

        let transposed = ramp([1, 5, 5, 1]);
        let err = layer.forward(&[&transposed, &rois], &mut top).unwrap_err();
        assert!(matches!(err, LayerError::InvalidTensorShape { .. }));
    }
}
