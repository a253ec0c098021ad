//! Position-sensitive ROI pooling layer.

use burn::prelude::*;
use log::{debug, info};
use rfcn_ops::{psroi_pool_backward, psroi_pool_forward, Blob, PsRoiPoolParams};

use crate::{
    error::{LayerError, LayerResult},
    layer::{
        check_backward_counts, check_blob_counts, check_num_bottoms, check_shape, roi_records,
        shape4, Layer,
    },
};

/// Configuration for [`PsRoiPooling`].
#[derive(Config, Debug)]
pub struct PsRoiPoolingConfig {
    /// Channels of the pooled output.
    pub output_dim: usize,
    /// Side of the position-sensitive grid, also the pooled size.
    pub group_size: usize,
    #[config(default = "1.0")]
    pub spatial_scale: f32,
}

impl PsRoiPoolingConfig {
    pub fn validate(&self) -> LayerResult<()> {
        if self.output_dim == 0 {
            return Err(LayerError::config("output_dim must be positive"));
        }
        if self.group_size == 0 {
            return Err(LayerError::config("group_size must be positive"));
        }
        if !(self.spatial_scale.is_finite() && self.spatial_scale > 0.0) {
            return Err(LayerError::config(format!(
                "spatial_scale must be positive, got {}",
                self.spatial_scale
            )));
        }
        Ok(())
    }

    pub fn init(&self) -> LayerResult<PsRoiPooling> {
        self.validate()?;
        info!("PSROIPooling spatial scale: {}", self.spatial_scale);
        Ok(PsRoiPooling {
            params: PsRoiPoolParams {
                output_dim: self.output_dim,
                group_size: self.group_size,
                spatial_scale: self.spatial_scale,
            },
            dims: [0; 4],
            mapping_channel: Vec::new(),
        })
    }
}

/// Checks that a feature map carries `output_dim * group_size^2` channels.
pub(crate) fn check_score_maps(dims: &[usize], expected: usize) -> LayerResult<[usize; 4]> {
    let dims4 = shape4(dims, "score maps")?;
    if dims4[1] != expected {
        return Err(LayerError::shape(
            format!("{expected} channels (output_dim * group_size^2)"),
            dims,
        ));
    }
    Ok(dims4)
}

#[derive(Debug)]
pub struct PsRoiPooling {
    params: PsRoiPoolParams,
    dims: [usize; 4],
    mapping_channel: Vec<usize>,
}

impl Layer for PsRoiPooling {
    fn layer_type(&self) -> &'static str {
        "PSROIPooling"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        2
    }

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    fn reshape(&mut self, bottom: &[&[usize]]) -> LayerResult<Vec<Vec<usize>>> {
        check_num_bottoms(self, bottom)?;
        self.dims = check_score_maps(bottom[0], self.params.input_channels())?;
        let num_rois = roi_records(bottom[1])?;
        let group = self.params.group_size;
        let top = vec![num_rois, self.params.output_dim, group, group];
        self.mapping_channel.resize(top.iter().product(), 0);
        debug!("PSROIPooling reshaped to {top:?}");
        Ok(vec![top])
    }

    fn forward(&mut self, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()> {
        check_blob_counts(self, bottom.len(), top.len())?;
        check_shape(bottom[0], &self.dims, "feature map")?;
        psroi_pool_forward(
            bottom[0].data(),
            self.dims,
            bottom[1].data(),
            &self.params,
            top[0].data_mut(),
            &mut self.mapping_channel,
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
        psroi_pool_backward(
            top[0].diff(),
            rois[0].data(),
            &self.mapping_channel,
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

    #[test]
    fn averages_each_score_map_over_its_bin() {
        let features =
            Blob::from_vec([1, 4, 4, 4], (0..64).map(|i| (i / 16 * 100 + i % 16) as f32).collect())
                .unwrap();
        let rois = Blob::from_vec([1, 5], vec![0.0, 0.0, 0.0, 3.0, 3.0]).unwrap();
        let mut layer = PsRoiPoolingConfig::new(1, 2).init().unwrap();
        let mut top = vec![Blob::default()];
        setup(&mut layer, &[&features, &rois], &mut top).unwrap();
        layer.forward(&[&features, &rois], &mut top).unwrap();
        assert_eq!(top[0].dims(), &[1, 1, 2, 2]);
        assert_eq!(top[0].data(), &[2.5, 104.5, 210.5, 312.5]);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let features = Blob::from_vec([2, 8, 6, 6], random_values(576, -1.0, 1.0, 21)).unwrap();
        let rois = Blob::from_vec(
            [3, 5],
            vec![
                0.0, 0.0, 0.0, 5.0, 5.0, //
                1.0, 2.0, 1.0, 9.0, 7.0, //
                1.0, 6.0, 4.0, 7.0, 5.0,
            ],
        )
        .unwrap();
        let mut layer = PsRoiPoolingConfig::new(2, 2)
            .with_spatial_scale(0.5)
            .init()
            .unwrap();
        let mut bottom = vec![features, rois];
        let mut top = vec![Blob::default()];
        GradientChecker::default().check(&mut layer, &mut bottom, &mut top, &[0]);
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let features = Blob::new([1, 5, 4, 4]);
        let rois = Blob::new([1, 5]);
        let mut layer = PsRoiPoolingConfig::new(1, 2).init().unwrap();
        let mut top = vec![Blob::default()];
        let err = setup(&mut layer, &[&features, &rois], &mut top).unwrap_err();
        assert!(matches!(err, LayerError::InvalidTensorShape { .. }));
    }
}
