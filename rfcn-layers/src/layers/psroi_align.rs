//! Position-sensitive ROI Align layer.

use burn::prelude::*;
use log::{debug, info};
use rfcn_ops::{psroi_align_backward, psroi_align_forward, Blob, PsRoiAlignParams};

use super::psroi_pooling::check_score_maps;
use crate::{
    error::{LayerError, LayerResult},
    layer::{
        check_backward_counts, check_blob_counts, check_num_bottoms, check_shape, roi_records,
        Layer,
    },
};

/// Configuration for [`PsRoiAlign`].
#[derive(Config, Debug)]
pub struct PsRoiAlignConfig {
    /// Channels of the pooled output.
    pub output_dim: usize,
    /// Side of the position-sensitive grid, also the pooled size.
    pub group_size: usize,
    #[config(default = "1.0")]
    pub spatial_scale: f32,
    /// Samples per bin along each axis.
    #[config(default = "2")]
    pub sampling_ratio: usize,
}

impl PsRoiAlignConfig {
    pub fn validate(&self) -> LayerResult<()> {
        if self.output_dim == 0 || self.group_size == 0 {
            return Err(LayerError::config(format!(
                "output_dim and group_size must be positive, got {} and {}",
                self.output_dim, self.group_size
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

    pub fn init(&self) -> LayerResult<PsRoiAlign> {
        self.validate()?;
        info!("PSROIAlign spatial scale: {}", self.spatial_scale);
        Ok(PsRoiAlign {
            params: PsRoiAlignParams {
                output_dim: self.output_dim,
                group_size: self.group_size,
                spatial_scale: self.spatial_scale,
                sampling_ratio: self.sampling_ratio,
            },
            dims: [0; 4],
        })
    }
}

#[derive(Debug)]
pub struct PsRoiAlign {
    params: PsRoiAlignParams,
    dims: [usize; 4],
}

impl Layer for PsRoiAlign {
    fn layer_type(&self) -> &'static str {
        "PSROIAlign"
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
        debug!("PSROIAlign reshaped to {top:?}");
        Ok(vec![top])
    }

    fn forward(&mut self, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()> {
        check_blob_counts(self, bottom.len(), top.len())?;
        check_shape(bottom[0], &self.dims, "feature map")?;
        psroi_align_forward(
            bottom[0].data(),
            self.dims,
            bottom[1].data(),
            &self.params,
            top[0].data_mut(),
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
        psroi_align_backward(top[0].diff(), rois[0].data(), self.dims, &self.params, grad)?;
        Ok(())
    }
}
