//! # Fixed Batch Normalization
//!
//! Normalizes every channel with stored statistics instead of batch
//! statistics. The layer keeps three frozen parameters in the usual
//! accumulated form: the per-channel mean sum, the per-channel variance sum
//! and a single count they are divided by.

use burn::prelude::*;
use log::{debug, info};
use rfcn_ops::Blob;

use super::scale_fixed::apply_channel_affine;
use crate::{
    error::{LayerError, LayerResult},
    layer::{
        check_backward_counts, check_blob_counts, check_num_bottoms, check_shape, InPlaceLayer,
        Layer, LayerParam,
    },
};

/// Configuration for [`BatchNormFixed`].
#[derive(Config, Debug)]
pub struct BatchNormFixedConfig {
    /// Decay of the moving statistics. Stored with the layer; the frozen
    /// statistics are never updated with it.
    #[config(default = "0.999")]
    pub moving_average_fraction: f32,
    #[config(default = "1e-5")]
    pub eps: f32,
}

impl BatchNormFixedConfig {
    pub fn validate(&self) -> LayerResult<()> {
        if !(self.eps.is_finite() && self.eps >= 0.0) {
            return Err(LayerError::config(format!(
                "eps must be non-negative, got {}",
                self.eps
            )));
        }
        if !(0.0..=1.0).contains(&self.moving_average_fraction) {
            return Err(LayerError::config(format!(
                "moving_average_fraction must lie in [0, 1], got {}",
                self.moving_average_fraction
            )));
        }
        Ok(())
    }

    pub fn init(&self) -> LayerResult<BatchNormFixed> {
        self.validate()?;
        Ok(BatchNormFixed {
            config: self.clone(),
            channels: 0,
            spatial_dim: 0,
            params: Vec::new(),
        })
    }
}

#[derive(Debug)]
pub struct BatchNormFixed {
    config: BatchNormFixedConfig,
    channels: usize,
    spatial_dim: usize,
    params: Vec<LayerParam>,
}

impl BatchNormFixed {
    pub fn config(&self) -> &BatchNormFixedConfig {
        &self.config
    }

    /// Per-channel `1 / sqrt(var + eps)` and `-mean / sqrt(var + eps)`.
    fn normalization(&self) -> LayerResult<(Vec<f32>, Vec<f32>)> {
        let [mean_sum, var_sum, count] = self.params.as_slice() else {
            return Err(LayerError::config("BatchNormFixed used before layer_setup"));
        };
        let count = count.blob.data().first().copied().unwrap_or(0.0);
        let factor = if count == 0.0 { 0.0 } else { 1.0 / count };

        let scale: Vec<f32> = var_sum
            .blob
            .data()
            .iter()
            .map(|&v| 1.0 / (v * factor + self.config.eps).sqrt())
            .collect();
        let shift = mean_sum
            .blob
            .data()
            .iter()
            .zip(&scale)
            .map(|(&m, &s)| -m * factor * s)
            .collect();
        Ok((scale, shift))
    }

    fn check_count(&self, blob: &Blob) -> LayerResult<()> {
        let per_item = self.channels * self.spatial_dim;
        if per_item == 0 || blob.count() % per_item != 0 {
            return Err(LayerError::shape(
                format!("{} channels of {} elements", self.channels, self.spatial_dim),
                blob.dims(),
            ));
        }
        Ok(())
    }
}

impl Layer for BatchNormFixed {
    fn layer_type(&self) -> &'static str {
        "BatchNormFixed"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        1
    }

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    fn layer_setup(&mut self, bottom: &[&[usize]]) -> LayerResult<()> {
        check_num_bottoms(self, bottom)?;
        let dims = bottom[0];
        self.channels = match dims.len() {
            0 => return Err(LayerError::shape("at least one axis", dims)),
            1 => 1,
            _ => dims[1],
        };
        if !self.params.is_empty() {
            info!("BatchNormFixed: skipping parameter initialization");
            return Ok(());
        }
        self.params = vec![
            LayerParam::frozen(Blob::new([self.channels])),
            LayerParam::frozen(Blob::new([self.channels])),
            LayerParam::frozen(Blob::new([1])),
        ];
        debug!("BatchNormFixed: created statistics for {} channels", self.channels);
        info!(
            "BatchNormFixed: eps {}, moving_average_fraction {}",
            self.config.eps, self.config.moving_average_fraction
        );
        Ok(())
    }

    fn reshape(&mut self, bottom: &[&[usize]]) -> LayerResult<Vec<Vec<usize>>> {
        check_num_bottoms(self, bottom)?;
        let dims = bottom[0];
        if dims.len() >= 2 && dims[1] != self.channels {
            return Err(LayerError::shape(format!("{} channels", self.channels), dims));
        }
        let num = dims.first().copied().unwrap_or(0);
        let count: usize = dims.iter().product();
        self.spatial_dim = if num == 0 { 0 } else { count / (num * self.channels) };
        Ok(vec![dims.to_vec()])
    }

    fn forward(&mut self, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()> {
        check_blob_counts(self, bottom.len(), top.len())?;
        check_shape(&top[0], bottom[0].dims(), "output")?;
        top[0].data_mut().copy_from_slice(bottom[0].data());
        self.forward_in_place(&mut top[0])
    }

    fn backward(
        &mut self,
        top: &[&Blob],
        propagate_down: &[bool],
        bottom: &mut [Blob],
    ) -> LayerResult<()> {
        check_backward_counts(self, top.len(), propagate_down.len(), bottom.len())?;
        if !propagate_down[0] {
            return Ok(());
        }
        check_shape(&bottom[0], top[0].dims(), "input")?;
        bottom[0].diff_mut().copy_from_slice(top[0].diff());
        self.backward_in_place(&mut bottom[0])
    }

    fn params(&self) -> &[LayerParam] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [LayerParam] {
        &mut self.params
    }
}

impl InPlaceLayer for BatchNormFixed {
    fn forward_in_place(&mut self, blob: &mut Blob) -> LayerResult<()> {
        self.check_count(blob)?;
        let (scale, shift) = self.normalization()?;
        apply_channel_affine(blob.data_mut(), self.spatial_dim, &scale, Some(&shift));
        Ok(())
    }

    fn backward_in_place(&mut self, blob: &mut Blob) -> LayerResult<()> {
        self.check_count(blob)?;
        let (scale, _) = self.normalization()?;
        apply_channel_affine(blob.diff_mut(), self.spatial_dim, &scale, None);
        Ok(())
    }
}
