//! # Deformable Convolution
//!
//! Convolution whose kernel taps sample the input at learned fractional
//! offsets. Each image is laid out with a deformable im2col and multiplied
//! with the weights of every filter group.
//!
//! Bottoms are the data `(N, C, H, W)` and the offset field
//! `(N, deformable_group * kh * kw * 2, out_h, out_w)`; the top is
//! `(N, num_output, out_h, out_w)`.

use burn::prelude::*;
use log::{debug, info};
use rand::{rngs::StdRng, SeedableRng};
use rfcn_ops::{
    deformable_col2im, deformable_col2im_coord, deformable_im2col,
    math::{gemm, Transpose},
    Blob, DeformableGeometry,
};

use crate::{
    error::{LayerError, LayerResult},
    filler::FillerConfig,
    layer::{
        check_backward_counts, check_blob_counts, check_num_bottoms, check_shape, shape4, Layer,
        LayerParam,
    },
};

/// Configuration for [`DeformableConvolution`].
#[derive(Config, Debug)]
pub struct DeformableConvolutionConfig {
    /// Number of output channels.
    pub num_output: usize,
    /// Kernel extent `[h, w]`.
    #[config(default = "[3, 3]")]
    pub kernel_size: [usize; 2],
    #[config(default = "[1, 1]")]
    pub stride: [usize; 2],
    #[config(default = "[0, 0]")]
    pub pad: [usize; 2],
    #[config(default = "[1, 1]")]
    pub dilation: [usize; 2],
    /// Number of filter groups.
    #[config(default = "1")]
    pub group: usize,
    /// Number of channel groups sharing one offset field.
    #[config(default = "1")]
    pub deformable_group: usize,
    #[config(default = "true")]
    pub bias_term: bool,
    #[config(default = "FillerConfig::Xavier")]
    pub weight_filler: FillerConfig,
    #[config(default = "FillerConfig::constant(0.0)")]
    pub bias_filler: FillerConfig,
    /// Seed of the random fillers.
    #[config(default = "0")]
    pub seed: u64,
}

impl DeformableConvolutionConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err(LayerError::InvalidConfiguration)` for zero sizes or when
    /// `num_output` does not split into `group` filter groups.
    pub fn validate(&self) -> LayerResult<()> {
        if self.num_output == 0 {
            return Err(LayerError::config("num_output must be positive"));
        }
        if self.kernel_size.contains(&0) || self.stride.contains(&0) || self.dilation.contains(&0) {
            return Err(LayerError::config(format!(
                "kernel_size {:?}, stride {:?} and dilation {:?} must be positive",
                self.kernel_size, self.stride, self.dilation
            )));
        }
        if self.group == 0 || self.deformable_group == 0 {
            return Err(LayerError::config("group and deformable_group must be positive"));
        }
        if self.num_output % self.group != 0 {
            return Err(LayerError::config(format!(
                "num_output {} is not divisible by group {}",
                self.num_output, self.group
            )));
        }
        self.weight_filler.validate()?;
        self.bias_filler.validate()
    }

    pub fn init(&self) -> LayerResult<DeformableConvolution> {
        self.validate()?;
        Ok(DeformableConvolution {
            config: self.clone(),
            params: Vec::new(),
            channels: 0,
            num: 0,
            geometry: None,
            col_buffer: Vec::new(),
            col_diff: Vec::new(),
        })
    }
}

#[derive(Debug)]
pub struct DeformableConvolution {
    config: DeformableConvolutionConfig,
    params: Vec<LayerParam>,
    channels: usize,
    num: usize,
    geometry: Option<DeformableGeometry>,
    col_buffer: Vec<f32>,
    col_diff: Vec<f32>,
}

impl DeformableConvolution {
    fn geometry(&self) -> LayerResult<DeformableGeometry> {
        self.geometry
            .ok_or_else(|| LayerError::config("DeformableConvolution used before reshape"))
    }

    /// Rows and inner dimension of one filter group's weight matrix.
    fn group_dims(&self, geometry: &DeformableGeometry) -> (usize, usize) {
        let m = self.config.num_output / self.config.group;
        let k = self.channels / self.config.group * geometry.taps();
        (m, k)
    }

    /// Checks the data, offset and output blobs against the reshaped geometry.
    fn check_blobs(
        &self,
        geometry: &DeformableGeometry,
        data: &Blob,
        offset: &Blob,
        top: &Blob,
    ) -> LayerResult<()> {
        let (out_h, out_w) = (geometry.out_h, geometry.out_w);
        check_shape(data, &[self.num, self.channels, geometry.height, geometry.width], "input")?;
        check_shape(offset, &[self.num, geometry.offset_channels(), out_h, out_w], "offset")?;
        check_shape(top, &[self.num, self.config.num_output, out_h, out_w], "output")
    }
}

impl Layer for DeformableConvolution {
    fn layer_type(&self) -> &'static str {
        "DeformableConvolution"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        2
    }

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    fn layer_setup(&mut self, bottom: &[&[usize]]) -> LayerResult<()> {
        check_num_bottoms(self, bottom)?;
        let [_, channels, _, _] = shape4(bottom[0], "convolution input")?;
        let config = &self.config;
        if channels % config.group != 0 {
            return Err(LayerError::config(format!(
                "input channels {channels} are not divisible by group {}",
                config.group
            )));
        }
        if channels % config.deformable_group != 0 {
            return Err(LayerError::config(format!(
                "input channels {channels} are not divisible by deformable_group {}",
                config.deformable_group
            )));
        }
        self.channels = channels;

        let [kh, kw] = config.kernel_size;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut weight = Blob::new([config.num_output, channels / config.group, kh, kw]);
        config.weight_filler.fill(&mut weight, &mut rng)?;
        self.params = vec![LayerParam::trainable(weight)];
        if config.bias_term {
            let mut bias = Blob::new([config.num_output]);
            config.bias_filler.fill(&mut bias, &mut rng)?;
            self.params.push(LayerParam::trainable(bias));
        }
        info!(
            "DeformableConvolution: {} -> {} channels, kernel {:?}, group {}, deformable_group {}",
            channels, config.num_output, config.kernel_size, config.group, config.deformable_group
        );
        Ok(())
    }

    fn reshape(&mut self, bottom: &[&[usize]]) -> LayerResult<Vec<Vec<usize>>> {
        check_num_bottoms(self, bottom)?;
        if self.params.is_empty() {
            return Err(LayerError::config("DeformableConvolution used before layer_setup"));
        }
        let [num, channels, height, width] = shape4(bottom[0], "convolution input")?;
        if channels != self.channels {
            return Err(LayerError::shape(
                format!("input with {} channels", self.channels),
                bottom[0],
            ));
        }
        let config = &self.config;
        let geometry = DeformableGeometry::new(
            channels,
            [height, width],
            config.kernel_size,
            config.pad,
            config.stride,
            config.dilation,
            config.deformable_group,
        )
        .ok_or_else(|| LayerError::shape("input larger than the dilated kernel", bottom[0]))?;

        let expected_offset = [num, geometry.offset_channels(), geometry.out_h, geometry.out_w];
        if bottom[1] != expected_offset {
            return Err(LayerError::shape(format!("offset {expected_offset:?}"), bottom[1]));
        }

        self.num = num;
        self.geometry = Some(geometry);
        self.col_buffer.resize(geometry.col_len(), 0.0);
        self.col_diff.resize(geometry.col_len(), 0.0);
        debug!(
            "DeformableConvolution reshaped to {num}x{}x{}x{}",
            config.num_output, geometry.out_h, geometry.out_w
        );
        Ok(vec![vec![num, config.num_output, geometry.out_h, geometry.out_w]])
    }

    fn forward(&mut self, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()> {
        check_blob_counts(self, bottom.len(), top.len())?;
        let geometry = self.geometry()?;
        let (m, k) = self.group_dims(&geometry);
        let spatial = geometry.out_spatial();
        let (image_len, offset_len) = (geometry.image_len(), geometry.offset_len());
        let top_len = self.config.num_output * spatial;
        self.check_blobs(&geometry, bottom[0], bottom[1], &top[0])?;

        let weight = self.params[0].blob.data();
        let bias = self.params.get(1).map(|param| param.blob.data());
        for n in 0..self.num {
            deformable_im2col(
                &bottom[0].data()[n * image_len..][..image_len],
                &bottom[1].data()[n * offset_len..][..offset_len],
                &geometry,
                &mut self.col_buffer,
            )?;
            let output = &mut top[0].data_mut()[n * top_len..][..top_len];
            for g in 0..self.config.group {
                gemm(
                    Transpose::No,
                    Transpose::No,
                    m,
                    spatial,
                    k,
                    1.0,
                    &weight[g * m * k..][..m * k],
                    &self.col_buffer[g * k * spatial..][..k * spatial],
                    0.0,
                    &mut output[g * m * spatial..][..m * spatial],
                );
            }
            if let Some(bias) = bias {
                for (row, &b) in output.chunks_mut(spatial).zip(bias) {
                    row.iter_mut().for_each(|v| *v += b);
                }
            }
        }
        Ok(())
    }

    fn backward(
        &mut self,
        top: &[&Blob],
        propagate_down: &[bool],
        bottom: &mut [Blob],
    ) -> LayerResult<()> {
        check_backward_counts(self, top.len(), propagate_down.len(), bottom.len())?;
        let geometry = self.geometry()?;
        let (m, k) = self.group_dims(&geometry);
        let spatial = geometry.out_spatial();
        let (image_len, offset_len) = (geometry.image_len(), geometry.offset_len());
        let top_len = self.config.num_output * spatial;
        self.check_blobs(&geometry, &bottom[0], &bottom[1], top[0])?;
        let top_diff = top[0].diff();

        let (data, offset) = bottom.split_at_mut(1);
        let (data, offset) = (&mut data[0], &mut offset[0]);
        let (weight_param, mut bias_param) = match self.params.split_first_mut() {
            Some((weight, rest)) => (weight, rest.first_mut()),
            None => return Err(LayerError::config("DeformableConvolution used before layer_setup")),
        };

        for n in 0..self.num {
            let diff = &top_diff[n * top_len..][..top_len];
            if let Some(bias) = bias_param.as_deref_mut() {
                for (b, row) in bias.blob.diff_mut().iter_mut().zip(diff.chunks(spatial)) {
                    *b += row.iter().sum::<f32>();
                }
            }

            let image = &data.data()[n * image_len..][..image_len];
            let offset_n = &offset.data()[n * offset_len..][..offset_len];
            deformable_im2col(image, offset_n, &geometry, &mut self.col_buffer)?;

            let (weight, weight_diff) = weight_param.blob.data_and_diff_mut();
            for g in 0..self.config.group {
                let diff_g = &diff[g * m * spatial..][..m * spatial];
                gemm(
                    Transpose::No,
                    Transpose::Yes,
                    m,
                    k,
                    spatial,
                    1.0,
                    diff_g,
                    &self.col_buffer[g * k * spatial..][..k * spatial],
                    1.0,
                    &mut weight_diff[g * m * k..][..m * k],
                );
                gemm(
                    Transpose::Yes,
                    Transpose::No,
                    k,
                    spatial,
                    m,
                    1.0,
                    &weight[g * m * k..][..m * k],
                    diff_g,
                    0.0,
                    &mut self.col_diff[g * k * spatial..][..k * spatial],
                );
            }

            if propagate_down[1] {
                let (offset_data, offset_diff) = offset.data_and_diff_mut();
                deformable_col2im_coord(
                    &self.col_diff,
                    &data.data()[n * image_len..][..image_len],
                    &offset_data[n * offset_len..][..offset_len],
                    &geometry,
                    &mut offset_diff[n * offset_len..][..offset_len],
                )?;
            }
            if propagate_down[0] {
                let grad = &mut data.diff_mut()[n * image_len..][..image_len];
                grad.fill(0.0);
                deformable_col2im(
                    &self.col_diff,
                    &offset.data()[n * offset_len..][..offset_len],
                    &geometry,
                    grad,
                )?;
            }
        }
        Ok(())
    }

    fn params(&self) -> &[LayerParam] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [LayerParam] {
        &mut self.params
    }
}
