//! # Fixed Scale
//!
//! Multiplies the input by a frozen scale, broadcast along `num_axes` axes
//! starting at `axis`, and optionally adds a frozen bias of the same shape.
//! With `num_axes == 0` the scale is a single scalar.

use burn::prelude::*;
use log::{debug, info};
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use rfcn_ops::Blob;

use crate::{
    error::{LayerError, LayerResult},
    filler::FillerConfig,
    layer::{
        check_backward_counts, check_blob_counts, check_num_bottoms, check_shape, InPlaceLayer,
        Layer, LayerParam,
    },
};

/// Configuration for [`ScaleFixed`].
#[derive(Config, Debug)]
pub struct ScaleFixedConfig {
    /// First input axis covered by the scale; negative values count from the end.
    #[config(default = "1")]
    pub axis: i32,
    /// Number of axes covered by the scale, `-1` for all remaining axes.
    #[config(default = "1")]
    pub num_axes: i32,
    #[config(default = "false")]
    pub bias_term: bool,
    #[config(default = "FillerConfig::constant(1.0)")]
    pub filler: FillerConfig,
    #[config(default = "FillerConfig::constant(0.0)")]
    pub bias_filler: FillerConfig,
    #[config(default = "0")]
    pub seed: u64,
}

impl ScaleFixedConfig {
    pub fn validate(&self) -> LayerResult<()> {
        if self.num_axes < -1 {
            return Err(LayerError::config(format!(
                "num_axes must be -1 or non-negative, got {}",
                self.num_axes
            )));
        }
        self.filler.validate()?;
        self.bias_filler.validate()
    }

    pub fn init(&self) -> LayerResult<ScaleFixed> {
        self.validate()?;
        Ok(ScaleFixed {
            config: self.clone(),
            params: Vec::new(),
            outer_dim: 0,
            scale_dim: 0,
            inner_dim: 0,
        })
    }
}

/// Resolves a possibly negative axis against a rank.
fn canonical_axis(axis: i32, rank: usize) -> LayerResult<usize> {
    let resolved = if axis < 0 { rank as i64 + axis as i64 } else { axis as i64 };
    if (0..rank as i64).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(LayerError::config(format!("axis {axis} out of range for a {rank}-D input")))
    }
}

/// `values[o][d][i] = values[o][d][i] * scale[d] + shift[d]` over an
/// `(outer, scale.len(), inner)` layout.
pub(crate) fn apply_channel_affine(values: &mut [f32], inner: usize, scale: &[f32], shift: Option<&[f32]>) {
    if inner == 0 || scale.is_empty() {
        return;
    }
    values
        .par_chunks_mut(inner)
        .enumerate()
        .for_each(|(row, chunk)| {
            let d = row % scale.len();
            let offset = shift.map_or(0.0, |shift| shift[d]);
            chunk.iter_mut().for_each(|v| *v = *v * scale[d] + offset);
        });
}

#[derive(Debug)]
pub struct ScaleFixed {
    config: ScaleFixedConfig,
    params: Vec<LayerParam>,
    outer_dim: usize,
    scale_dim: usize,
    inner_dim: usize,
}

impl ScaleFixed {
    fn scale(&self) -> LayerResult<&[f32]> {
        self.params
            .first()
            .map(|param| param.blob.data())
            .ok_or_else(|| LayerError::config("ScaleFixed used before layer_setup"))
    }

    fn bias(&self) -> Option<&[f32]> {
        self.params.get(1).map(|param| param.blob.data())
    }

    /// Shape of the scale blob for an input of shape `dims`.
    fn scale_shape(&self, dims: &[usize]) -> LayerResult<Vec<usize>> {
        if self.config.num_axes == 0 {
            return Ok(Vec::new());
        }
        let axis = canonical_axis(self.config.axis, dims.len())?;
        let end = if self.config.num_axes < 0 {
            dims.len()
        } else {
            axis + self.config.num_axes as usize
        };
        if end > dims.len() {
            return Err(LayerError::shape(
                format!("at least {end} axes for scale at axis {axis}"),
                dims,
            ));
        }
        Ok(dims[axis..end].to_vec())
    }
}

impl Layer for ScaleFixed {
    fn layer_type(&self) -> &'static str {
        "ScaleFixed"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        1
    }

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    fn layer_setup(&mut self, bottom: &[&[usize]]) -> LayerResult<()> {
        check_num_bottoms(self, bottom)?;
        let shape = self.scale_shape(bottom[0])?;
        if !self.params.is_empty() {
            info!("ScaleFixed: skipping parameter initialization");
            return Ok(());
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut scale = Blob::new(shape.clone());
        self.config.filler.fill(&mut scale, &mut rng)?;
        self.params.push(LayerParam::frozen(scale));
        if self.config.bias_term {
            let mut bias = Blob::new(shape);
            self.config.bias_filler.fill(&mut bias, &mut rng)?;
            self.params.push(LayerParam::frozen(bias));
        }
        debug!("ScaleFixed: created frozen scale {:?}", self.params[0].blob.dims());
        Ok(())
    }

    fn reshape(&mut self, bottom: &[&[usize]]) -> LayerResult<Vec<Vec<usize>>> {
        check_num_bottoms(self, bottom)?;
        let dims = bottom[0];
        let expected = self.scale_shape(dims)?;
        let scale = self.params.first().map(|param| param.blob.dims().to_vec());
        let scale = scale.ok_or_else(|| LayerError::config("ScaleFixed used before layer_setup"))?;
        if scale != expected {
            return Err(LayerError::shape(format!("input matching scale {scale:?}"), dims));
        }

        let axis = if scale.is_empty() {
            0
        } else {
            canonical_axis(self.config.axis, dims.len())?
        };
        self.outer_dim = dims[..axis].iter().product();
        self.scale_dim = scale.iter().product();
        self.inner_dim = dims[axis + scale.len()..].iter().product();
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

impl InPlaceLayer for ScaleFixed {
    fn forward_in_place(&mut self, blob: &mut Blob) -> LayerResult<()> {
        let expected = self.outer_dim * self.scale_dim * self.inner_dim;
        if blob.count() != expected {
            return Err(LayerError::shape(format!("{expected} elements"), blob.dims()));
        }
        apply_channel_affine(blob.data_mut(), self.inner_dim, self.scale()?, self.bias());
        Ok(())
    }

    fn backward_in_place(&mut self, blob: &mut Blob) -> LayerResult<()> {
        let expected = self.outer_dim * self.scale_dim * self.inner_dim;
        if blob.count() != expected {
            return Err(LayerError::shape(format!("{expected} elements"), blob.dims()));
        }
        apply_channel_affine(blob.diff_mut(), self.inner_dim, self.scale()?, None);
        Ok(())
    }
}
