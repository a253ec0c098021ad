//! # Layer Contract
//!
//! Every layer follows the same life cycle: `layer_setup` once with the
//! bottom shapes, `reshape` whenever those shapes may have changed, then any
//! number of `forward` / `backward` calls. Layers own their learnable
//! parameters and any auxiliary buffers the backward pass needs.

use rfcn_ops::Blob;

use crate::error::{LayerError, LayerResult};

/// A learnable or frozen parameter blob.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerParam {
    pub blob: Blob,
    /// Whether an optimizer may update this parameter.
    pub trainable: bool,
}

impl LayerParam {
    pub fn trainable(blob: Blob) -> Self {
        Self {
            blob,
            trainable: true,
        }
    }

    pub fn frozen(blob: Blob) -> Self {
        Self {
            blob,
            trainable: false,
        }
    }
}

/// A differentiable operator with explicit forward and backward passes.
pub trait Layer: Send {
    /// The registered type name, e.g. `"ROIAlign"`.
    fn layer_type(&self) -> &'static str;

    fn exact_num_bottom_blobs(&self) -> usize;

    fn exact_num_top_blobs(&self) -> usize;

    /// One-time, shape-aware initialization such as creating parameters.
    fn layer_setup(&mut self, _bottom: &[&[usize]]) -> LayerResult<()> {
        Ok(())
    }

    /// Validates the bottom shapes and returns the shape of every top blob.
    fn reshape(&mut self, bottom: &[&[usize]]) -> LayerResult<Vec<Vec<usize>>>;

    fn forward(&mut self, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()>;

    /// Writes the gradients of the bottoms flagged in `propagate_down`, and
    /// accumulates parameter gradients into the parameter diffs.
    fn backward(
        &mut self,
        top: &[&Blob],
        propagate_down: &[bool],
        bottom: &mut [Blob],
    ) -> LayerResult<()>;

    fn params(&self) -> &[LayerParam] {
        &[]
    }

    fn params_mut(&mut self) -> &mut [LayerParam] {
        &mut []
    }
}

/// Layers that may run with their single top aliasing their single bottom.
pub trait InPlaceLayer: Layer {
    /// Replaces the values of `blob` with the layer output.
    fn forward_in_place(&mut self, blob: &mut Blob) -> LayerResult<()>;

    /// Replaces the gradient held in `blob` with the gradient of the input.
    fn backward_in_place(&mut self, blob: &mut Blob) -> LayerResult<()>;
}

fn check_count(layer: &'static str, role: &'static str, expected: usize, actual: usize) -> LayerResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(LayerError::WrongBlobCount {
            layer,
            role,
            expected,
            actual,
        })
    }
}

/// Checks the blob counts of a call against the layer's exact counts.
pub fn check_blob_counts<L: Layer + ?Sized>(layer: &L, bottoms: usize, tops: usize) -> LayerResult<()> {
    check_count(layer.layer_type(), "bottom", layer.exact_num_bottom_blobs(), bottoms)?;
    check_count(layer.layer_type(), "top", layer.exact_num_top_blobs(), tops)
}

/// Checks the number of bottom shapes handed to `layer_setup` or `reshape`.
pub(crate) fn check_num_bottoms<L: Layer + ?Sized>(layer: &L, bottoms: &[&[usize]]) -> LayerResult<()> {
    check_count(layer.layer_type(), "bottom", layer.exact_num_bottom_blobs(), bottoms.len())
}

/// Checks that `blob` still has the shape the layer was reshaped to.
pub(crate) fn check_shape(blob: &Blob, expected: &[usize], what: &str) -> LayerResult<()> {
    if blob.dims() == expected {
        Ok(())
    } else {
        Err(LayerError::shape(format!("{what} of shape {expected:?}"), blob.dims()))
    }
}

/// Runs `layer_setup` followed by [`reshape`].
pub fn setup<L: Layer + ?Sized>(layer: &mut L, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()> {
    let shapes: Vec<&[usize]> = bottom.iter().map(|blob| blob.dims()).collect();
    check_blob_counts(layer, shapes.len(), top.len())?;
    layer.layer_setup(&shapes)?;
    reshape(layer, bottom, top)
}

/// Reshapes the layer to `bottom` and resizes every top blob to match.
pub fn reshape<L: Layer + ?Sized>(layer: &mut L, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()> {
    let shapes: Vec<&[usize]> = bottom.iter().map(|blob| blob.dims()).collect();
    check_blob_counts(layer, shapes.len(), top.len())?;
    let top_shapes = layer.reshape(&shapes)?;
    for (blob, shape) in top.iter_mut().zip(top_shapes) {
        blob.reshape(shape);
    }
    Ok(())
}

/// Interprets a shape as `[num, channels, height, width]`.
pub(crate) fn shape4(dims: &[usize], what: &str) -> LayerResult<[usize; 4]> {
    <[usize; 4]>::try_from(dims).map_err(|_| LayerError::shape(format!("4-D {what}"), dims))
}

/// Number of ROI records in an ROI blob of shape `(R, 5, ...)`.
pub(crate) fn roi_records(dims: &[usize]) -> LayerResult<usize> {
    let per_record: usize = dims.iter().skip(1).product();
    match dims.first() {
        Some(&count) if per_record == rfcn_ops::ROI_RECORD_LEN => Ok(count),
        _ => Err(LayerError::shape("ROI blob of shape (R, 5)", dims)),
    }
}

/// Checks the blob counts of a backward call.
pub(crate) fn check_backward_counts<L: Layer + ?Sized>(
    layer: &L,
    tops: usize,
    propagate_down: usize,
    bottoms: usize,
) -> LayerResult<()> {
    check_blob_counts(layer, bottoms, tops)?;
    check_count(layer.layer_type(), "propagate_down", layer.exact_num_bottom_blobs(), propagate_down)
}
