//! # R-FCN Layers
//!
//! Layer wrappers for region-based detection networks: deformable
//! convolution, ROI Align, position-sensitive ROI pooling and alignment,
//! frozen batch normalization and scale, skip pooling, nearest upscaling and
//! online hard example mining for the region proposal network.
//!
//! Layers run on [`rfcn_ops::Blob`] buffers with explicit forward and backward
//! passes. Use [`setup`] once per layer, then call [`Layer::forward`] and
//! [`Layer::backward`].
//!
//! ```
//! use rfcn_layers::{setup, Blob, Layer, LayerParameter};
//!
//! let param = LayerParameter::from_json(r#"{ "type": "Upscale" }"#).unwrap();
//! let mut layer = param.build().unwrap();
//! let input = Blob::from_vec([1, 1, 1, 2], vec![1.0, 2.0]).unwrap();
//! let reference = Blob::new([1, 1, 2, 4]);
//! let mut top = vec![Blob::default()];
//! setup(layer.as_mut(), &[&input, &reference], &mut top).unwrap();
//! layer.forward(&[&input, &reference], &mut top).unwrap();
//! assert_eq!(top[0].data(), &[1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
//! ```

mod config;
mod error;
mod filler;
mod layer;
mod layers;

#[cfg(test)]
mod gradient_check;

pub use config::LayerParameter;
pub use error::{LayerError, LayerResult};
pub use filler::FillerConfig;
pub use layer::{check_blob_counts, reshape, setup, InPlaceLayer, Layer, LayerParam};
pub use layers::*;
pub use rfcn_ops::{Blob, KernelError};
