//! The layer implementations, one module per layer type.

mod batch_norm_fixed;
mod deformable_conv;
mod psroi_align;
mod psroi_pooling;
mod roi_align;
mod rpn_ohem;
mod scale_fixed;
mod skip_pooling;
mod upscale;

pub use batch_norm_fixed::{BatchNormFixed, BatchNormFixedConfig};
pub use deformable_conv::{DeformableConvolution, DeformableConvolutionConfig};
pub use psroi_align::{PsRoiAlign, PsRoiAlignConfig};
pub use psroi_pooling::{PsRoiPooling, PsRoiPoolingConfig};
pub use roi_align::{RoiAlign, RoiAlignConfig};
pub use rpn_ohem::{RpnAnnotatorOhem, RpnAnnotatorOhemConfig};
pub use scale_fixed::{ScaleFixed, ScaleFixedConfig};
pub use skip_pooling::SkipPooling;
pub use upscale::Upscale;
