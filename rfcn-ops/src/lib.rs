//! Region and deformable sampling kernels for the Burn deep learning framework
//!
//! This crate provides the numeric cores behind R-FCN style detectors that are
//! not available in the core Burn framework: deformable im2col and its two
//! gradients, ROI Align, and position-sensitive ROI pooling and align. Kernels
//! operate on host `f32` buffers and are parallelised with rayon; the
//! [`RoiTensorOps`] trait exposes the forward passes directly on Burn tensors.

mod blob;
pub mod deformable_im2col;
mod error;
pub mod geometry;
pub mod math;
pub mod psroi_align;
pub mod psroi_pooling;
pub mod roi_align;
mod tensor_ops;

// Convenient re-exports
pub use blob::Blob;
pub use deformable_im2col::{
    deformable_col2im, deformable_col2im_coord, deformable_im2col, DeformableGeometry,
};
pub use error::{KernelError, KernelResult};
pub use geometry::{SamplePoint, ROI_RECORD_LEN};
pub use psroi_align::{psroi_align_backward, psroi_align_forward, PsRoiAlignParams};
pub use psroi_pooling::{psroi_pool_backward, psroi_pool_forward, PsRoiPoolParams};
pub use roi_align::{roi_align_backward, roi_align_forward, RoiAlignParams};
pub use tensor_ops::RoiTensorOps;
