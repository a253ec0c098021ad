//! Inference-only entry points on Burn tensors.
//!
//! The kernels run on host memory, so each call reads the tensor back from its
//! device, runs the kernel and uploads the result to the same device.

use burn::{prelude::*, tensor::TensorData};

use crate::{
    deformable_im2col::{deformable_im2col, DeformableGeometry},
    error::{KernelError, KernelResult},
    psroi_align::{psroi_align_forward, PsRoiAlignParams},
    psroi_pooling::{psroi_pool_forward, PsRoiPoolParams},
    roi_align::{roi_align_forward, RoiAlignParams},
    Blob,
};

/// ROI and deformable sampling operations on `[N, C, H, W]` feature maps.
pub trait RoiTensorOps<B: Backend> {
    /// ROI Align over `rois` of shape `[R, 5]`. Returns `[R, C, pooled_h, pooled_w]`.
    fn roi_align(self, rois: Tensor<B, 2>, params: &RoiAlignParams) -> KernelResult<Tensor<B, 4>>;

    /// Position-sensitive ROI pooling. Returns `[R, output_dim, group, group]`.
    fn psroi_pool(self, rois: Tensor<B, 2>, params: &PsRoiPoolParams) -> KernelResult<Tensor<B, 4>>;

    /// Position-sensitive ROI Align. Returns `[R, output_dim, group, group]`.
    fn psroi_align(self, rois: Tensor<B, 2>, params: &PsRoiAlignParams) -> KernelResult<Tensor<B, 4>>;

    /// Deformable im2col of every image. Returns `[N, C * kh * kw, out_h * out_w]`.
    fn deform_im2col(
        self,
        offset: Tensor<B, 4>,
        geometry: &DeformableGeometry,
    ) -> KernelResult<Tensor<B, 3>>;
}

fn feature_dims(blob: &Blob) -> KernelResult<[usize; 4]> {
    <[usize; 4]>::try_from(blob.dims()).map_err(|_| KernelError::InvalidGeometry {
        reason: format!("expected a 4-D feature map, got {:?}", blob.dims()),
    })
}

fn upload<B: Backend, const D: usize>(values: Vec<f32>, dims: [usize; D], device: &B::Device) -> Tensor<B, D> {
    Tensor::from_data(TensorData::new(values, dims), device)
}

impl<B: Backend> RoiTensorOps<B> for Tensor<B, 4> {
    fn roi_align(self, rois: Tensor<B, 2>, params: &RoiAlignParams) -> KernelResult<Tensor<B, 4>> {
        let device = self.device();
        let features = Blob::from_tensor(self)?;
        let rois = Blob::from_tensor(rois)?;
        let dims = feature_dims(&features)?;
        let num_rois = rois.num();

        let len = num_rois * dims[1] * params.bins();
        let mut output = vec![0.0; len];
        let mut argmax = vec![None; len];
        roi_align_forward(features.data(), dims, rois.data(), params, &mut output, &mut argmax)?;
        Ok(upload(output, [num_rois, dims[1], params.pooled_h, params.pooled_w], &device))
    }

    fn psroi_pool(self, rois: Tensor<B, 2>, params: &PsRoiPoolParams) -> KernelResult<Tensor<B, 4>> {
        let device = self.device();
        let features = Blob::from_tensor(self)?;
        let rois = Blob::from_tensor(rois)?;
        let dims = feature_dims(&features)?;
        let num_rois = rois.num();

        let len = num_rois * params.per_roi();
        let mut output = vec![0.0; len];
        let mut mapping = vec![0; len];
        psroi_pool_forward(features.data(), dims, rois.data(), params, &mut output, &mut mapping)?;
        let group = params.group_size;
        Ok(upload(output, [num_rois, params.output_dim, group, group], &device))
    }

    fn psroi_align(self, rois: Tensor<B, 2>, params: &PsRoiAlignParams) -> KernelResult<Tensor<B, 4>> {
        let device = self.device();
        let features = Blob::from_tensor(self)?;
        let rois = Blob::from_tensor(rois)?;
        let dims = feature_dims(&features)?;
        let num_rois = rois.num();

        let mut output = vec![0.0; num_rois * params.input_channels()];
        psroi_align_forward(features.data(), dims, rois.data(), params, &mut output)?;
        let group = params.group_size;
        Ok(upload(output, [num_rois, params.output_dim, group, group], &device))
    }

    fn deform_im2col(
        self,
        offset: Tensor<B, 4>,
        geometry: &DeformableGeometry,
    ) -> KernelResult<Tensor<B, 3>> {
        let device = self.device();
        let image = Blob::from_tensor(self)?;
        let offset = Blob::from_tensor(offset)?;
        let [num, channels, height, width] = feature_dims(&image)?;
        if [channels, height, width] != [geometry.channels, geometry.height, geometry.width] {
            return Err(KernelError::InvalidGeometry {
                reason: format!(
                    "input {:?} does not match geometry {}x{}x{}",
                    image.dims(),
                    geometry.channels,
                    geometry.height,
                    geometry.width
                ),
            });
        }
        let expected_offset = [num, geometry.offset_channels(), geometry.out_h, geometry.out_w];
        if offset.dims() != expected_offset {
            return Err(KernelError::InvalidGeometry {
                reason: format!("offset {:?}, expected {expected_offset:?}", offset.dims()),
            });
        }

        let (image_len, offset_len, col_len) =
            (geometry.image_len(), geometry.offset_len(), geometry.col_len());
        let mut columns = vec![0.0; num * col_len];
        for (n, col) in columns.chunks_mut(col_len).enumerate() {
            deformable_im2col(
                &image.data()[n * image_len..][..image_len],
                &offset.data()[n * offset_len..][..offset_len],
                geometry,
                col,
            )?;
        }
        Ok(upload(
            columns,
            [num, geometry.col_rows(), geometry.out_spatial()],
            &device,
        ))
    }
}
