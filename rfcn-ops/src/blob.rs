//! # Host Blobs
//!
//! A `Blob` is a dense row-major `f32` buffer paired with a gradient buffer of
//! the same shape. Layers own the blobs they produce; reshaping keeps the
//! existing allocation whenever the element count allows it.

use burn::{prelude::*, tensor::TensorData};

use crate::error::{check_len, KernelError, KernelResult};

/// Dense buffer with a `data` view and a separately addressable `diff` view.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    shape: Shape,
    data: Vec<f32>,
    diff: Vec<f32>,
}

impl Default for Blob {
    fn default() -> Self {
        Self::new(vec![0])
    }
}

impl Blob {
    /// Creates a zero-filled blob of the given shape.
    pub fn new<S: Into<Vec<usize>>>(dims: S) -> Self {
        let shape = Shape::from(dims.into());
        let count = shape.num_elements();
        Self {
            shape,
            data: vec![0.0; count],
            diff: vec![0.0; count],
        }
    }

    /// Creates a blob from existing values. The gradient starts at zero.
    pub fn from_vec<S: Into<Vec<usize>>>(dims: S, data: Vec<f32>) -> KernelResult<Self> {
        let shape = Shape::from(dims.into());
        check_len("data", data.len(), shape.num_elements())?;
        let diff = vec![0.0; data.len()];
        Ok(Self { shape, data, diff })
    }

    /// Copies the values of a Burn tensor into a new blob.
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> KernelResult<Self> {
        let dims = tensor.dims().to_vec();
        let data = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| KernelError::TensorConversion {
                reason: format!("{e:?}"),
            })?;
        Self::from_vec(dims, data)
    }

    /// Builds a tensor from the `data` view.
    pub fn to_tensor<B: Backend, const D: usize>(
        &self,
        device: &B::Device,
    ) -> KernelResult<Tensor<B, D>> {
        self.values_to_tensor(&self.data, device)
    }

    /// Builds a tensor from the `diff` view.
    pub fn diff_to_tensor<B: Backend, const D: usize>(
        &self,
        device: &B::Device,
    ) -> KernelResult<Tensor<B, D>> {
        self.values_to_tensor(&self.diff, device)
    }

    fn values_to_tensor<B: Backend, const D: usize>(
        &self,
        values: &[f32],
        device: &B::Device,
    ) -> KernelResult<Tensor<B, D>> {
        if self.num_axes() != D {
            return Err(KernelError::TensorConversion {
                reason: format!("blob has {} axes, tensor rank is {D}", self.num_axes()),
            });
        }
        let data = TensorData::new(values.to_vec(), self.shape.dims.clone());
        Ok(Tensor::from_data(data, device))
    }

    /// Changes the shape, growing or shrinking both views in place.
    ///
    /// Existing values are kept up to the new element count; new elements are zero.
    pub fn reshape<S: Into<Vec<usize>>>(&mut self, dims: S) {
        self.shape = Shape::from(dims.into());
        let count = self.shape.num_elements();
        self.data.resize(count, 0.0);
        self.diff.resize(count, 0.0);
    }

    pub fn dims(&self) -> &[usize] {
        &self.shape.dims
    }

    pub fn num_axes(&self) -> usize {
        self.shape.dims.len()
    }

    /// Total number of elements.
    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// Size of axis `axis`, or 1 when the blob has fewer axes.
    pub fn dim(&self, axis: usize) -> usize {
        self.shape.dims.get(axis).copied().unwrap_or(1)
    }

    pub fn num(&self) -> usize {
        self.dim(0)
    }

    pub fn channels(&self) -> usize {
        self.dim(1)
    }

    pub fn height(&self) -> usize {
        self.dim(2)
    }

    pub fn width(&self) -> usize {
        self.dim(3)
    }

    /// Linear offset of a (possibly partial) leading index.
    ///
    /// Missing trailing indices are treated as zero, so `offset(&[n])` is the
    /// start of item `n` and `offset(&[n, c])` the start of its channel `c`.
    pub fn offset(&self, index: &[usize]) -> usize {
        debug_assert!(index.len() <= self.num_axes(), "too many indices");
        let mut offset = 0;
        for (axis, &size) in self.shape.dims.iter().enumerate() {
            let i = index.get(axis).copied().unwrap_or(0);
            debug_assert!(i < size.max(1), "index {i} out of bounds for axis {axis}");
            offset = offset * size + i;
        }
        offset
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn diff(&self) -> &[f32] {
        &self.diff
    }

    pub fn diff_mut(&mut self) -> &mut [f32] {
        &mut self.diff
    }

    /// Both views at once, `data` read-only.
    pub fn data_and_diff_mut(&mut self) -> (&[f32], &mut [f32]) {
        (&self.data, &mut self.diff)
    }

    pub fn data_at(&self, index: &[usize]) -> f32 {
        self.data[self.offset(index)]
    }

    pub fn fill_data(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn fill_diff(&mut self, value: f32) {
        self.diff.fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    type TestBackend = NdArray;

    #[test]
    fn offset_follows_row_major_order() {
        let blob = Blob::new([2, 3, 4, 5]);
        assert_eq!(blob.count(), 120);
        assert_eq!(blob.offset(&[1]), 60);
        assert_eq!(blob.offset(&[1, 2]), 100);
        assert_eq!(blob.offset(&[1, 2, 3, 4]), 119);
        assert_eq!(blob.offset(&[0, 1, 0, 2]), 22);
    }

    #[test]
    fn legacy_accessors_default_to_one() {
        let blob = Blob::new([7, 5]);
        assert_eq!(blob.num(), 7);
        assert_eq!(blob.channels(), 5);
        assert_eq!(blob.height(), 1);
        assert_eq!(blob.width(), 1);
    }

    #[test]
    fn reshape_keeps_existing_values() {
        let mut blob = Blob::from_vec([2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        blob.reshape([4]);
        assert_eq!(blob.data(), &[1.0, 2.0, 3.0, 4.0]);
        blob.reshape([2, 3]);
        assert_eq!(blob.data(), &[1.0, 2.0, 3.0, 4.0, 0.0, 0.0]);
        assert_eq!(blob.diff().len(), 6);
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Blob::from_vec([2, 2], vec![1.0; 3]).unwrap_err();
        assert_eq!(
            err,
            KernelError::BufferLength {
                name: "data",
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn tensor_round_trip_preserves_layout() {
        let device = NdArrayDevice::default();
        let tensor =
            Tensor::<TestBackend, 4>::from_data([[[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]]], &device);
        let mut blob = Blob::from_tensor(tensor).unwrap();
        assert_eq!(blob.dims(), &[1, 1, 2, 3]);
        assert_eq!(blob.data_at(&[0, 0, 1, 0]), 4.0);

        blob.fill_diff(0.5);
        let diff = blob.diff_to_tensor::<TestBackend, 4>(&device).unwrap();
        assert_eq!(diff.dims(), [1, 1, 2, 3]);
        assert_eq!(diff.sum().into_scalar(), 3.0);
    }

    #[test]
    fn to_tensor_rejects_rank_mismatch() {
        let device = NdArrayDevice::default();
        let blob = Blob::new([2, 3]);
        assert!(blob.to_tensor::<TestBackend, 4>(&device).is_err());
    }
}
