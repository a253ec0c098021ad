//! Nearest-neighbour resize of the first input to the spatial size of the
//! second.

use log::debug;
use rayon::prelude::*;
use rfcn_ops::Blob;

use crate::{
    error::{LayerError, LayerResult},
    layer::{
        check_backward_counts, check_blob_counts, check_num_bottoms, check_shape, shape4, Layer,
    },
};

#[derive(Debug, Default)]
pub struct Upscale {
    input: [usize; 4],
    output: [usize; 2],
}

impl Upscale {
    pub fn new() -> Self {
        Self::default()
    }

    fn output_dims(&self) -> [usize; 4] {
        let [num, channels, _, _] = self.input;
        let [out_h, out_w] = self.output;
        [num, channels, out_h, out_w]
    }

    /// Source row and column of every output row and column.
    fn source_indices(&self) -> (Vec<usize>, Vec<usize>) {
        let [_, _, height, width] = self.input;
        let [out_h, out_w] = self.output;
        let rows = (0..out_h).map(|h| h * height / out_h).collect();
        let cols = (0..out_w).map(|w| w * width / out_w).collect();
        (rows, cols)
    }
}

impl Layer for Upscale {
    fn layer_type(&self) -> &'static str {
        "Upscale"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        2
    }

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    fn reshape(&mut self, bottom: &[&[usize]]) -> LayerResult<Vec<Vec<usize>>> {
        check_num_bottoms(self, bottom)?;
        self.input = shape4(bottom[0], "input")?;
        let [_, _, ref_h, ref_w] = shape4(bottom[1], "reference")?;
        let [num, channels, height, width] = self.input;
        if (height == 0 || width == 0) && ref_h * ref_w > 0 {
            return Err(LayerError::shape("non-empty spatial input", bottom[0]));
        }
        self.output = [ref_h, ref_w];
        let top = vec![num, channels, ref_h, ref_w];
        debug!("Upscale reshaped to {top:?}");
        Ok(vec![top])
    }

    fn forward(&mut self, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()> {
        check_blob_counts(self, bottom.len(), top.len())?;
        check_shape(bottom[0], &self.input, "input")?;
        check_shape(&top[0], &self.output_dims(), "output")?;
        let [_, _, height, width] = self.input;
        let [out_h, out_w] = self.output;
        if out_h * out_w == 0 {
            return Ok(());
        }
        let (rows, cols) = self.source_indices();

        top[0]
            .data_mut()
            .par_chunks_mut(out_h * out_w)
            .zip(bottom[0].data().par_chunks(height * width))
            .for_each(|(out, input)| {
                for (h, &bh) in rows.iter().enumerate() {
                    for (w, &bw) in cols.iter().enumerate() {
                        out[h * out_w + w] = input[bh * width + bw];
                    }
                }
            });
        Ok(())
    }

    /// Sums the gradient of every output cell into the input cell it was
    /// copied from. The reference input receives no gradient.
    fn backward(
        &mut self,
        top: &[&Blob],
        propagate_down: &[bool],
        bottom: &mut [Blob],
    ) -> LayerResult<()> {
        check_backward_counts(self, top.len(), propagate_down.len(), bottom.len())?;
        if propagate_down[1] {
            bottom[1].fill_diff(0.0);
        }
        if !propagate_down[0] {
            return Ok(());
        }
        check_shape(&bottom[0], &self.input, "input")?;
        check_shape(top[0], &self.output_dims(), "output")?;
        let [_, _, height, width] = self.input;
        let [out_h, out_w] = self.output;
        bottom[0].fill_diff(0.0);
        if out_h * out_w == 0 {
            return Ok(());
        }
        let (rows, cols) = self.source_indices();

        bottom[0]
            .diff_mut()
            .par_chunks_mut(height * width)
            .zip(top[0].diff().par_chunks(out_h * out_w))
            .for_each(|(grad, top_diff)| {
                for (h, &bh) in rows.iter().enumerate() {
                    for (w, &bw) in cols.iter().enumerate() {
                        grad[bh * width + bw] += top_diff[h * out_w + w];
                    }
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gradient_check::{random_values, GradientChecker},
        layer::setup,
    };

    fn upscaled() -> (Upscale, Vec<Blob>, Vec<Blob>) {
        let input = Blob::from_vec([2, 3, 2, 2], [1.0, 2.0, 3.0, 4.0].repeat(6)).unwrap();
        let reference = Blob::new([3, 4, 3, 4]);
        let mut layer = Upscale::new();
        let mut top = vec![Blob::default()];
        setup(&mut layer, &[&input, &reference], &mut top).unwrap();
        (layer, vec![input, reference], top)
    }

    #[test]
    fn repeats_nearest_cells() {
        let (mut layer, bottom, mut top) = upscaled();
        assert_eq!(top[0].dims(), &[2, 3, 3, 4]);
        layer.forward(&[&bottom[0], &bottom[1]], &mut top).unwrap();

        let expected = [1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0];
        for plane in top[0].data().chunks(12) {
            assert_eq!(plane, &expected[..]);
        }
    }

    #[test]
    fn backward_sums_into_source_cells() {
        let (mut layer, mut bottom, mut top) = upscaled();
        layer.forward(&[&bottom[0], &bottom[1]], &mut top).unwrap();
        let ramp: Vec<f32> = (1..=12).map(|v| v as f32).collect();
        top[0].diff_mut().copy_from_slice(&ramp.repeat(6));
        bottom[1].fill_diff(7.0);

        layer.backward(&[&top[0]], &[true, true], &mut bottom).unwrap();
        for plane in bottom[0].diff().chunks(4) {
            assert_eq!(plane, &[14.0, 22.0, 19.0, 23.0]);
        }
        assert!(bottom[1].diff().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut layer = Upscale::new();
        let mut bottom = vec![
            Blob::from_vec([1, 2, 3, 2], random_values(12, -1.0, 1.0, 8)).unwrap(),
            Blob::new([1, 1, 5, 7]),
        ];
        let mut top = vec![Blob::default()];
        GradientChecker::default().check(&mut layer, &mut bottom, &mut top, &[0]);
    }

    #[test]
    fn forward_rejects_input_that_was_not_reshaped() {
        let (mut layer, bottom, mut top) = upscaled();
        let larger = Blob::new([2, 3, 3, 3]);
        let err = layer.forward(&[&larger, &bottom[1]], &mut top).unwrap_err();
        assert!(matches!(err, LayerError::InvalidTensorShape { .. }));

        let mut stale_top = vec![Blob::new([2, 3, 2, 2])];
        let err = layer.forward(&[&bottom[0], &bottom[1]], &mut stale_top).unwrap_err();
        assert!(matches!(err, LayerError::InvalidTensorShape { .. }));
    }

    #[test]
    fn rejects_empty_input_with_nonempty_reference() {
        let input = Blob::new([1, 1, 0, 2]);
        let reference = Blob::new([1, 1, 2, 2]);
        let mut top = vec![Blob::default()];
        assert!(setup(&mut Upscale::new(), &[&input, &reference], &mut top).is_err());
    }
}
