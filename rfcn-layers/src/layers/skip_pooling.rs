//! Space-to-channel rearrangement with stride 2.
//!
//! Input channel `c` becomes output channels `4c..4c + 4`, holding the
//! elements at offsets `(0, 0)`, `(0, 1)`, `(1, 0)` and `(1, 1)` of every
//! 2x2 window. Positions past the input edge are zero.

use log::debug;
use rayon::prelude::*;
use rfcn_ops::Blob;

use crate::{
    error::LayerResult,
    layer::{
        check_backward_counts, check_blob_counts, check_num_bottoms, check_shape, shape4, Layer,
    },
};

const WINDOW: usize = 2;

#[derive(Debug, Default)]
pub struct SkipPooling {
    dims: [usize; 4],
    pooled: [usize; 2],
}

impl SkipPooling {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for SkipPooling {
    fn layer_type(&self) -> &'static str {
        "SkipPooling"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        1
    }

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    fn reshape(&mut self, bottom: &[&[usize]]) -> LayerResult<Vec<Vec<usize>>> {
        check_num_bottoms(self, bottom)?;
        self.dims = shape4(bottom[0], "input")?;
        let [num, channels, height, width] = self.dims;
        self.pooled = [height.div_ceil(WINDOW), width.div_ceil(WINDOW)];
        let top = vec![num, channels * WINDOW * WINDOW, self.pooled[0], self.pooled[1]];
        debug!("SkipPooling reshaped to {top:?}");
        Ok(vec![top])
    }

    fn forward(&mut self, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()> {
        check_blob_counts(self, bottom.len(), top.len())?;
        let [num, channels, height, width] = self.dims;
        let [pooled_h, pooled_w] = self.pooled;
        check_shape(bottom[0], &self.dims, "input")?;
        check_shape(&top[0], &[num, channels * WINDOW * WINDOW, pooled_h, pooled_w], "output")?;
        let plane = pooled_h * pooled_w;
        if plane == 0 {
            return Ok(());
        }

        top[0]
            .data_mut()
            .par_chunks_mut(WINDOW * WINDOW * plane)
            .zip(bottom[0].data().par_chunks(height * width))
            .for_each(|(out, input)| {
                out.fill(0.0);
                for ph in 0..pooled_h {
                    for pw in 0..pooled_w {
                        for (k, (dh, dw)) in [(0, 0), (0, 1), (1, 0), (1, 1)].into_iter().enumerate() {
                            let (h, w) = (ph * WINDOW + dh, pw * WINDOW + dw);
                            if h < height && w < width {
                                out[k * plane + ph * pooled_w + pw] = input[h * width + w];
                            }
                        }
                    }
                }
            });
        Ok(())
    }

    /// The rearrangement is treated as non-differentiable: the input
    /// gradient is zero.
    fn backward(
        &mut self,
        top: &[&Blob],
        propagate_down: &[bool],
        bottom: &mut [Blob],
    ) -> LayerResult<()> {
        check_backward_counts(self, top.len(), propagate_down.len(), bottom.len())?;
        if propagate_down[0] {
            check_shape(&bottom[0], &self.dims, "input")?;
            bottom[0].fill_diff(0.0);
        }
        Ok(())
    }
}
