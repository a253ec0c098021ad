//! Central-difference gradient checking for layer tests.
//!
//! The objective is `sum(top * r)` for a fixed random `r` per top element, so
//! the analytic gradient is what `backward` produces when every top diff is
//! set to `r`.

use rand::{rngs::StdRng, Rng, SeedableRng};
use rfcn_ops::Blob;

use crate::layer::{setup, Layer};

pub struct GradientChecker {
    step: f32,
    threshold: f32,
    seed: u64,
}

impl Default for GradientChecker {
    fn default() -> Self {
        Self::new(1e-2, 1e-2)
    }
}

impl GradientChecker {
    pub fn new(step: f32, threshold: f32) -> Self {
        Self {
            step,
            threshold,
            seed: 1701,
        }
    }

    fn forward_objective(layer: &mut dyn Layer, bottom: &[Blob], top: &mut [Blob], weights: &[Vec<f32>]) -> f64 {
        let refs: Vec<&Blob> = bottom.iter().collect();
        layer.forward(&refs, top).unwrap();
        top.iter()
            .zip(weights)
            .flat_map(|(blob, w)| blob.data().iter().zip(w))
            .map(|(&v, &r)| v as f64 * r as f64)
            .sum()
    }

    fn assert_close(&self, what: &str, analytic: f32, numeric: f64) {
        let analytic = analytic as f64;
        let scale = analytic.abs().max(numeric.abs()).max(1.0);
        assert!(
            (analytic - numeric).abs() <= self.threshold as f64 * scale,
            "{what}: analytic {analytic}, numeric {numeric}"
        );
    }

    /// Checks the gradients of the bottoms listed in `checked` and of every
    /// trainable parameter.
    pub fn check(&self, layer: &mut dyn Layer, bottom: &mut [Blob], top: &mut [Blob], checked: &[usize]) {
        {
            let refs: Vec<&Blob> = bottom.iter().collect();
            setup(layer, &refs, top).unwrap();
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let weights: Vec<Vec<f32>> = top
            .iter()
            .map(|blob| (0..blob.count()).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();

        Self::forward_objective(layer, bottom, top, &weights);
        for (blob, w) in top.iter_mut().zip(&weights) {
            blob.diff_mut().copy_from_slice(w);
        }
        for blob in bottom.iter_mut() {
            blob.fill_diff(0.0);
        }
        for param in layer.params_mut() {
            param.blob.fill_diff(0.0);
        }
        let propagate: Vec<bool> = (0..bottom.len()).map(|i| checked.contains(&i)).collect();
        {
            let top_refs: Vec<&Blob> = top.iter().collect();
            layer.backward(&top_refs, &propagate, bottom).unwrap();
        }

        let analytic_bottom: Vec<Vec<f32>> = bottom.iter().map(|blob| blob.diff().to_vec()).collect();
        let analytic_params: Vec<Option<Vec<f32>>> = layer
            .params()
            .iter()
            .map(|param| param.trainable.then(|| param.blob.diff().to_vec()))
            .collect();

        let step = self.step;
        for &b in checked {
            for i in 0..bottom[b].count() {
                let original = bottom[b].data()[i];
                bottom[b].data_mut()[i] = original + step;
                let plus = Self::forward_objective(layer, bottom, top, &weights);
                bottom[b].data_mut()[i] = original - step;
                let minus = Self::forward_objective(layer, bottom, top, &weights);
                bottom[b].data_mut()[i] = original;

                let numeric = (plus - minus) / (2.0 * step as f64);
                self.assert_close(&format!("bottom {b}[{i}]"), analytic_bottom[b][i], numeric);
            }
        }

        for (p, analytic) in analytic_params.iter().enumerate() {
            let Some(analytic) = analytic else { continue };
            for (i, &grad) in analytic.iter().enumerate() {
                let original = layer.params()[p].blob.data()[i];
                layer.params_mut()[p].blob.data_mut()[i] = original + step;
                let plus = Self::forward_objective(layer, bottom, top, &weights);
                layer.params_mut()[p].blob.data_mut()[i] = original - step;
                let minus = Self::forward_objective(layer, bottom, top, &weights);
                layer.params_mut()[p].blob.data_mut()[i] = original;

                let numeric = (plus - minus) / (2.0 * step as f64);
                self.assert_close(&format!("param {p}[{i}]"), grad, numeric);
            }
        }
    }
}

/// Deterministic pseudo-random values in `[low, high)`.
pub fn random_values(len: usize, low: f32, high: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(low..high)).collect()
}
