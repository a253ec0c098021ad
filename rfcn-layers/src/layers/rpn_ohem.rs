//! # RPN Online Hard Example Mining
//!
//! Keeps the highest-loss anchors of a batch for training the region
//! proposal network. Anchors are ranked by loss over the whole batch; at most
//! `round(rpn_per_img * fg_fraction)` positives are kept, and negatives fill
//! the remaining budget including any positive quota left unused. Every other
//! anchor is relabelled with `ignore_label` and loses its box-regression
//! weights.

use burn::prelude::*;
use log::debug;
use rfcn_ops::Blob;

use crate::{
    error::{LayerError, LayerResult},
    layer::{
        check_backward_counts, check_blob_counts, check_num_bottoms, check_shape, shape4, Layer,
    },
};

const BOX_COORDS: usize = 4;

/// Configuration for [`RpnAnnotatorOhem`].
#[derive(Config, Debug)]
pub struct RpnAnnotatorOhemConfig {
    /// Anchors kept per forward pass.
    #[config(default = "256")]
    pub rpn_per_img: usize,
    /// Largest share of kept anchors that may be positive.
    #[config(default = "0.5")]
    pub fg_fraction: f32,
    #[config(default = "-1.0")]
    pub ignore_label: f32,
    #[config(default = "1.0")]
    pub positive_label: f32,
    #[config(default = "0.0")]
    pub negative_label: f32,
}

impl RpnAnnotatorOhemConfig {
    pub fn validate(&self) -> LayerResult<()> {
        if self.rpn_per_img == 0 {
            return Err(LayerError::config("rpn_per_img must be positive"));
        }
        if !(0.0..=1.0).contains(&self.fg_fraction) {
            return Err(LayerError::config(format!(
                "fg_fraction must lie in [0, 1], got {}",
                self.fg_fraction
            )));
        }
        Ok(())
    }

    pub fn init(&self) -> LayerResult<RpnAnnotatorOhem> {
        self.validate()?;
        Ok(RpnAnnotatorOhem {
            config: self.clone(),
            dims: [0; 4],
        })
    }
}

#[derive(Debug)]
pub struct RpnAnnotatorOhem {
    config: RpnAnnotatorOhemConfig,
    dims: [usize; 4],
}

impl RpnAnnotatorOhem {
    fn positive_quota(&self) -> usize {
        (self.config.rpn_per_img as f32 * self.config.fg_fraction + 0.5).floor() as usize
    }

    /// Copies label and box weights of every selected anchor of `class`,
    /// taking anchors in `order`. Returns the part of `quota` left unused.
    fn keep(
        &self,
        class: f32,
        mut quota: usize,
        order: &[usize],
        bottom: &[&Blob],
        top: &mut [Blob],
    ) -> usize {
        let labels = bottom[1].data();
        let weights = bottom[2].data();
        let [_, _, height, width] = self.dims;
        let spatial = height * width;
        for &index in order {
            if quota == 0 {
                break;
            }
            if labels[index] != class {
                continue;
            }
            quota -= 1;
            top[0].data_mut()[index] = labels[index];
            let (n, s) = (index / spatial, index % spatial);
            for j in 0..BOX_COORDS {
                let offset = (n * BOX_COORDS + j) * spatial + s;
                top[1].data_mut()[offset] = weights[offset];
            }
        }
        quota
    }
}

impl Layer for RpnAnnotatorOhem {
    fn layer_type(&self) -> &'static str {
        "RpnAnnotatorOHEM"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        3
    }

    fn exact_num_top_blobs(&self) -> usize {
        2
    }

    fn reshape(&mut self, bottom: &[&[usize]]) -> LayerResult<Vec<Vec<usize>>> {
        check_num_bottoms(self, bottom)?;
        let [num, channels, height, width] = shape4(bottom[0], "per-anchor loss")?;
        if channels != 1 {
            return Err(LayerError::shape("loss of shape (N, 1, H, W)", bottom[0]));
        }
        if bottom[1] != [num, 1, height, width].as_slice() {
            return Err(LayerError::shape(format!("labels of shape [{num}, 1, {height}, {width}]"), bottom[1]));
        }
        if bottom[2] != [num, BOX_COORDS, height, width].as_slice() {
            return Err(LayerError::shape(
                format!("box weights of shape [{num}, {BOX_COORDS}, {height}, {width}]"),
                bottom[2],
            ));
        }
        self.dims = [num, 1, height, width];
        Ok(vec![
            vec![num, 1, height, width],
            vec![num, BOX_COORDS, height, width],
        ])
    }

    fn forward(&mut self, bottom: &[&Blob], top: &mut [Blob]) -> LayerResult<()> {
        check_blob_counts(self, bottom.len(), top.len())?;
        let [num, _, height, width] = self.dims;
        let boxes = [num, BOX_COORDS, height, width];
        check_shape(bottom[0], &self.dims, "loss")?;
        check_shape(bottom[1], &self.dims, "labels")?;
        check_shape(bottom[2], &boxes, "box weights")?;
        check_shape(&top[0], &self.dims, "labels output")?;
        check_shape(&top[1], &boxes, "box weights output")?;
        top[0].fill_data(self.config.ignore_label);
        top[1].fill_data(0.0);

        let loss = bottom[0].data();
        let mut order: Vec<usize> = (0..loss.len()).collect();
        order.sort_by(|&a, &b| loss[b].total_cmp(&loss[a]));

        let positives = self.positive_quota();
        let unused = self.keep(self.config.positive_label, positives, &order, bottom, top);
        let negatives = self.config.rpn_per_img.saturating_sub(positives) + unused;
        let left = self.keep(self.config.negative_label, negatives, &order, bottom, top);
        debug!(
            "RpnAnnotatorOHEM kept {} positives and {} negatives",
            positives - unused,
            negatives - left
        );
        Ok(())
    }

    fn backward(
        &mut self,
        top: &[&Blob],
        propagate_down: &[bool],
        bottom: &mut [Blob],
    ) -> LayerResult<()> {
        check_backward_counts(self, top.len(), propagate_down.len(), bottom.len())?;
        if propagate_down.iter().any(|&p| p) {
            return Err(LayerError::NotImplemented {
                operation: "RpnAnnotatorOHEM backward".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::setup;

    fn scenario() -> Vec<Blob> {
        let loss = Blob::from_vec([5, 1, 1, 1], vec![0.3, 0.1, 0.5, 0.2, 0.4]).unwrap();
        let labels = Blob::from_vec([5, 1, 1, 1], vec![1.0, 0.0, -1.0, 1.0, 1.0]).unwrap();
        let mut weights = vec![0.0; 20];
        weights[..4].fill(1.0);
        weights[12..].fill(1.0);
        let weights = Blob::from_vec([5, 4, 1, 1], weights).unwrap();
        vec![loss, labels, weights]
    }

    fn run(config: RpnAnnotatorOhemConfig, bottom: &[Blob]) -> Vec<Blob> {
        let mut layer = config.init().unwrap();
        let refs: Vec<&Blob> = bottom.iter().collect();
        let mut top = vec![Blob::default(), Blob::default()];
        setup(&mut layer, &refs, &mut top).unwrap();
        layer.forward(&refs, &mut top).unwrap();
        top
    }

    #[test]
    fn keeps_hardest_examples() {
        let bottom = scenario();
        let top = run(RpnAnnotatorOhemConfig::new().with_rpn_per_img(2), &bottom);
        assert_eq!(top[0].dims(), bottom[1].dims());
        assert_eq!(top[1].dims(), bottom[2].dims());

        assert_eq!(top[0].data(), &[-1.0, 0.0, -1.0, -1.0, 1.0]);
        let mut expected = [0.0; 20];
        expected[16..].fill(1.0);
        assert_eq!(top[1].data(), &expected[..]);
    }

    #[test]
    fn unused_positive_quota_goes_to_negatives() {
        let mut bottom = scenario();
        bottom[1].data_mut().copy_from_slice(&[0.0, 0.0, 1.0, 0.0, 0.0]);
        let top = run(
            RpnAnnotatorOhemConfig::new().with_rpn_per_img(4).with_fg_fraction(0.75),
            &bottom,
        );
        // positive quota 3 finds one positive, so three negatives are kept
        assert_eq!(top[0].data(), &[0.0, -1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn ranking_spans_the_whole_batch() {
        let loss = Blob::from_vec([2, 1, 1, 2], vec![0.1, 0.2, 0.9, 0.8]).unwrap();
        let labels = Blob::from_vec([2, 1, 1, 2], vec![0.0; 4]).unwrap();
        let mut weights = Blob::new([2, 4, 1, 2]);
        weights.fill_data(1.0);
        let top = run(
            RpnAnnotatorOhemConfig::new().with_rpn_per_img(2).with_fg_fraction(0.0),
            &[loss, labels, weights],
        );
        assert_eq!(top[0].data(), &[-1.0, -1.0, 0.0, 0.0]);
        assert!(top[1].data()[..8].iter().all(|&w| w == 0.0));
        assert!(top[1].data()[8..].iter().all(|&w| w == 1.0));
    }

    #[test]
    fn equal_losses_keep_anchor_order() {
        let mut bottom = scenario();
        bottom[0].fill_data(1.0);
        let top = run(RpnAnnotatorOhemConfig::new().with_rpn_per_img(2), &bottom);
        assert_eq!(top[0].data(), &[1.0, 0.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn backward_is_not_implemented() {
        let mut bottom = scenario();
        let refs: Vec<&Blob> = bottom.iter().collect();
        let mut layer = RpnAnnotatorOhemConfig::new().init().unwrap();
        let mut top = vec![Blob::default(), Blob::default()];
        setup(&mut layer, &refs, &mut top).unwrap();

        let top_refs: Vec<&Blob> = top.iter().collect();
        assert!(layer.backward(&top_refs, &[false; 3], &mut bottom).is_ok());
        assert!(matches!(
            layer.backward(&top_refs, &[true, false, false], &mut bottom),
            Err(LayerError::NotImplemented { .. })
        ));
    }

    #[test]
    fn forward_rejects_inputs_that_were_not_reshaped() {
        let bottom = scenario();
        let refs: Vec<&Blob> = bottom.iter().collect();
        let mut layer = RpnAnnotatorOhemConfig::new().init().unwrap();
        let mut top = vec![Blob::default(), Blob::default()];
        setup(&mut layer, &refs, &mut top).unwrap();

        let labels = Blob::new([3, 1, 1, 1]);
        let err = layer.forward(&[refs[0], &labels, refs[2]], &mut top).unwrap_err();
        assert!(matches!(err, LayerError::InvalidTensorShape { .. }));
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let mut bottom = scenario();
        bottom[2] = Blob::new([5, 3, 1, 1]);
        let refs: Vec<&Blob> = bottom.iter().collect();
        let mut layer = RpnAnnotatorOhemConfig::new().init().unwrap();
        let mut top = vec![Blob::default(), Blob::default()];
        assert!(setup(&mut layer, &refs, &mut top).is_err());
        assert!(RpnAnnotatorOhemConfig::new().with_rpn_per_img(0).init().is_err());
    }
}
