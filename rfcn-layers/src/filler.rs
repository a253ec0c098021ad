//! Initial values for parameter blobs.

use rand::{rngs::StdRng, Rng};
use rand_distr::{Distribution, Normal};
use rfcn_ops::Blob;
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};

/// How a parameter blob is filled when a layer creates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FillerConfig {
    Constant {
        #[serde(default)]
        value: f32,
    },
    Gaussian {
        #[serde(default)]
        mean: f32,
        std: f32,
    },
    Uniform {
        min: f32,
        max: f32,
    },
    /// Uniform in `[-sqrt(3 / fan_in), sqrt(3 / fan_in)]`, with `fan_in` the
    /// number of elements per output unit.
    Xavier,
}

impl FillerConfig {
    pub const fn constant(value: f32) -> Self {
        Self::Constant { value }
    }

    pub fn validate(&self) -> LayerResult<()> {
        match *self {
            Self::Gaussian { std, .. } if std.is_nan() || std < 0.0 => Err(LayerError::config(format!(
                "Gaussian filler std must be non-negative, got {std}"
            ))),
            Self::Uniform { min, max } if min.is_nan() || max.is_nan() || min > max => Err(LayerError::config(format!(
                "Uniform filler needs min <= max, got [{min}, {max}]"
            ))),
            _ => Ok(()),
        }
    }

    /// Overwrites the values of `blob`.
    pub fn fill(&self, blob: &mut Blob, rng: &mut StdRng) -> LayerResult<()> {
        match *self {
            Self::Constant { value } => blob.fill_data(value),
            Self::Gaussian { mean, std } => {
                let normal = Normal::new(mean, std).map_err(|e| LayerError::config(e.to_string()))?;
                blob.data_mut().iter_mut().for_each(|v| *v = normal.sample(rng));
            }
            Self::Uniform { min, max } => {
                self.validate()?;
                blob.data_mut()
                    .iter_mut()
                    .for_each(|v| *v = rng.gen_range(min..=max));
            }
            Self::Xavier => {
                let fan_in = blob.count() / blob.num().max(1);
                let scale = (3.0 / fan_in.max(1) as f32).sqrt();
                blob.data_mut()
                    .iter_mut()
                    .for_each(|v| *v = rng.gen_range(-scale..=scale));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn constant_fills_every_value() {
        let mut blob = Blob::new([2, 3]);
        let mut rng = StdRng::seed_from_u64(0);
        FillerConfig::constant(1.5).fill(&mut blob, &mut rng).unwrap();
        assert!(blob.data().iter().all(|&v| v == 1.5));
    }

    #[test]
    fn seeded_gaussian_is_reproducible() {
        let filler = FillerConfig::Gaussian { mean: 0.0, std: 0.01 };
        let mut a = Blob::new([4, 4]);
        let mut b = Blob::new([4, 4]);
        filler.fill(&mut a, &mut StdRng::seed_from_u64(7)).unwrap();
        filler.fill(&mut b, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
        assert!(a.data().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn xavier_respects_fan_in_bound() {
        let mut blob = Blob::new([2, 3, 3, 3]);
        FillerConfig::Xavier
            .fill(&mut blob, &mut StdRng::seed_from_u64(1))
            .unwrap();
        let bound = (3.0f32 / 27.0).sqrt();
        assert!(blob.data().iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn parses_tagged_json() {
        let filler: FillerConfig = serde_json::from_str(r#"{"type": "gaussian", "std": 0.01}"#).unwrap();
        assert_eq!(filler, FillerConfig::Gaussian { mean: 0.0, std: 0.01 });
        assert!(FillerConfig::Uniform { min: 1.0, max: 0.0 }.validate().is_err());
    }
}
