//! # Layer Configuration
//!
//! [`LayerParameter`] names one layer and carries its configuration. It is
//! the JSON form of a layer: the `"type"` key selects the layer and the other
//! keys fill its configuration, with defaults for anything left out.
//!
//! ```json
//! { "type": "ROIAlign", "pooled_h": 7, "pooled_w": 7, "spatial_scale": 0.0625 }
//! ```

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{LayerError, LayerResult},
    layer::Layer,
    layers::{
        BatchNormFixedConfig, DeformableConvolutionConfig, PsRoiAlignConfig, PsRoiPoolingConfig,
        RoiAlignConfig, RpnAnnotatorOhemConfig, ScaleFixedConfig, SkipPooling, Upscale,
    },
};

/// Every layer this crate provides, with its configuration.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum LayerParameter {
    DeformableConvolution(DeformableConvolutionConfig),
    #[serde(rename = "ROIAlign")]
    RoiAlign(RoiAlignConfig),
    #[serde(rename = "PSROIPooling")]
    PsRoiPooling(PsRoiPoolingConfig),
    #[serde(rename = "PSROIAlign")]
    PsRoiAlign(PsRoiAlignConfig),
    BatchNormFixed(BatchNormFixedConfig),
    ScaleFixed(ScaleFixedConfig),
    SkipPooling,
    Upscale,
    #[serde(rename = "RpnAnnotatorOHEM")]
    RpnAnnotatorOhem(RpnAnnotatorOhemConfig),
}

impl LayerParameter {
    /// Parses a layer description from JSON.
    pub fn from_json(json: &str) -> LayerResult<Self> {
        let value = serde_json::from_str(json).map_err(invalid_json)?;
        Self::from_value(value)
    }

    /// Builds a layer description from a parsed JSON object. Keys left out
    /// take the configuration defaults.
    pub fn from_value(value: Value) -> LayerResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(LayerError::config("invalid layer JSON: expected an object"));
        };
        let layer_type = match fields.remove("type") {
            Some(Value::String(name)) => name,
            Some(other) => {
                return Err(LayerError::config(format!(
                    "invalid layer JSON: `type` must be a string, got {other}"
                )))
            }
            None => return Err(LayerError::config("invalid layer JSON: missing field `type`")),
        };

        Ok(match layer_type.as_str() {
            "DeformableConvolution" => Self::DeformableConvolution(with_defaults(
                DeformableConvolutionConfig::new(0),
                fields,
                &["num_output"],
            )?),
            "ROIAlign" => Self::RoiAlign(with_defaults(
                RoiAlignConfig::new(0, 0),
                fields,
                &["pooled_h", "pooled_w"],
            )?),
            "PSROIPooling" => Self::PsRoiPooling(with_defaults(
                PsRoiPoolingConfig::new(0, 0),
                fields,
                &["output_dim", "group_size"],
            )?),
            "PSROIAlign" => Self::PsRoiAlign(with_defaults(
                PsRoiAlignConfig::new(0, 0),
                fields,
                &["output_dim", "group_size"],
            )?),
            "BatchNormFixed" => {
                Self::BatchNormFixed(with_defaults(BatchNormFixedConfig::new(), fields, &[])?)
            }
            "ScaleFixed" => Self::ScaleFixed(with_defaults(ScaleFixedConfig::new(), fields, &[])?),
            "SkipPooling" => Self::SkipPooling,
            "Upscale" => Self::Upscale,
            "RpnAnnotatorOHEM" => {
                Self::RpnAnnotatorOhem(with_defaults(RpnAnnotatorOhemConfig::new(), fields, &[])?)
            }
            other => {
                return Err(LayerError::config(format!(
                    "invalid layer JSON: unknown layer type `{other}`"
                )))
            }
        })
    }

    pub fn to_json(&self) -> LayerResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| LayerError::config(e.to_string()))
    }

    /// The registered type name of the described layer.
    pub fn layer_type(&self) -> &'static str {
        match self {
            Self::DeformableConvolution(_) => "DeformableConvolution",
            Self::RoiAlign(_) => "ROIAlign",
            Self::PsRoiPooling(_) => "PSROIPooling",
            Self::PsRoiAlign(_) => "PSROIAlign",
            Self::BatchNormFixed(_) => "BatchNormFixed",
            Self::ScaleFixed(_) => "ScaleFixed",
            Self::SkipPooling => "SkipPooling",
            Self::Upscale => "Upscale",
            Self::RpnAnnotatorOhem(_) => "RpnAnnotatorOHEM",
        }
    }

    /// Validates the configuration and creates the layer.
    pub fn build(&self) -> LayerResult<Box<dyn Layer>> {
        Ok(match self {
            Self::DeformableConvolution(config) => Box::new(config.init()?),
            Self::RoiAlign(config) => Box::new(config.init()?),
            Self::PsRoiPooling(config) => Box::new(config.init()?),
            Self::PsRoiAlign(config) => Box::new(config.init()?),
            Self::BatchNormFixed(config) => Box::new(config.init()?),
            Self::ScaleFixed(config) => Box::new(config.init()?),
            Self::SkipPooling => Box::new(SkipPooling::new()),
            Self::Upscale => Box::new(Upscale::new()),
            Self::RpnAnnotatorOhem(config) => Box::new(config.init()?),
        })
    }
}

impl<'de> Deserialize<'de> for LayerParameter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

fn invalid_json(e: serde_json::Error) -> LayerError {
    LayerError::config(format!("invalid layer JSON: {e}"))
}

/// Overlays `fields` on the serialized `defaults`, after checking that every
/// key in `required` is present.
fn with_defaults<C: Serialize + DeserializeOwned>(
    defaults: C,
    fields: Map<String, Value>,
    required: &[&str],
) -> LayerResult<C> {
    if let Some(missing) = required.iter().find(|key| !fields.contains_key(**key)) {
        return Err(LayerError::config(format!(
            "invalid layer JSON: missing field `{missing}`"
        )));
    }
    let mut merged = match serde_json::to_value(defaults).map_err(invalid_json)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    merged.extend(fields);
    serde_json::from_value(Value::Object(merged)).map_err(invalid_json)
}
