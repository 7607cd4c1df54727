//! Wire types for NovelAI's generation endpoints.
//!
//! Each generation mode has its own parameter struct, so an inpaint payload
//! has no way to carry vibe or director reference fields.

use chrono::{DateTime, TimeZone};
use serde::Serialize;
use serde_json::{json, Value};

use crate::types::{GenerationMode, Position};

/// Base caption NovelAI expects on every director reference description.
pub(crate) const DIRECTOR_REFERENCE_CAPTION: &str = "character&style";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Caption {
    pub base_caption: String,
    pub char_captions: Vec<CharCaption>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharCaption {
    pub char_caption: String,
    /// Always a one-element list today; the service accepts several points.
    pub centers: Vec<Position>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct V4Prompt {
    pub caption: Caption,
    pub use_coords: bool,
    pub use_order: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct V4NegativePrompt {
    pub caption: Caption,
    pub legacy_uc: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacterPrompt {
    pub prompt: String,
    pub uc: String,
    pub center: Position,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectorDescription {
    pub caption: Caption,
    pub legacy_uc: bool,
}

impl Default for DirectorDescription {
    fn default() -> Self {
        Self {
            caption: Caption {
                base_caption: DIRECTOR_REFERENCE_CAPTION.to_string(),
                char_captions: Vec::new(),
            },
            legacy_uc: false,
        }
    }
}

/// Fields every mode sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharedParameters {
    pub params_version: u8,
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    pub sampler: String,
    pub steps: u32,
    pub n_samples: u32,
    pub seed: i64,
    #[serde(rename = "ucPreset")]
    pub uc_preset: u8,
    #[serde(rename = "qualityToggle")]
    pub quality_toggle: bool,
    pub dynamic_thresholding: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_cfg_above_sigma: Option<f64>,
    pub controlnet_strength: f64,
    pub legacy: bool,
    pub legacy_v3_extend: bool,
    pub cfg_rescale: f64,
    pub noise_schedule: String,
    pub use_coords: bool,
    pub negative_prompt: String,
    pub v4_prompt: V4Prompt,
    pub v4_negative_prompt: V4NegativePrompt,
    #[serde(rename = "characterPrompts")]
    pub character_prompts: Vec<CharacterPrompt>,
    pub deliberate_euler_ancestral_bug: bool,
    pub prefer_brownian: bool,
}

/// Vibe transfer and director (character) reference fields.
///
/// Empty lists are omitted from the body entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReferenceFields {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reference_image_multiple: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reference_information_extracted_multiple: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reference_strength_multiple: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub director_reference_images: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub director_reference_descriptions: Vec<DirectorDescription>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub director_reference_information_extracted: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub director_reference_strength_values: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub director_reference_secondary_strength_values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextToImageParameters {
    #[serde(flatten)]
    pub shared: SharedParameters,
    #[serde(flatten)]
    pub references: ReferenceFields,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageToImageParameters {
    #[serde(flatten)]
    pub shared: SharedParameters,
    #[serde(flatten)]
    pub references: ReferenceFields,
    /// Base64 source image.
    pub image: String,
    pub strength: f64,
    pub noise: f64,
    pub extra_noise_seed: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InpaintParameters {
    #[serde(flatten)]
    pub shared: SharedParameters,
    /// Base64 source image.
    pub image: String,
    /// Base64 black/white mask at the source image's size.
    pub mask: String,
    /// Fixed; the user's strength goes into `inpaint_strength`.
    pub strength: f64,
    #[serde(rename = "inpaintImg2ImgStrength")]
    pub inpaint_strength: f64,
    pub add_original_image: bool,
}

/// Parameter object, one concrete shape per generation mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ModeParameters {
    TextToImage(TextToImageParameters),
    ImageToImage(ImageToImageParameters),
    Inpaint(InpaintParameters),
}

impl ModeParameters {
    pub fn mode(&self) -> GenerationMode {
        match self {
            ModeParameters::TextToImage(_) => GenerationMode::TextToImage,
            ModeParameters::ImageToImage(_) => GenerationMode::ImageToImage,
            ModeParameters::Inpaint(_) => GenerationMode::Inpaint,
        }
    }

    pub fn shared(&self) -> &SharedParameters {
        match self {
            ModeParameters::TextToImage(p) => &p.shared,
            ModeParameters::ImageToImage(p) => &p.shared,
            ModeParameters::Inpaint(p) => &p.shared,
        }
    }

    /// Reference fields, if this mode can carry them at all.
    pub fn references(&self) -> Option<&ReferenceFields> {
        match self {
            ModeParameters::TextToImage(p) => Some(&p.references),
            ModeParameters::ImageToImage(p) => Some(&p.references),
            ModeParameters::Inpaint(_) => None,
        }
    }
}

/// A fully-formed request, built once per attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRequest {
    pub mode: GenerationMode,
    pub model: String,
    pub input: String,
    /// The resolved seed (never negative).
    pub seed: i64,
    pub parameters: ModeParameters,
}

impl CompiledRequest {
    pub fn steps(&self) -> u32 {
        self.parameters.shared().steps
    }

    /// JSON body for `/ai/generate-image` or, with `stream`, the msgpack
    /// streaming endpoint.
    pub fn to_body(&self, stream: bool) -> serde_json::Result<Value> {
        let mut body = json!({
            "input": self.input,
            "model": self.model,
            "action": self.mode.action(),
            "parameters": serde_json::to_value(&self.parameters)?,
        });
        if stream {
            body["parameters"]["stream"] = json!("msgpack");
        }
        Ok(body)
    }

    /// Suggested filename for the finished image.
    pub fn filename_hint<Tz>(&self, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        filename_hint(self.mode, self.seed, at)
    }
}

/// `{prefix}{YYYYMMDD_HHMMSS}_{seed}.png`, prefix empty, `I2I_` or `INPAINT_`.
pub fn filename_hint<Tz>(mode: GenerationMode, seed: i64, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}{}_{}.png",
        mode.filename_prefix(),
        at.format("%Y%m%d_%H%M%S"),
        seed
    )
}
