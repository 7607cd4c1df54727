use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::AttemptError;

/// Default model used when a caller does not pick one.
pub const DEFAULT_MODEL: &str = "nai-diffusion-4-5-full";

/// A vibe-transfer reference image. Encoded by the service before use.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceImage {
    pub image: Vec<u8>,
    pub information_extracted: f64,
    pub strength: f64,
}

impl ReferenceImage {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            information_extracted: 1.0,
            strength: 0.6,
        }
    }

    pub fn information_extracted(mut self, value: f64) -> Self {
        self.information_extracted = value.clamp(0.0, 1.0);
        self
    }

    pub fn strength(mut self, value: f64) -> Self {
        self.strength = value.clamp(0.0, 1.0);
        self
    }
}

/// A character/body reference image, letterboxed onto a fixed canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterReference {
    pub image: Vec<u8>,
    pub strength: f64,
    pub fidelity: f64,
}

impl CharacterReference {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            strength: 1.0,
            fidelity: 1.0,
        }
    }

    pub fn strength(mut self, value: f64) -> Self {
        self.strength = value.clamp(0.0, 1.0);
        self
    }

    pub fn fidelity(mut self, value: f64) -> Self {
        self.fidelity = value.clamp(0.0, 1.0);
        self
    }
}

/// Normalized position of a character on the canvas, both axes in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new(0.5, 0.5)
    }
}

/// Per-character prompt placed at a position on the canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterCaption {
    pub prompt: String,
    pub negative: String,
    pub enabled: bool,
    pub position: Position,
}

impl CharacterCaption {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative: String::new(),
            enabled: true,
            position: Position::default(),
        }
    }

    pub fn negative(mut self, negative: impl Into<String>) -> Self {
        self.negative = negative.into();
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Snapshot of everything needed for one generation attempt.
///
/// Built fresh for each attempt and never mutated once compilation starts.
///
/// # Example
/// ```
/// use novelai_rs::GenerationParameters;
///
/// let params = GenerationParameters::new("1girl, sunset", "nai-diffusion-4-5-full")
///     .negative("lowres")
///     .size(832, 1216)
///     .steps(28)
///     .seed(42);
///
/// assert_eq!(params.seed, 42);
/// assert!(params.source_image.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct GenerationParameters {
    pub prompt: String,
    pub negative_prompt: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub cfg_rescale: f64,
    pub sampler: String,
    pub noise_schedule: String,
    pub variety_boost: bool,
    pub decrisp: bool,
    pub quality_toggle: bool,
    pub uc_preset: u8,
    /// Negative values ask the compiler for a random seed.
    pub seed: i64,
    pub source_image: Option<Vec<u8>>,
    pub strength: Option<f64>,
    pub noise: Option<f64>,
    pub mask: Option<Vec<u8>>,
    pub references: Vec<ReferenceImage>,
    pub character_references: Vec<CharacterReference>,
    pub characters: Vec<CharacterCaption>,
}

impl GenerationParameters {
    /// Create parameters for a prompt and model with NovelAI's usual defaults
    /// (832x1216, 28 steps, cfg 5.0, k_euler_ancestral/karras, random seed).
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            model: model.into(),
            width: 832,
            height: 1216,
            steps: 28,
            cfg_scale: 5.0,
            cfg_rescale: 0.0,
            sampler: "k_euler_ancestral".to_string(),
            noise_schedule: "karras".to_string(),
            variety_boost: false,
            decrisp: false,
            quality_toggle: true,
            uc_preset: 0,
            seed: -1,
            source_image: None,
            strength: None,
            noise: None,
            mask: None,
            references: Vec::new(),
            character_references: Vec::new(),
            characters: Vec::new(),
        }
    }

    pub fn negative(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = prompt.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn cfg_scale(mut self, cfg: f64) -> Self {
        self.cfg_scale = cfg;
        self
    }

    pub fn cfg_rescale(mut self, rescale: f64) -> Self {
        self.cfg_rescale = rescale;
        self
    }

    /// Set the sampler (e.g. "k_euler_ancestral", "k_dpmpp_2m").
    pub fn sampler(mut self, sampler: impl Into<String>) -> Self {
        self.sampler = sampler.into();
        self
    }

    /// Set the noise schedule (e.g. "karras", "exponential").
    pub fn noise_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.noise_schedule = schedule.into();
        self
    }

    pub fn variety_boost(mut self, enabled: bool) -> Self {
        self.variety_boost = enabled;
        self
    }

    pub fn decrisp(mut self, enabled: bool) -> Self {
        self.decrisp = enabled;
        self
    }

    pub fn quality_toggle(mut self, enabled: bool) -> Self {
        self.quality_toggle = enabled;
        self
    }

    pub fn uc_preset(mut self, preset: u8) -> Self {
        self.uc_preset = preset;
        self
    }

    /// Set a specific seed. Use -1 (the default) for random.
    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    /// Use an existing image as the starting point (image-to-image).
    pub fn source_image(mut self, image: Vec<u8>) -> Self {
        self.source_image = Some(image);
        self
    }

    pub fn strength(mut self, strength: f64) -> Self {
        self.strength = Some(strength.clamp(0.0, 1.0));
        self
    }

    pub fn noise(mut self, noise: f64) -> Self {
        self.noise = Some(noise.clamp(0.0, 1.0));
        self
    }

    /// Paint over the source image where the mask is set (inpainting).
    pub fn mask(mut self, mask: Vec<u8>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn reference(mut self, reference: ReferenceImage) -> Self {
        self.references.push(reference);
        self
    }

    pub fn character_reference(mut self, reference: CharacterReference) -> Self {
        self.character_references.push(reference);
        self
    }

    pub fn character(mut self, caption: CharacterCaption) -> Self {
        self.characters.push(caption);
        self
    }

    /// The generation mode these parameters resolve to.
    ///
    /// A mask without a source image still reports `TextToImage`; the compiler
    /// rejects that combination.
    pub fn mode(&self) -> GenerationMode {
        match (&self.source_image, &self.mask) {
            (None, _) => GenerationMode::TextToImage,
            (Some(_), None) => GenerationMode::ImageToImage,
            (Some(_), Some(_)) => GenerationMode::Inpaint,
        }
    }
}

/// The three mutually exclusive generation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    TextToImage,
    ImageToImage,
    Inpaint,
}

impl GenerationMode {
    /// The `action` value NovelAI expects for this mode.
    pub fn action(&self) -> &'static str {
        match self {
            GenerationMode::TextToImage => "generate",
            GenerationMode::ImageToImage => "img2img",
            GenerationMode::Inpaint => "infill",
        }
    }

    /// Prefix used in suggested output filenames.
    pub fn filename_prefix(&self) -> &'static str {
        match self {
            GenerationMode::TextToImage => "",
            GenerationMode::ImageToImage => "I2I_",
            GenerationMode::Inpaint => "INPAINT_",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationMode::TextToImage => write!(f, "text-to-image"),
            GenerationMode::ImageToImage => write!(f, "image-to-image"),
            GenerationMode::Inpaint => write!(f, "inpaint"),
        }
    }
}

/// One decoded event from the generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A diffusion step. `image` is only present when the preview was surfaced.
    Intermediate { step: u32, image: Option<Vec<u8>> },
    /// The finished generation.
    Final {
        step: Option<u32>,
        image: Option<Vec<u8>>,
    },
    /// The service reported an error mid-stream.
    Error { message: String },
}

impl StreamEvent {
    pub fn step(&self) -> Option<u32> {
        match self {
            StreamEvent::Intermediate { step, .. } => Some(*step),
            StreamEvent::Final { step, .. } => *step,
            StreamEvent::Error { .. } => None,
        }
    }

    pub fn image(&self) -> Option<&[u8]> {
        match self {
            StreamEvent::Intermediate { image, .. } | StreamEvent::Final { image, .. } => {
                image.as_deref()
            }
            StreamEvent::Error { .. } => None,
        }
    }

    /// `Final` and `Error` both end the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Intermediate { .. })
    }
}

/// Externally owned unit of queued work (a scene).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueableItem {
    pub id: String,
    pub name: String,
    pub pending_count: u32,
}

impl QueueableItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, pending_count: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            pending_count,
        }
    }
}

/// The two scheduling policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunMode {
    Batch,
    QueueDrain,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Batch => write!(f, "batch generation"),
            RunMode::QueueDrain => write!(f, "queue drain"),
        }
    }
}

/// Run lifecycle: Idle -> Running -> Completed/Cancelled/Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Observable scheduler state, published through a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: Option<String>,
    pub mode: Option<RunMode>,
    pub status: RunStatus,
    pub completed: u32,
    pub total: u32,
    pub current_scene: Option<String>,
}

impl RunSnapshot {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}

/// Identifies the attempt a callback refers to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptInfo {
    pub run_id: String,
    pub run_mode: RunMode,
    pub index: u32,
    pub scene_id: Option<String>,
    /// Known once the request has been compiled.
    pub mode: Option<GenerationMode>,
    pub seed: Option<i64>,
}

/// Delivered exactly once per dispatched attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResult {
    pub success: bool,
    pub image: Option<Vec<u8>>,
    pub filename_hint: Option<String>,
    pub error: Option<String>,
}

impl AttemptResult {
    pub fn success(image: Vec<u8>, filename_hint: String) -> Self {
        Self {
            success: true,
            image: Some(image),
            filename_hint: Some(filename_hint),
            error: None,
        }
    }

    pub fn failure(error: String) -> Self {
        Self {
            success: false,
            image: None,
            filename_hint: None,
            error: Some(error),
        }
    }
}

/// Bookkeeping for one finished attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub index: u32,
    pub scene_id: Option<String>,
    pub mode: Option<GenerationMode>,
    pub seed: Option<i64>,
    pub elapsed: Duration,
    pub success: bool,
    pub filename_hint: Option<String>,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed(AttemptError),
}

/// Returned by the scheduler once a run stops. Completed work is always
/// reported, even when a later attempt failed.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub outcome: RunOutcome,
    pub completed: u32,
    pub total: u32,
    pub attempts: Vec<AttemptRecord>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        match self.outcome {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Cancelled => RunStatus::Cancelled,
            RunOutcome::Failed(_) => RunStatus::Failed,
        }
    }

    pub fn successes(&self) -> usize {
        self.attempts.iter().filter(|a| a.success).count()
    }
}

/// Account tier and balance reported by `/user/subscription`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub tier: String,
    pub fixed_anlas: Option<i64>,
    pub purchased_anlas: Option<i64>,
}
