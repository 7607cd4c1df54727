use thiserror::Error;

use crate::types::{GenerationMode, RunMode};

/// Errors raised while turning [`GenerationParameters`](crate::GenerationParameters)
/// into a [`CompiledRequest`](crate::CompiledRequest).
///
/// All of these are terminal for the attempt and are never retried.
#[derive(Error, Debug)]
pub enum CompileError {
    /// A mask was supplied without a source image to paint over.
    #[error("Inpainting mask supplied without a source image")]
    MissingSourceForMask,

    /// One of the vibe reference images could not be encoded by the service.
    #[error("Failed to encode reference image #{index}: {message}")]
    ReferenceEncodingFailed { index: usize, message: String },

    /// Source, mask or reference bytes were not a decodable image.
    #[error("Failed to decode {what}: {message}")]
    ImageDecodeFailed { what: &'static str, message: String },

    /// Re-encoding a processed image to PNG failed.
    #[error("Failed to encode {what} as PNG: {message}")]
    ImageEncodeFailed { what: &'static str, message: String },
}

/// Network and HTTP level failures talking to NovelAI.
#[derive(Error, Debug)]
pub enum TransportError {
    /// NovelAI returned a non-success HTTP status.
    #[error("NovelAI returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The bearer token was rejected.
    #[error("NovelAI rejected the API token")]
    Unauthorized,

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// The request body could not be built.
    #[error("Failed to build request: {0}")]
    Request(String),

    /// The response body was not the archive we expected.
    #[error("Invalid image archive: {0}")]
    Archive(String),

    /// The response was missing expected fields.
    #[error("{0}")]
    InvalidResponse(String),
}

/// Failures of the length-prefixed msgpack stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame declared a length of zero or above the sanity ceiling.
    #[error("Malformed stream frame (declared length {length})")]
    MalformedFrame { length: u32 },

    /// The stream ended without a final event.
    #[error("Stream ended before a final image was received")]
    IncompleteStream,

    /// The service sent an error event mid-stream.
    #[error("NovelAI reported an error: {0}")]
    Service(String),

    /// A frame payload was not a decodable msgpack object.
    #[error("Failed to decode stream frame: {0}")]
    Decode(String),
}

/// Rejections raised when starting a scheduler run.
///
/// These are precondition failures: no state is touched when they occur.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The other scheduling mode currently owns the generation endpoint.
    #[error("Cannot start {requested} while {active} is running")]
    ConflictingModeActive { active: RunMode, requested: RunMode },

    /// A run of the same mode is already in progress.
    #[error("{0} is already running")]
    AlreadyRunning(RunMode),

    /// The externally owned scene collection lock was poisoned.
    #[error("Scene collection is unavailable: {0}")]
    Poisoned(String),
}

/// Umbrella error for a single generation attempt.
#[derive(Error, Debug)]
pub enum NaiError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The attempt was cancelled before its result could be used.
    #[error("Generation was cancelled")]
    Cancelled,
}

/// A failed attempt together with the context needed to report it.
#[derive(Error, Debug)]
#[error("{run_mode} attempt {attempt} failed: {source}")]
pub struct AttemptError {
    pub run_mode: RunMode,
    pub mode: Option<GenerationMode>,
    pub attempt: u32,
    #[source]
    pub source: NaiError,
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, NaiError>;
