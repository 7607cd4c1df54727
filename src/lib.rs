//! # novelai-rs
//!
//! Async Rust client and generation scheduler for the
//! [NovelAI](https://novelai.net) image API.
//!
//! Compiles high-level generation parameters into NovelAI's request format
//! (text-to-image, image-to-image and inpainting, with vibe and character
//! references), decodes the streaming msgpack response with live previews,
//! and runs fixed-count batches or scene-queue drains one attempt at a time
//! with cancellation and progress reporting.
//!
//! ## Quick Start
//!
//! ```no_run
//! use novelai_rs::{
//!     seeded_factory, AttemptInfo, AttemptResult, CharacterCaption, GenerationObserver,
//!     GenerationParameters, NovelAiClient, Scheduler,
//! };
//!
//! struct SaveToDisk;
//!
//! impl GenerationObserver for SaveToDisk {
//!     fn on_progress(&mut self, attempt: &AttemptInfo, percent: u8, _preview: Option<&[u8]>) {
//!         println!("#{}: {}%", attempt.index, percent);
//!     }
//!
//!     fn on_result(&mut self, _attempt: &AttemptInfo, result: &AttemptResult) {
//!         if let (Some(image), Some(name)) = (&result.image, &result.filename_hint) {
//!             std::fs::write(name, image).unwrap();
//!         }
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = NovelAiClient::new("pst-xxxx");
//! let sub = client.subscription().await?;
//! println!("tier: {}", sub.tier);
//!
//! let params = GenerationParameters::new("2girls, cafe, window light", "nai-diffusion-4-5-full")
//!     .negative("lowres, blurry")
//!     .character(CharacterCaption::new("girl, red hair").at(0.3, 0.5))
//!     .character(CharacterCaption::new("girl, black hair").at(0.7, 0.5));
//!
//! let scheduler = Scheduler::new(client);
//! let report = scheduler
//!     .run_batch(seeded_factory(params, false), 4, &mut SaveToDisk)
//!     .await?;
//! println!("{:?}: {}/{}", report.status(), report.completed, report.total);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod compiler;
pub mod config;
pub mod error;
pub mod mask;
pub mod payload;
pub mod scheduler;
pub mod stream;
pub mod transport;
pub mod types;

pub use client::{extract_image_from_zip, NovelAiClient};
pub use compiler::{compile, inpaint_model, resolve_seed};
pub use config::{ClientConfig, ClientConfigBuilder, SchedulerConfig, SchedulerConfigBuilder};
pub use error::{
    AttemptError, CompileError, NaiError, ProtocolError, Result, SchedulerError, TransportError,
};
pub use payload::CompiledRequest;
pub use scheduler::{seeded_factory, GenerationObserver, NoopObserver, Scheduler};
pub use stream::{progress_percent, StreamDecoder};
pub use transport::{ByteStream, GenerationTransport, ReferenceEncoder};
pub use types::{
    AttemptInfo, AttemptRecord, AttemptResult, CharacterCaption, CharacterReference,
    GenerationMode, GenerationParameters, Position, QueueableItem, ReferenceImage, RunMode,
    RunOutcome, RunReport, RunSnapshot, RunStatus, StreamEvent, Subscription, DEFAULT_MODEL,
};
