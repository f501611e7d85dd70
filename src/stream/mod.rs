//! Per-stream pipeline stages: upstream frame decoding, chunk classification
//! and OpenAI frame emission. The tool-call sieve sits between the classifier
//! and the emitter and lives in [`crate::sieve`].

pub mod classifier;
pub mod emitter;
pub mod upstream;

pub use classifier::{is_citation, ChunkOutcome, ContentPart, PartKind, PathClassifier, SkipPaths, Terminal};
pub use emitter::{FinishReason, FrameEmitter};
pub use upstream::{upstream_frame_stream, DataLineReader, UpstreamFrame};
