//! Streaming: raw model chunks in, OpenAI-style frames out

pub mod classifier;
pub mod emitter;

pub use classifier::{ClassifierPhase, StreamClassifier};
pub use emitter::{ChunkEncoder, CompletionCollector, Frame};
