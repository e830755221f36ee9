//! Face identification and scripted medical-intake dialogue.
//!
//! Face embeddings come from SCRFD detection plus an ArcFace-style
//! recognizer running on ONNX Runtime. Identity is resolved by Euclidean
//! nearest neighbour; replies come from a keyword-triggered template table.

pub mod alignment;
pub mod detector;
pub mod matcher;
pub mod provider;
pub mod recognizer;
pub mod responder;
pub mod types;

pub use matcher::{
    EuclideanMatcher, GalleryEntry, MatchResult, Matcher, ARCFACE_MATCH_THRESHOLD,
    DEFAULT_MATCH_THRESHOLD,
};
pub use provider::{EmbeddingProvider, OnnxEmbedder, ProviderError};
pub use responder::{CategoryKind, Responder, TemplateError, TemplateTable};
pub use types::{Conversation, Embedding, Message, Speaker, UserRecord};

