use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Face embedding vector. Dimensionality depends on the recognition model
/// (128 for dlib-style encoders, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Who said a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    #[serde(rename = "user", alias = "User", alias = "You", alias = "you")]
    User,
    #[serde(rename = "bot", alias = "Bot", alias = "MediBot")]
    Bot,
}

/// One line of a conversation. Serialized as a `[speaker, text]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Speaker, String)", into = "(Speaker, String)")]
pub struct Message {
    pub speaker: Speaker,
    pub text: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Bot,
            text: text.into(),
        }
    }
}

impl From<(Speaker, String)> for Message {
    fn from((speaker, text): (Speaker, String)) -> Self {
        Self { speaker, text }
    }
}

impl From<Message> for (Speaker, String) {
    fn from(msg: Message) -> Self {
        (msg.speaker, msg.text)
    }
}

/// A saved chat session. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub timestamp: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Short human label, e.g. "Mar 04, 2026 14:05".
    pub fn label(&self) -> String {
        self.timestamp.format("%b %d, %Y %H:%M").to_string()
    }
}

/// A registered user with enrolled embeddings and conversation history.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub embeddings: Vec<Embedding>,
    pub created_at: DateTime<Utc>,
    pub conversations: Vec<Conversation>,
    /// Encoded image bytes (JPEG/PNG) captured at registration.
    pub profile_image: Option<Vec<u8>>,
}
