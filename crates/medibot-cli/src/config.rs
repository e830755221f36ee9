use medibot_core::{EuclideanMatcher, Responder, TemplateError, ARCFACE_MATCH_THRESHOLD};
use std::path::PathBuf;

/// Application configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD detector file name inside `model_dir`.
    pub detector_model: String,
    /// Recognizer file name inside `model_dir`.
    pub recognizer_model: String,
    /// Best-match distance must be strictly below this.
    pub match_threshold: f32,
    /// Distance at or below which a single comparison counts as a match.
    pub match_tolerance: f32,
    /// Response table overriding the built-in one.
    pub templates_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `MEDIBOT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("medibot");

        let parse_f32 = |key: &str, default: f32| {
            lookup(key)
                .and_then(|v| v.parse::<f32>().ok())
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(default)
        };

        Self {
            db_path: lookup("MEDIBOT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("users.db")),
            model_dir: lookup("MEDIBOT_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            detector_model: lookup("MEDIBOT_DETECTOR_MODEL")
                .unwrap_or_else(|| "det_10g.onnx".to_string()),
            recognizer_model: lookup("MEDIBOT_RECOGNIZER_MODEL")
                .unwrap_or_else(|| "w600k_r50.onnx".to_string()),
            // Defaults suit the shipped w600k recognizer; dlib-style
            // 128-d encoders want 0.6.
            match_threshold: parse_f32("MEDIBOT_MATCH_THRESHOLD", ARCFACE_MATCH_THRESHOLD),
            match_tolerance: parse_f32("MEDIBOT_MATCH_TOLERANCE", ARCFACE_MATCH_THRESHOLD),
            templates_path: lookup("MEDIBOT_TEMPLATES")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    /// Path to the face recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.recognizer_model)
    }

    pub fn matcher(&self) -> EuclideanMatcher {
        EuclideanMatcher {
            tolerance: self.match_tolerance,
            threshold: self.match_threshold,
        }
    }

    pub fn responder(&self) -> Result<Responder, TemplateError> {
        match &self.templates_path {
            Some(path) => Responder::from_path(path),
            None => Responder::builtin(),
        }
    }
}
