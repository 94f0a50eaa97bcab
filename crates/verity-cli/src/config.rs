//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for verity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chat model used for generation, grading and rewriting
    pub model: String,
    /// OpenAI-compatible API endpoint
    pub base_url: String,
    /// Embedding model used for retrieval queries
    pub embedding_model: String,
    /// Qdrant REST endpoint
    pub qdrant_url: String,
    /// Collection holding the forum passages
    pub collection: String,
    /// Passages retrieved per query
    pub top_k: usize,
    /// Retry budget per turn (3 allows 4 generations)
    pub max_retries: u32,
    /// Attempts per turn before giving up on transient failures
    pub turn_attempts: u32,
    /// Wall-clock bound per turn attempt
    pub turn_timeout_secs: Option<u64>,
    /// API keys (alternative to environment variables)
    pub api_keys: ApiKeys,
}

/// API key configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub qdrant: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            base_url: verity_ai::Model::OPENAI_BASE_URL.to_string(),
            embedding_model: verity_ai::providers::openai::OpenAIProvider::DEFAULT_EMBEDDING_MODEL
                .to_string(),
            qdrant_url: verity_ai::providers::qdrant::QdrantClient::DEFAULT_URL.to_string(),
            collection: "agnos_forum".to_string(),
            top_k: verity_agent::adapters::DEFAULT_TOP_K,
            max_retries: 3,
            turn_attempts: 3,
            turn_timeout_secs: None,
            api_keys: ApiKeys::default(),
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("verity")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("VERITY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Write the commented example config if no file exists yet
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        write_example(&path)?;
        Ok(path)
    }

    /// Get API key for a service, checking config then env
    pub fn get_api_key(&self, service: &str) -> Option<String> {
        let from_config = match service {
            "openai" => self.api_keys.openai.clone(),
            "qdrant" => self.api_keys.qdrant.clone(),
            _ => None,
        };

        if from_config.is_some() {
            return from_config;
        }

        let env_var = match service {
            "openai" => "OPENAI_API_KEY",
            "qdrant" => "QDRANT_API_KEY",
            _ => return None,
        };

        std::env::var(env_var).ok().filter(|k| !k.is_empty())
    }
}

fn write_example(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, example_config())
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# verity configuration file
# Place at ~/.config/verity/config.toml (Linux/Mac) or %APPDATA%\verity\config.toml (Windows)

# Chat model for answering, grading and query rewriting
model = "gpt-4o"

# OpenAI-compatible endpoint (chat completions and embeddings)
base_url = "https://api.openai.com/v1"

# Embedding model used to search the collection
embedding_model = "text-embedding-3-small"

# Qdrant REST endpoint and collection with the forum passages
qdrant_url = "http://localhost:6333"
collection = "agnos_forum"

# Passages retrieved per query
top_k = 5

# Regenerations or query rewrites allowed per question.
# The first answer does not count, so 3 allows up to 4 answers.
max_retries = 3

# Attempts per question when a service fails transiently
turn_attempts = 3

# Give up on an attempt after this many seconds (optional)
# turn_timeout_secs = 120

# API keys (optional - can also use environment variables)
# It's recommended to use environment variables instead for security
[api_keys]
# openai = "sk-..."
# qdrant = "..."
"#
}
