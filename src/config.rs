use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TutorConfig {
    // HTTP server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Curriculum document (JSON). Falls back to the embedded Year 7 NSW document.
    #[serde(default)]
    pub curriculum_path: Option<String>,

    // Per-user token budget and input gate
    #[serde(default = "default_token_limit")]
    pub user_token_limit: u64,
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: u64,
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,

    // Session continuity and eviction policy
    #[serde(default = "default_continuity_window_secs")]
    pub continuity_window_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_max_conversations_per_user")]
    pub max_conversations_per_user: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_year_level")]
    pub default_year_level: u8,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_token_limit() -> u64 {
    5000
}

fn default_max_input_tokens() -> u64 {
    1000
}

fn default_max_response_tokens() -> u32 {
    180
}

fn default_continuity_window_secs() -> u64 {
    5 * 60
}

fn default_retention_days() -> i64 {
    7
}

fn default_max_conversations_per_user() -> usize {
    50
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_year_level() -> u8 {
    7
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            curriculum_path: None,
            user_token_limit: default_token_limit(),
            max_input_tokens: default_max_input_tokens(),
            max_response_tokens: default_max_response_tokens(),
            continuity_window_secs: default_continuity_window_secs(),
            retention_days: default_retention_days(),
            max_conversations_per_user: default_max_conversations_per_user(),
            sweep_interval_secs: default_sweep_interval_secs(),
            default_year_level: default_year_level(),
        }
    }
}

impl TutorConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("studybuddy_config.toml")
    }

    /// Load config from studybuddy_config.toml next to the executable,
    /// falling back to defaults plus environment variables.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<TutorConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.apply_env();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::default().apply_env()
    }

    /// Overlay environment variables onto this config.
    pub fn apply_env(mut self) -> Self {
        if let Ok(addr) = env::var("STUDYBUDDY_BIND") {
            self.bind_addr = addr;
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }

        if let Ok(path) = env::var("STUDYBUDDY_CURRICULUM_PATH") {
            if !path.trim().is_empty() {
                self.curriculum_path = Some(path);
            }
        }

        if let Ok(limit) = env::var("STUDYBUDDY_USER_TOKEN_LIMIT") {
            if let Ok(tokens) = limit.parse() {
                self.user_token_limit = tokens;
            }
        }

        if let Ok(secs) = env::var("STUDYBUDDY_CONTINUITY_WINDOW_SECS") {
            if let Ok(seconds) = secs.parse() {
                self.continuity_window_secs = seconds;
            }
        }

        if let Ok(secs) = env::var("STUDYBUDDY_SWEEP_INTERVAL_SECS") {
            if let Ok(seconds) = secs.parse() {
                self.sweep_interval_secs = seconds;
            }
        }

        self
    }
}
