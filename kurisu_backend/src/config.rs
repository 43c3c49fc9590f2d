use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::ChatFormat;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    // OpenAI-compatible endpoint: llama.cpp server, Ollama, vLLM, hosted APIs
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    /// llama.cpp-style server: send its sampling extras and use `/tokenize`.
    #[serde(default = "default_true")]
    pub local: bool,
    #[serde(default)]
    pub chat_format: ChatFormat,
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_min_p")]
    pub min_p: f32,
    #[serde(default = "default_typical_p")]
    pub typical_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default = "default_stop")]
    pub stop: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model_name() -> String {
    "mistral-7b-instruct".to_string()
}

fn default_llm_url() -> String {
    "http://localhost:8080/v1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_n_ctx() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_p() -> f32 {
    0.95
}

fn default_top_k() -> u32 {
    40
}

fn default_min_p() -> f32 {
    0.05
}

fn default_typical_p() -> f32 {
    1.0
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_max_tokens() -> u32 {
    512
}

fn default_stop() -> Vec<String> {
    vec!["</s>".to_string()]
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            api_url: default_llm_url(),
            api_key: String::new(),
            local: true,
            chat_format: ChatFormat::default(),
            n_ctx: default_n_ctx(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            min_p: default_min_p(),
            typical_p: default_typical_p(),
            repeat_penalty: default_repeat_penalty(),
            max_tokens: default_max_tokens(),
            seed: None,
            stop: default_stop(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBackend {
    #[default]
    Disabled,
    Sqlite,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    #[serde(default)]
    pub backend: MemoryBackend,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    // Memory façade served by kurisu_memory_server
    #[serde(default = "default_memory_url")]
    pub base_url: String,
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    #[serde(default = "default_max_distance")]
    pub max_distance: f64,
    #[serde(default = "default_memory_bind")]
    pub bind: String,
}

fn default_database_path() -> String {
    "kurisu_memory.db".to_string()
}

fn default_memory_url() -> String {
    "http://127.0.0.1:8085".to_string()
}

fn default_context_limit() -> usize {
    5
}

fn default_max_distance() -> f64 {
    0.7
}

fn default_memory_bind() -> String {
    "127.0.0.1:8085".to_string()
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            backend: MemoryBackend::Disabled,
            database_path: default_database_path(),
            base_url: default_memory_url(),
            context_limit: default_context_limit(),
            max_distance: default_max_distance(),
            bind: default_memory_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramSettings {
    /// Only chats from these user ids are forwarded. Empty means the adapter stays off.
    #[serde(default)]
    pub creator_id: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KurisuConfig {
    // Persona template, looked up in profiles_dir
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: String,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,

    #[serde(default = "default_token_limit")]
    pub token_limit: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_inbound_topic")]
    pub inbound_topic: String,
    #[serde(default = "default_outbound_topic")]
    pub outbound_topic: String,

    // History retention between exchanges
    #[serde(default = "default_true")]
    pub use_memories: bool,
    #[serde(default)]
    pub save_memories: bool,
    #[serde(default)]
    pub add_context: bool,
    #[serde(default = "default_chat_memory_limit")]
    pub chat_memory_limit: usize,
    #[serde(default = "default_generation_workers")]
    pub generation_workers: usize,

    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub telegram: TelegramSettings,
}

fn default_persona() -> String {
    "default_persona.txt".to_string()
}

fn default_profiles_dir() -> String {
    "profiles".to_string()
}

fn default_user_name() -> String {
    "User".to_string()
}

fn default_assistant_name() -> String {
    "Kurisu".to_string()
}

fn default_token_limit() -> usize {
    2000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_inbound_topic() -> String {
    "input".to_string()
}

fn default_outbound_topic() -> String {
    "back_response".to_string()
}

fn default_chat_memory_limit() -> usize {
    20
}

fn default_generation_workers() -> usize {
    1
}

impl Default for KurisuConfig {
    fn default() -> Self {
        Self {
            persona: default_persona(),
            profiles_dir: default_profiles_dir(),
            user_name: default_user_name(),
            assistant_name: default_assistant_name(),
            token_limit: default_token_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            inbound_topic: default_inbound_topic(),
            outbound_topic: default_outbound_topic(),
            use_memories: true,
            save_memories: false,
            add_context: false,
            chat_memory_limit: default_chat_memory_limit(),
            generation_workers: default_generation_workers(),
            llm: LlmSettings::default(),
            memory: MemorySettings::default(),
            telegram: TelegramSettings::default(),
        }
    }
}

impl KurisuConfig {
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
        Self::get_base_dir().join("kurisu_config.toml")
    }

    /// Load config from kurisu_config.toml (next to executable), falling back to defaults + env vars
    pub fn load() -> Self {
        let path = Self::config_path();
        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<KurisuConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse config {:?}", path))
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm.api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm.model_name = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm.api_key = key;
        }

        if let Ok(local) = env::var("LLM_LOCAL") {
            config.llm.local = parse_flag(&local);
        }

        if let Ok(format) = env::var("LLM_CHAT_FORMAT") {
            match format.parse() {
                Ok(format) => config.llm.chat_format = format,
                Err(e) => tracing::warn!("Ignoring LLM_CHAT_FORMAT: {}", e),
            }
        }

        if let Ok(persona) = env::var("KURISU_PERSONA") {
            if !persona.trim().is_empty() {
                config.persona = persona;
            }
        }

        if let Ok(dir) = env::var("KURISU_PROFILES_DIR") {
            if !dir.trim().is_empty() {
                config.profiles_dir = dir;
            }
        }

        if let Ok(name) = env::var("KURISU_USER_NAME") {
            config.user_name = name;
        }

        if let Ok(name) = env::var("KURISU_ASSISTANT_NAME") {
            config.assistant_name = name;
        }

        if let Ok(limit) = env::var("KURISU_TOKEN_LIMIT") {
            if let Ok(limit) = limit.parse() {
                config.token_limit = limit;
            }
        }

        if let Ok(interval) = env::var("KURISU_POLL_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                config.poll_interval_ms = ms;
            }
        }

        if let Ok(enabled) = env::var("KURISU_USE_MEMORIES") {
            config.use_memories = parse_flag(&enabled);
        }

        if let Ok(enabled) = env::var("KURISU_SAVE_MEMORIES") {
            config.save_memories = parse_flag(&enabled);
        }

        if let Ok(enabled) = env::var("KURISU_ADD_CONTEXT") {
            config.add_context = parse_flag(&enabled);
        }

        if let Ok(backend) = env::var("KURISU_MEMORY_BACKEND") {
            match backend.trim().to_ascii_lowercase().as_str() {
                "sqlite" => config.memory.backend = MemoryBackend::Sqlite,
                "http" => config.memory.backend = MemoryBackend::Http,
                "disabled" | "" => config.memory.backend = MemoryBackend::Disabled,
                other => tracing::warn!("Ignoring unknown KURISU_MEMORY_BACKEND '{}'", other),
            }
        }

        if let Ok(path) = env::var("KURISU_MEMORY_DB") {
            if !path.trim().is_empty() {
                config.memory.database_path = path;
            }
        }

        if let Ok(url) = env::var("KURISU_MEMORY_URL") {
            config.memory.base_url = url;
        }

        if let Ok(ids) = env::var("TELEGRAM_CREATOR_ID") {
            config.telegram.creator_id = ids
                .split(',')
                .filter_map(|id| id.trim().parse().ok())
                .collect();
        }

        config
    }

    /// Full path of the persona template.
    pub fn persona_path(&self) -> PathBuf {
        Path::new(&self.profiles_dir).join(&self.persona)
    }
}

pub(crate) fn parse_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}
