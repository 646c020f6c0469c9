use std::env;
use std::path::PathBuf;

/// Runtime configuration, collected from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Primary language-model backend: "openai" or "ollama". The other one
    /// is kept as an ordered fallback.
    pub llm_backend: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub headless: bool,
    /// Root directory for exported task results and screenshots.
    pub output_dir: PathBuf,
    pub memory_file: PathBuf,
    pub persist_memory: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            llm_backend: env::var("WEBPILOT_LLM_BACKEND").unwrap_or_else(|_| "openai".into()),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            openai_base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            openai_model: env::var("WEBPILOT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".into()),
            ollama_model: env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama2".into()),
            headless: env::var("BROWSER_HEADLESS")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
            output_dir: env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("exports")),
            memory_file: env::var("MEMORY_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_memory_file()),
            persist_memory: env::var("MEMORY_PERSIST")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }
}

fn default_memory_file() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("webpilot").join("session_memory.json"))
        .unwrap_or_else(|| PathBuf::from("session_memory.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::from_env();
        assert!(!cfg.openai_base_url.is_empty());
        assert!(!cfg.ollama_base_url.is_empty());
        assert!(cfg.memory_file.file_name().is_some());
    }
}
