use std::collections::HashSet;

use anyhow::{anyhow, bail};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::storage::{self, StorageManager};

const TASK_QUEUE_MAX_THREADS: u16 = 3;
const LISTEN_ADDR: &str = "0.0.0.0:8080";

const USER_AGENT_DEFAULT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0";

/// Default similarity threshold for semantic search
const DEFAULT_SEMANTIC_THRESHOLD: f32 = 0.3;

/// Resolves the data directory: `MARKLY_BASE_PATH` or `~/.local/share/markly`.
pub fn base_path() -> anyhow::Result<String> {
    if let Ok(path) = std::env::var("MARKLY_BASE_PATH") {
        return Ok(path);
    }

    let home = my_home()?.ok_or_else(|| anyhow!("couldnt find home dir"))?;
    Ok(format!("{}/.local/share/markly", home.to_string_lossy()))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub username: String,
    pub email: String,
    pub token: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default = "scrape_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "max_content_bytes")]
    pub max_content_bytes: usize,
    #[serde(default = "max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default = "user_agent")]
    pub user_agent: String,
    #[serde(default = "block_private_ips")]
    pub block_private_ips: bool,
    #[serde(default = "allowed_schemes")]
    pub allowed_schemes: Vec<String>,
    #[serde(default)]
    pub blocked_hosts: Vec<String>,

    /// Reader-mode proxy used when direct extraction fails.
    #[serde(default = "reader_url")]
    pub reader_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_api_key: Option<String>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: scrape_timeout_secs(),
            max_content_bytes: max_content_bytes(),
            max_text_chars: max_text_chars(),
            user_agent: user_agent(),
            block_private_ips: block_private_ips(),
            allowed_schemes: allowed_schemes(),
            blocked_hosts: vec![],
            reader_url: reader_url(),
            reader_api_key: None,
        }
    }
}

fn scrape_timeout_secs() -> u64 {
    15
}

fn max_content_bytes() -> usize {
    5 * 1024 * 1024
}

fn max_text_chars() -> usize {
    15000
}

fn user_agent() -> String {
    USER_AGENT_DEFAULT.to_string()
}

fn block_private_ips() -> bool {
    true
}

fn allowed_schemes() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}

fn reader_url() -> Option<String> {
    Some("https://r.jina.ai".to_string())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "llm_endpoint")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "llm_model")]
    pub model: String,
    /// Cheaper model used for bulk imports that ask for it.
    #[serde(default)]
    pub nano_model: Option<String>,
    /// When set, requests are addressed Azure style (`deployments/<model>`).
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default = "llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "max_completion_tokens")]
    pub max_completion_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: llm_endpoint(),
            api_key: None,
            model: llm_model(),
            nano_model: None,
            api_version: None,
            timeout_secs: llm_timeout_secs(),
            max_completion_tokens: max_completion_tokens(),
        }
    }
}

fn llm_endpoint() -> String {
    "https://api.openai.com".to_string()
}

fn llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn llm_timeout_secs() -> u64 {
    60
}

fn max_completion_tokens() -> u32 {
    1000
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    None,
    Openai,
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,
    #[serde(default = "embedding_model")]
    pub model: String,
    /// Falls back to the llm endpoint when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "semantic_threshold")]
    pub threshold: f32,
    #[serde(default = "llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::None,
            model: embedding_model(),
            endpoint: None,
            api_key: None,
            threshold: DEFAULT_SEMANTIC_THRESHOLD,
            timeout_secs: llm_timeout_secs(),
        }
    }
}

fn embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn semantic_threshold() -> f32 {
    DEFAULT_SEMANTIC_THRESHOLD
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "listen")]
    pub listen: String,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "task_queue_max_threads")]
    pub task_queue_max_threads: u16,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: listen(),
            cors_origins: vec![],
            task_queue_max_threads: task_queue_max_threads(),
            users: vec![],
            scrape: ScrapeConfig::default(),
            llm: LlmConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            base_path: String::new(),
        }
    }
}

fn listen() -> String {
    LISTEN_ADDR.to_string()
}

fn task_queue_max_threads() -> u16 {
    TASK_QUEUE_MAX_THREADS
}

impl Config {
    fn validate(&mut self) -> anyhow::Result<()> {
        if self.task_queue_max_threads == 0 {
            self.task_queue_max_threads = 1
        }

        let mut tokens = HashSet::new();
        let mut usernames = HashSet::new();
        let mut ids = HashSet::new();
        for (idx, user) in self.users.iter().enumerate() {
            let idx = idx + 1;
            if user.id.trim().is_empty() || user.username.trim().is_empty() {
                bail!("user #{idx} must have an id and a username");
            }
            if user.token.trim().is_empty() {
                bail!("user #{idx} has an empty token");
            }
            if !tokens.insert(user.token.clone()) {
                bail!("user #{idx} reuses a token of another user");
            }
            if !usernames.insert(user.username.to_lowercase()) {
                bail!("username '{}' is used twice", user.username);
            }
            if !ids.insert(user.id.clone()) {
                bail!("user id '{}' is used twice", user.id);
            }
        }

        if !(0.0..=1.0).contains(&self.embeddings.threshold) {
            bail!(
                "embeddings.threshold must be between 0.0 and 1.0, got {}",
                self.embeddings.threshold
            );
        }

        if self.scrape.timeout_secs == 0 || self.llm.timeout_secs == 0 {
            bail!("timeouts must be greater than 0");
        }

        if self.embeddings.timeout_secs == 0 {
            bail!("embeddings.timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Secrets may come from the environment instead of the config file.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("MARKLY_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("MARKLY_EMBEDDING_API_KEY") {
            self.embeddings.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("MARKLY_READER_API_KEY") {
            self.scrape.reader_api_key = Some(key);
        }
    }

    pub fn load_with(base_path: &str) -> anyhow::Result<Self> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists("config.yaml") {
            store.write(
                "config.yaml",
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str = String::from_utf8(store.read("config.yaml")?)
            .map_err(|_| anyhow!("config file is not valid utf8"))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .map_err(|err| anyhow!("config is malformed: {err}"))?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        config.apply_env();

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write("config.yaml", config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn user_by_token(&self, token: &str) -> Option<&UserConfig> {
        self.users
            .iter()
            .find(|user| crate::auth::tokens_match(token, &user.token))
    }

    pub fn user_by_username(&self, username: &str) -> Option<&UserConfig> {
        self.users
            .iter()
            .find(|user| user.username.eq_ignore_ascii_case(username))
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.embeddings.provider != EmbeddingProvider::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_written_and_reloaded() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_str().unwrap();

        let config = Config::load_with(path).unwrap();
        assert_eq!(config.task_queue_max_threads, 3);
        assert_eq!(config.embeddings.provider, EmbeddingProvider::None);
        assert!(tmp.path().join("config.yaml").exists());

        let again = Config::load_with(path).unwrap();
        assert_eq!(again.listen, config.listen);
    }

    #[test]
    fn test_zero_threads_is_clamped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.yaml"), "task_queue_max_threads: 0\n").unwrap();

        let config = Config::load_with(tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(config.task_queue_max_threads, 1);
    }

    #[test]
    fn test_duplicate_tokens_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let yaml = r#"
users:
  - id: u1
    username: alice
    email: alice@example.com
    token: same
  - id: u2
    username: bob
    email: bob@example.com
    token: same
"#;
        std::fs::write(tmp.path().join("config.yaml"), yaml).unwrap();

        let err = Config::load_with(tmp.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn test_threshold_out_of_range_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.yaml"),
            "embeddings:\n  threshold: 1.5\n",
        )
        .unwrap();

        assert!(Config::load_with(tmp.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_lookup_users() {
        let mut config = Config::default();
        config.users.push(UserConfig {
            id: "u1".to_string(),
            username: "Alice".to_string(),
            email: "alice@example.com".to_string(),
            token: "tok".to_string(),
            ..Default::default()
        });

        assert_eq!(config.user_by_token("tok").map(|u| u.id.as_str()), Some("u1"));
        assert!(config.user_by_token("nope").is_none());
        assert!(config.user_by_username("alice").is_some());
    }
}
