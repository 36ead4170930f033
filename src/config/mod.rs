use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 400;
pub const DEFAULT_COMPACT_KEEP_MESSAGES: usize = 20;
pub const DEFAULT_SHORT_RESPONSE_FOLLOWUP_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub project_root: PathBuf,
    pub system_prompt: Option<String>,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            system_prompt: None,
            llm: LlmConfig::default(),
            agent: AgentConfig::default(),
            mcp_servers: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub retry_jitter_ms: u64,
    pub respect_retry_after: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 600_000, // 10 minutes
            max_retries: 3,
            retry_base_ms: 1000,
            retry_jitter_ms: 2000,
            respect_retry_after: true,
        }
    }
}

/// Knobs of the turn engine.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Tool rounds allowed in one turn before the engine stops.
    pub max_tool_rounds: usize,
    /// Messages kept (besides the system prompt) when history is compacted
    /// after a context overflow.
    pub compact_keep_messages: usize,
    /// After a tool round, a final answer at most this many characters long
    /// gets one follow-up request. Zero disables the follow-up.
    pub short_response_followup_chars: usize,
    /// Minimum spacing between token-count updates while content streams.
    pub token_update_interval_ms: u64,
    pub tool_timeout_ms: u64,
    /// Request streamed responses from the backend.
    pub stream: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            compact_keep_messages: DEFAULT_COMPACT_KEEP_MESSAGES,
            short_response_followup_chars: DEFAULT_SHORT_RESPONSE_FOLLOWUP_CHARS,
            token_update_interval_ms: 250,
            tool_timeout_ms: 10 * 60 * 1000,
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct McpServerConfig {
    pub name: String,
    pub enabled: bool,
    pub address: String,
    pub transport: String, // "stdio" or "http"
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            enabled: false,
            address: "127.0.0.1:8000".to_string(),
            transport: "http".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub project_root: Option<PathBuf>,
    pub system_prompt: Option<String>,
    pub llm: Option<PartialLlmConfig>,
    pub agent: Option<PartialAgentConfig>,
    pub mcp_servers: Option<Vec<PartialMcpServerConfig>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialLlmConfig {
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_base_ms: Option<u64>,
    pub retry_jitter_ms: Option<u64>,
    pub respect_retry_after: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialAgentConfig {
    pub max_tool_rounds: Option<usize>,
    pub compact_keep_messages: Option<usize>,
    pub short_response_followup_chars: Option<usize>,
    pub token_update_interval_ms: Option<u64>,
    pub tool_timeout_ms: Option<u64>,
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialMcpServerConfig {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub address: Option<String>,
    pub transport: Option<String>,
}

/// Values taken from the command line; `None` defers to env and files.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub max_tool_rounds: Option<usize>,
    pub no_stream: bool,
}

impl PartialLlmConfig {
    fn or(self, other: PartialLlmConfig) -> PartialLlmConfig {
        PartialLlmConfig {
            connect_timeout_ms: self.connect_timeout_ms.or(other.connect_timeout_ms),
            request_timeout_ms: self.request_timeout_ms.or(other.request_timeout_ms),
            max_retries: self.max_retries.or(other.max_retries),
            retry_base_ms: self.retry_base_ms.or(other.retry_base_ms),
            retry_jitter_ms: self.retry_jitter_ms.or(other.retry_jitter_ms),
            respect_retry_after: self.respect_retry_after.or(other.respect_retry_after),
        }
    }

    fn resolve(self) -> LlmConfig {
        let d = LlmConfig::default();
        LlmConfig {
            connect_timeout_ms: self.connect_timeout_ms.unwrap_or(d.connect_timeout_ms),
            request_timeout_ms: self.request_timeout_ms.unwrap_or(d.request_timeout_ms),
            max_retries: self.max_retries.unwrap_or(d.max_retries),
            retry_base_ms: self.retry_base_ms.unwrap_or(d.retry_base_ms),
            retry_jitter_ms: self.retry_jitter_ms.unwrap_or(d.retry_jitter_ms),
            respect_retry_after: self.respect_retry_after.unwrap_or(d.respect_retry_after),
        }
    }
}

impl PartialAgentConfig {
    fn or(self, other: PartialAgentConfig) -> PartialAgentConfig {
        PartialAgentConfig {
            max_tool_rounds: self.max_tool_rounds.or(other.max_tool_rounds),
            compact_keep_messages: self.compact_keep_messages.or(other.compact_keep_messages),
            short_response_followup_chars: self
                .short_response_followup_chars
                .or(other.short_response_followup_chars),
            token_update_interval_ms: self
                .token_update_interval_ms
                .or(other.token_update_interval_ms),
            tool_timeout_ms: self.tool_timeout_ms.or(other.tool_timeout_ms),
            stream: self.stream.or(other.stream),
        }
    }

    fn resolve(self) -> AgentConfig {
        let d = AgentConfig::default();
        AgentConfig {
            max_tool_rounds: self.max_tool_rounds.unwrap_or(d.max_tool_rounds),
            compact_keep_messages: self.compact_keep_messages.unwrap_or(d.compact_keep_messages),
            short_response_followup_chars: self
                .short_response_followup_chars
                .unwrap_or(d.short_response_followup_chars),
            token_update_interval_ms: self
                .token_update_interval_ms
                .unwrap_or(d.token_update_interval_ms),
            tool_timeout_ms: self.tool_timeout_ms.unwrap_or(d.tool_timeout_ms),
            stream: self.stream.unwrap_or(d.stream),
        }
    }
}

impl AppConfig {
    /// Resolves the configuration. Priority: CLI, environment, project
    /// config, global config, defaults.
    pub fn load(cli: CliOverrides) -> Result<Self> {
        let cwd = std::env::current_dir().context("resolve current dir")?;
        let project_cfg = load_project_config(&cwd).unwrap_or_default();
        let file_cfg = load_file_config().unwrap_or_default();
        Ok(Self::merge(cli, EnvConfig::from_env(), project_cfg, file_cfg, cwd))
    }

    fn merge(
        cli: CliOverrides,
        env: EnvConfig,
        project_cfg: FileConfig,
        file_cfg: FileConfig,
        cwd: PathBuf,
    ) -> Self {
        let api_key = cli
            .api_key
            .or(env.api_key)
            .or(project_cfg.api_key)
            .or(file_cfg.api_key);
        let base_url = cli
            .base_url
            .or(env.base_url)
            .or(project_cfg.base_url)
            .or(file_cfg.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = cli
            .model
            .or(env.model)
            .or(project_cfg.model)
            .or(file_cfg.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let project_root = project_cfg
            .project_root
            .or(file_cfg.project_root)
            .unwrap_or(cwd);
        let system_prompt = project_cfg.system_prompt.or(file_cfg.system_prompt);

        let llm = project_cfg
            .llm
            .unwrap_or_default()
            .or(file_cfg.llm.unwrap_or_default())
            .resolve();

        let mut agent = PartialAgentConfig {
            max_tool_rounds: cli.max_tool_rounds.or(env.max_tool_rounds),
            stream: cli.no_stream.then_some(false),
            ..Default::default()
        }
        .or(project_cfg.agent.unwrap_or_default())
        .or(file_cfg.agent.unwrap_or_default())
        .resolve();
        if agent.max_tool_rounds == 0 {
            warn!("max_tool_rounds of 0 would forbid every tool call; using 1");
            agent.max_tool_rounds = 1;
        }

        let mcp_servers = merge_mcp_servers(
            file_cfg.mcp_servers.unwrap_or_default(),
            project_cfg.mcp_servers.unwrap_or_default(),
        );

        Self {
            base_url,
            model,
            api_key,
            project_root,
            system_prompt,
            llm,
            agent,
            mcp_servers,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EnvConfig {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    max_tool_rounds: Option<usize>,
}

impl EnvConfig {
    fn from_env() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: std::env::var("OPENAI_BASE_URL").ok(),
            model: std::env::var("OPENAI_MODEL").ok(),
            max_tool_rounds: std::env::var("CODETURN_MAX_TOOL_ROUNDS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// Project entries override global entries with the same name.
fn merge_mcp_servers(
    global: Vec<PartialMcpServerConfig>,
    project: Vec<PartialMcpServerConfig>,
) -> Vec<McpServerConfig> {
    let mut merged = global;
    for project_server in project {
        let existing = project_server
            .name
            .as_ref()
            .and_then(|name| merged.iter_mut().find(|s| s.name.as_ref() == Some(name)));
        match existing {
            Some(existing) => {
                if let Some(enabled) = project_server.enabled {
                    existing.enabled = Some(enabled);
                }
                if let Some(address) = project_server.address {
                    existing.address = Some(address);
                }
                if let Some(transport) = project_server.transport {
                    existing.transport = Some(transport);
                }
            }
            None => merged.push(project_server),
        }
    }

    let defaults = McpServerConfig::default();
    merged
        .into_iter()
        .map(|partial| McpServerConfig {
            name: partial.name.unwrap_or_else(|| defaults.name.clone()),
            enabled: partial.enabled.unwrap_or(defaults.enabled),
            address: partial.address.unwrap_or_else(|| defaults.address.clone()),
            transport: partial
                .transport
                .unwrap_or_else(|| defaults.transport.clone()),
        })
        .collect()
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut v = Vec::new();
    if let Ok(p) = std::env::var("CODETURN_CONFIG") {
        v.push(PathBuf::from(p));
    }
    if let Ok(xdg_home) = std::env::var("XDG_CONFIG_HOME") {
        v.push(Path::new(&xdg_home).join("codeturn/config.toml"));
    } else if let Some(config_dir) = dirs::config_dir() {
        v.push(config_dir.join("codeturn/config.toml"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".config/codeturn/config.toml"));
    }
    v
}

pub fn load_file_config() -> Result<FileConfig> {
    for p in candidate_paths() {
        if p.exists() {
            let s = fs::read_to_string(&p)
                .with_context(|| format!("read config file: {}", p.display()))?;
            match toml::from_str::<FileConfig>(&s) {
                Ok(cfg) => {
                    info!(path=%p.display(), "loaded config file");
                    return Ok(cfg);
                }
                Err(e) => {
                    warn!(path=%p.display(), error=%e.to_string(), "parse config failed");
                    continue;
                }
            }
        }
    }
    Ok(FileConfig::default())
}

/// Load project-specific configuration from .codeturn/config.toml
pub fn load_project_config(project_root: &Path) -> Result<FileConfig> {
    let project_config_path = project_root.join(".codeturn").join("config.toml");

    if !project_config_path.exists() {
        return Ok(FileConfig::default());
    }
    let s = fs::read_to_string(&project_config_path).with_context(|| {
        format!(
            "read project config file: {}",
            project_config_path.display()
        )
    })?;
    match toml::from_str::<FileConfig>(&s) {
        Ok(cfg) => {
            info!(path=%project_config_path.display(), "loaded project config file");
            Ok(cfg)
        }
        Err(e) => {
            warn!(path=%project_config_path.display(), error=%e.to_string(), "parse project config failed");
            Ok(FileConfig::default())
        }
    }
}
