//! Loads the demo CLI's TOML config: the set of MCP servers to launch plus
//! default usage limits and retry policy. Not required to use `agent-core`
//! directly — this is scaffolding for the binary only.

use std::collections::HashMap;
use std::path::Path;

use agent_core::{
    RetryPolicy,
    ServerSpec,
    UsageLimits,
};
use eyre::{
    Context,
    Result,
};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfigFile {
    pub servers: HashMap<String, ServerSpecFile>,
    pub limits: LimitsFile,
    pub retry: RetryFile,
}

impl AgentConfigFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config file at {}", path.display()))
    }

    pub fn server_specs(&self) -> HashMap<String, ServerSpec> {
        self.servers.iter().map(|(id, spec)| (id.clone(), spec.clone().into())).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerSpecFile {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Option<HashMap<String, String>>,
    },
    Http {
        url: String,
    },
    Oauth {
        url: String,
        redirect_scheme: String,
    },
}

impl From<ServerSpecFile> for ServerSpec {
    fn from(value: ServerSpecFile) -> Self {
        match value {
            ServerSpecFile::Stdio { command, args, env } => ServerSpec::Stdio { command, args, env },
            ServerSpecFile::Http { url } => ServerSpec::Http { url },
            ServerSpecFile::Oauth { url, redirect_scheme } => ServerSpec::OAuth { url, redirect_scheme },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LimitsFile {
    pub max_requests: Option<u32>,
    pub max_total_tokens: Option<u64>,
    pub max_tool_calls: Option<u32>,
}

impl Default for LimitsFile {
    fn default() -> Self {
        Self {
            max_requests: Some(20),
            max_total_tokens: None,
            max_tool_calls: Some(50),
        }
    }
}

impl From<LimitsFile> for UsageLimits {
    fn from(value: LimitsFile) -> Self {
        UsageLimits {
            max_requests: value.max_requests,
            max_total_tokens: value.max_total_tokens,
            max_tool_calls: value.max_tool_calls,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryFile {
    pub max_attempts: u32,
}

impl Default for RetryFile {
    fn default() -> Self {
        Self { max_attempts: RetryPolicy::default().max_attempts }
    }
}

impl From<RetryFile> for RetryPolicy {
    fn from(value: RetryFile) -> Self {
        RetryPolicy {
            max_attempts: value.max_attempts,
            ..RetryPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let raw = r#"
            [servers.fs]
            type = "stdio"
            command = "mcp-server-filesystem"
            args = ["--root", "."]
        "#;
        let parsed: AgentConfigFile = toml::from_str(raw).unwrap();
        assert_eq!(parsed.servers.len(), 1);
        assert!(matches!(parsed.servers["fs"], ServerSpecFile::Stdio { .. }));
    }
}
