use anyhow::{Context, Result, anyhow, bail};
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, ListToolsResult},
    service::RunningService,
    transport::{StreamableHttpClientTransport, TokioChildProcess},
};
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

use crate::config::McpServerConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A live connection to one MCP server.
pub struct McpClient {
    service: RunningService<rmcp::RoleClient, ()>,
    config: McpServerConfig,
}

impl McpClient {
    /// Connects using the configured transport. For `stdio` the address is the
    /// command line to spawn; for `http` it is the server URL.
    pub async fn from_config(config: &McpServerConfig) -> Result<Self> {
        let service = match config.transport.as_str() {
            "stdio" => {
                let mut parts = config.address.split_whitespace();
                let program = parts
                    .next()
                    .ok_or_else(|| anyhow!("empty command for stdio transport"))?;
                let mut cmd = Command::new(program);
                cmd.args(parts);
                let transport =
                    TokioChildProcess::new(cmd).context("spawn MCP server process")?;
                timeout(CONNECT_TIMEOUT, rmcp::service::serve_client((), transport))
                    .await
                    .map_err(|_| anyhow!("MCP connection timeout"))?
                    .map_err(|e| {
                        warn!(server = %config.name, error = ?e, "failed to initialize MCP client");
                        anyhow!("MCP initialize failed: {e}")
                    })?
            }
            "http" => {
                let transport = StreamableHttpClientTransport::from_uri(config.address.clone());
                timeout(CONNECT_TIMEOUT, rmcp::service::serve_client((), transport))
                    .await
                    .map_err(|_| anyhow!("MCP connection timeout"))?
                    .map_err(|e| {
                        warn!(server = %config.name, error = ?e, "failed to initialize MCP client");
                        anyhow!("MCP initialize failed: {e}")
                    })?
            }
            other => bail!("Unsupported transport type: {other}"),
        };
        info!(server = %config.name, transport = %config.transport, "connected to MCP server");
        Ok(Self {
            service,
            config: config.clone(),
        })
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult> {
        timeout(LIST_TIMEOUT, self.service.list_tools(Default::default()))
            .await
            .map_err(|_| anyhow!("List tools timeout"))?
            .map_err(|e| anyhow!("List tools error: {e:?}"))
    }

    pub async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult> {
        debug!(server = %self.config.name, tool = %params.name, args = ?params.arguments, "calling MCP tool");
        timeout(CALL_TIMEOUT, self.service.call_tool(params))
            .await
            .map_err(|_| anyhow!("Tool call timeout"))?
            .map_err(|e| anyhow!("Call tool error: {e:?}"))
    }

    pub fn server_name(&self) -> &str {
        &self.config.name
    }
}
