use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use agent_core::message::{
    CompletionResponse,
    StopReason,
    ToolCall,
    Usage,
};
use agent_core::model::mock::MockModel;
use agent_core::{
    Agent,
    AgentConfig,
    CoordinatorConfig,
    McpCoordinator,
    ToolFilter,
    ToolMode,
};
use clap::Args;
use eyre::{
    Result,
    bail,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    info,
    warn,
};

use crate::config::AgentConfigFile;

#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Path to a TOML config file describing MCP servers and default policy.
    #[arg(long)]
    config: Option<PathBuf>,
    /// The initial prompt.
    prompt: Vec<String>,
}

impl RunArgs {
    pub async fn execute(self) -> Result<ExitCode> {
        let config = match &self.config {
            Some(path) => AgentConfigFile::load(path).await?,
            None => AgentConfigFile::default(),
        };

        let coordinator = McpCoordinator::new(CoordinatorConfig::default());

        let specs = config.server_specs();
        let tools = if specs.is_empty() {
            Vec::new()
        } else {
            let outcome = coordinator.start_all_and_wait(specs).await;
            for server_id in &outcome.failed {
                warn!(%server_id, "MCP server failed to connect, its tools are unavailable this run");
            }
            ToolMode::new("default", ToolFilter::Any).tools::<()>(&coordinator, Some(std::time::Duration::from_secs(10)), 1).await
        };

        let prompt = self.prompt.join(" ");
        let model = Arc::new(build_demo_model(&prompt, &tools));

        let agent = Agent::new(model, AgentConfig {
            system_prompt: Some("You are a helpful coding assistant.".to_string()),
            tools,
            max_iterations: 10,
            usage_limits: config.limits.into(),
            retry_policy: config.retry.into(),
            ..AgentConfig::default()
        });

        info!(%prompt, "starting run");
        match agent.run(Arc::new(()), prompt, CancellationToken::new()).await {
            Ok(output) => {
                println!("{output}");
                Ok(ExitCode::SUCCESS)
            },
            Err(e) => bail!("agent run failed: {e}"),
        }
    }
}

/// Builds a [`MockModel`] scripted to demonstrate both code paths the demo
/// cares about: a single tool call when any tool is available, followed by a
/// plain text answer, or a direct text answer when there are none. A real
/// provider integration is out of scope for this crate; see the `Model`
/// trait for what one would implement instead.
fn build_demo_model(prompt: &str, tools: &[agent_core::tool::BoxedTool<()>]) -> MockModel {
    let model = MockModel::new();
    match tools.first() {
        Some(tool) => model
            .with_response(CompletionResponse {
                content: None,
                refusal: None,
                tool_calls: vec![ToolCall {
                    id: "demo-call-1".to_string(),
                    name: tool.name.clone(),
                    arguments: "{}".to_string(),
                }],
                stop_reason: StopReason::ToolUse,
                usage: Usage {
                    input_tokens: 40,
                    output_tokens: 12,
                },
            })
            .with_response(CompletionResponse {
                content: Some(format!("Ran {} in response to: {prompt}", tool.name)),
                refusal: None,
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 60,
                    output_tokens: 20,
                },
            }),
        None => model.with_response(CompletionResponse {
            content: Some(format!("Echo: {prompt}")),
            refusal: None,
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 20,
                output_tokens: 8,
            },
        }),
    }
}
