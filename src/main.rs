use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use dotenvy::dotenv;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use codeturn::agent::{AbortHandle, ChatEntry, EntryKind, StreamChunk, TurnEngine};
use codeturn::config::{AppConfig, CliOverrides};
use codeturn::llm::OpenAIClient;
use codeturn::logging::init_logging;
use codeturn::mcp::McpManager;
use codeturn::tools::ToolRegistry;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "codeturn",
    version,
    about = "Conversational coding agent for OpenAI-compatible backends"
)]
struct Cli {
    /// OpenAI-compatible API base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Model name
    #[arg(long)]
    model: Option<String>,

    /// API key (set via env OPENAI_API_KEY recommended)
    #[arg(long)]
    api_key: Option<String>,

    /// Log level (error,warn,info,debug,trace)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Request whole responses instead of streaming them
    #[arg(long, action = ArgAction::SetTrue)]
    no_stream: bool,

    /// Maximum tool rounds per turn
    #[arg(long)]
    max_tool_rounds: Option<usize>,

    /// Print stream chunks as JSON lines
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Run a single turn with this prompt and exit
    prompt: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_file.as_deref())?;

    let cfg = AppConfig::load(CliOverrides {
        base_url: cli.base_url.clone(),
        model: cli.model.clone(),
        api_key: cli.api_key.clone(),
        max_tool_rounds: cli.max_tool_rounds,
        no_stream: cli.no_stream,
    })?;
    info!(base_url = %cfg.base_url, model = %cfg.model, root = %cfg.project_root.display(), "app config");

    let mut engine = build_engine(&cfg)?;
    spawn_ctrl_c(engine.abort_handle());

    match cli.prompt {
        Some(prompt) => run_once(&mut engine, prompt, cli.json).await,
        None => run_repl(&mut engine, cli.json).await,
    }
}

fn build_engine(cfg: &AppConfig) -> Result<TurnEngine> {
    let Some(api_key) = cfg.api_key.clone() else {
        bail!("OPENAI_API_KEY not set; pass --api-key or set it in the environment");
    };
    let client = OpenAIClient::new(cfg.base_url.clone(), api_key, cfg.model.clone())
        .context("create backend client")?
        .with_llm_config(cfg.llm.clone());

    let mut tools = ToolRegistry::builtin(cfg.project_root.clone());
    let mcp = McpManager::new(cfg.mcp_servers.clone());
    if mcp.has_enabled_servers() {
        tools = tools.with_plugins(Arc::new(mcp));
    }

    let mut engine = TurnEngine::new(Arc::new(client), tools, cfg.agent.clone());
    if let Some(prompt) = &cfg.system_prompt {
        engine = engine.with_system_prompt(prompt.clone());
    }
    Ok(engine)
}

/// Ctrl-C cancels the running turn; with no turn in flight it exits.
fn spawn_ctrl_c(handle: AbortHandle) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            if !handle.abort() {
                std::process::exit(130);
            }
        }
    });
}

async fn run_once(engine: &mut TurnEngine, prompt: String, json: bool) -> Result<()> {
    let mut stream = Box::pin(engine.process_message_stream(prompt));
    let mut out = io::stdout();
    while let Some(chunk) = stream.next().await {
        if json {
            writeln!(out, "{}", serde_json::to_string(&chunk)?)?;
            continue;
        }
        match chunk {
            StreamChunk::Content { content } => write!(out, "{content}")?,
            StreamChunk::ToolCalls { tool_calls } => {
                for call in tool_calls {
                    writeln!(out, "\n[tool] {} {}", call.name(), call.function.arguments)?;
                }
            }
            StreamChunk::ToolResult { name, result, .. } => {
                let status = if result.success { "ok" } else { "failed" };
                writeln!(out, "[tool] {name} {status}")?;
            }
            StreamChunk::TokenCount { .. } => {}
            StreamChunk::Done { message } => {
                writeln!(out)?;
                if let Some(message) = message {
                    writeln!(out, "{message}")?;
                }
            }
        }
        out.flush()?;
    }
    Ok(())
}

fn print_entries(entries: &[ChatEntry]) {
    // The user entry echoes what was just typed.
    for entry in entries
        .iter()
        .filter(|e| e.kind != EntryKind::User && !e.content.is_empty())
    {
        match entry.kind {
            EntryKind::ToolResult => {
                let name = entry.tool_call.as_ref().map(|c| c.name()).unwrap_or("tool");
                println!("[{name}]\n{}", entry.content);
            }
            _ => println!("{}", entry.content),
        }
    }
}

async fn run_repl(engine: &mut TurnEngine, json: bool) -> Result<()> {
    println!("codeturn - !<cmd> runs a shell command, /clear, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" | "/exit" => break,
            "/clear" => {
                engine.clear();
                println!("conversation cleared");
            }
            _ => {
                if let Some(cmd) = line.strip_prefix('!') {
                    let entries = engine.run_shell_command(cmd.trim()).await;
                    print_entries(&entries);
                } else {
                    run_once(engine, line.to_string(), json).await?;
                }
            }
        }
    }
    Ok(())
}
