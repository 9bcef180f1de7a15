//! Tandem - run a configured agent from the command line
//!
//! Loads an agent catalog, runs one invocation against a prompt, and prints
//! the answer. Ctrl-C cancels at the next iteration boundary.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tandem_core::acp::ClientRegistry;
use tandem_core::agent::events::{EVENT_TOOL_END, EVENT_TOOL_START};
use tandem_core::ai::openai::OpenAiProvider;
use tandem_core::ai::ProviderRegistry;
use tandem_core::config::AgentCatalog;
use tandem_core::tools::tool_kind;
use tandem_core::{AgentCallbacks, AgentConfig, AgentLoop, Message, ModelConfig, Role};

mod tools;

/// Tandem - agent runner
#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Run a configured agent against a prompt", long_about = None)]
struct Cli {
    /// Agent catalog file (TOML)
    #[arg(short, long, default_value = "agents.toml")]
    config: PathBuf,

    /// Agent to run; optional when the catalog defines exactly one
    #[arg(short, long)]
    agent: Option<String>,

    /// Stream model output as it arrives
    #[arg(long)]
    stream: bool,

    /// Per-tool timeout in seconds
    #[arg(long, default_value_t = 120)]
    tool_timeout: u64,

    /// Print the final conversation as JSON
    #[arg(long)]
    json: bool,

    /// List the catalog's agents and exit
    #[arg(long)]
    list: bool,

    /// Prompt text; read from stdin when omitted
    prompt: Vec<String>,
}

/// Prints streamed text to stdout and tool activity to stderr
#[derive(Default)]
struct ConsolePrinter {
    streamed: AtomicBool,
}

#[async_trait]
impl AgentCallbacks for ConsolePrinter {
    async fn emit(&self, event: &str, payload: &Value) -> Option<Value> {
        let call = &payload["toolCall"];
        match event {
            EVENT_TOOL_START => {
                let name = call["name"].as_str().unwrap_or("?");
                eprintln!("→ [{}] {} {}", tool_kind(name).as_str(), name, call["args"]);
            }
            EVENT_TOOL_END => {
                let status = if call["error"].is_string() { "failed" } else { "done" };
                eprintln!(
                    "← {} {} ({}ms)",
                    call["name"].as_str().unwrap_or("?"),
                    status,
                    call["durationMs"].as_u64().unwrap_or(0)
                );
            }
            _ => {}
        }
        None
    }

    async fn on_chunk(&self, content: &str) {
        self.streamed.store(true, Ordering::SeqCst);
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(content.as_bytes());
        let _ = stdout.flush();
    }
}

fn pick_agent(catalog: &AgentCatalog, requested: Option<&str>) -> Result<AgentConfig> {
    if let Some(name) = requested {
        return catalog
            .agent(name)
            .cloned()
            .ok_or_else(|| anyhow!("no agent named '{}' in catalog", name));
    }

    let names: Vec<&str> = catalog.agent_names().collect();
    match names.as_slice() {
        [only] => catalog
            .agent(only)
            .cloned()
            .ok_or_else(|| anyhow!("agent '{}' vanished", only)),
        [] => bail!("catalog defines no agents"),
        _ => bail!("several agents defined, pick one with --agent: {}", names.join(", ")),
    }
}

fn read_prompt(words: &[String]) -> Result<String> {
    if !words.is_empty() {
        return Ok(words.join(" "));
    }
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("failed to read prompt from stdin")?;
    let text = text.trim().to_string();
    if text.is_empty() {
        bail!("no prompt given");
    }
    Ok(text)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tandem=info,tandem_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let builtin = tools::builtin_tools();
    let catalog = AgentCatalog::load(&cli.config, &builtin).await?;

    if cli.list {
        for name in catalog.agent_names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut agent = pick_agent(&catalog, cli.agent.as_deref())?;
    if cli.stream {
        if let Some(model) = &agent.model {
            agent.model = Some(Arc::new(ModelConfig {
                stream: true,
                ..ModelConfig::clone(model)
            }));
        }
    }
    let prompt = read_prompt(&cli.prompt)?;
    tracing::debug!(agent = %agent.name, config = %cli.config.display(), stream = cli.stream, "Running agent");

    let providers = ProviderRegistry::new().with(Arc::new(OpenAiProvider::new()));
    let registry = Arc::new(ClientRegistry::default());
    let agent_loop = AgentLoop::new(Arc::new(providers))
        .with_external_registry(Arc::clone(&registry))
        .with_tool_timeout(Duration::from_secs(cli.tool_timeout));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancelling...");
            on_interrupt.cancel();
        }
    });

    let printer = Arc::new(ConsolePrinter::default());
    let outcome = agent_loop
        .execute(
            vec![Message::user(prompt)],
            &agent,
            Some(printer.clone() as Arc<dyn AgentCallbacks>),
            &cancel,
        )
        .await;
    registry.shutdown().await;

    match outcome {
        Ok(run) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&run.conversation)?);
            } else if printer.streamed.load(Ordering::SeqCst) {
                println!();
            } else if let Some(answer) = run
                .conversation
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
            {
                println!("{}", answer.content);
            }
            eprintln!(
                "[{}] {} in / {} out tokens, {:.1}s",
                run.result.stop_reason,
                run.result.usage.prompt_tokens,
                run.result.usage.completion_tokens,
                run.result.duration.as_secs_f64()
            );
            Ok(())
        }
        Err(failure) => {
            if cli.json {
                if let Some(conversation) = &failure.conversation {
                    println!("{}", serde_json::to_string_pretty(conversation)?);
                }
            }
            Err(anyhow!(failure).context(format!("agent '{}' stopped", agent.name)))
        }
    }
}
