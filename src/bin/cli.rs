// CLI binary: exiting on unrecoverable errors is standard for CLI tools.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use scene_bridge::agent::{AgentLoop, AgentState};
use scene_bridge::approval::{ApprovalDecision, ApprovalRequest, Approver, AutoApprove, ChannelApprover};
use scene_bridge::audit::AuditLog;
use scene_bridge::bridge::EngineBridge;
use scene_bridge::chat::ChatEmitter;
use scene_bridge::llm::HttpModelClient;
use scene_bridge::logging::{self, Profile};
use scene_bridge::project;
use scene_bridge::registry::{Registry, ToolContext, ToolOutcome};
use scene_bridge::security;
use scene_bridge::settings::{self, BridgeSettings};
use scene_bridge::state::SceneStore;
use scene_bridge::transport::{self, EngineProcess};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "scene-bridge-cli", about = "Headless scene bridge CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory override
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Output raw JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,

    /// Human-readable debug logs on stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    /// JSON logs on stderr
    #[arg(long, global = true, conflicts_with = "verbose")]
    log_json: bool,
}

#[derive(clap::Args)]
struct EngineArgs {
    /// Engine executable speaking NDJSON on stdio
    #[arg(long)]
    engine: String,

    /// Extra argument for the engine (repeatable)
    #[arg(long = "engine-arg")]
    engine_args: Vec<String>,

    /// Scene document to seed the local mirror with
    #[arg(long)]
    document: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List every command in the manifest
    Commands,
    /// Show help for a category or command
    Help { topic: Option<String> },
    /// Print the tool schema (manifest plus category and kind)
    Schema,
    /// Run the security gate over a scene document
    Validate { document: PathBuf },
    /// Run one command against a live engine
    Run {
        #[command(flatten)]
        engine: EngineArgs,
        command: String,
        /// JSON object of command arguments
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Send a message to the agent with a live engine attached
    Chat {
        #[command(flatten)]
        engine: EngineArgs,
        message: String,
        /// Approve every tool batch without asking
        #[arg(long, short)]
        yes: bool,
    },
}

// ── State initialization ─────────────────────────────────────────

fn dirs_config_dir() -> PathBuf {
    let base = if cfg!(target_os = "windows") {
        std::env::var("APPDATA")
            .map_or_else(|_| PathBuf::from("C:\\Users\\Default\\AppData\\Roaming"), PathBuf::from)
    } else if cfg!(target_os = "macos") {
        dirs_home().join("Library/Application Support")
    } else {
        std::env::var("XDG_CONFIG_HOME")
            .map_or_else(|_| dirs_home().join(".config"), PathBuf::from)
    };
    base.join(scene_bridge::paths::APP_ID)
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_or_else(|_| PathBuf::from("."), PathBuf::from)
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

fn build_registry() -> Registry {
    let registry = Registry::builtin().unwrap_or_else(|e| fail(e));
    for m in registry.binding_mismatches() {
        eprintln!(
            "[scene-bridge] warning: '{}' params disagree with the manifest (typed {:?}, manifest {:?})",
            m.command, m.typed_required, m.manifest_required
        );
    }
    registry
}

/// A live session: engine child, bridge, local mirror and a context to run
/// commands in.
struct Session {
    ctx: ToolContext,
    engine: EngineProcess,
}

async fn start_session(registry: &Registry, settings: BridgeSettings, args: &EngineArgs) -> Session {
    let store = Arc::new(SceneStore::new());
    let bridge = Arc::new(EngineBridge::new(settings.dispatch.clone()));
    store.follow_events(&bridge);
    let engine =
        transport::spawn_engine(&args.engine, &args.engine_args, &bridge).unwrap_or_else(|e| fail(e));
    let mut status = bridge.connection_status();
    while !bridge.is_connected() {
        if status.changed().await.is_err() {
            fail("engine exited before connecting");
        }
    }
    let ctx = registry.context(store, bridge, Arc::new(settings));
    if let Some(path) = &args.document {
        // Through the engine so both sides start from the same document.
        let loaded = registry
            .invoke("load_document", json!({ "path": path.to_string_lossy() }), &ctx)
            .await
            .unwrap_or_else(|e| fail(e));
        if !loaded.success {
            fail(loaded.message);
        }
    }
    Session { ctx, engine }
}

// ── Output formatting ────────────────────────────────────────────

fn print_outcome(outcome: &ToolOutcome, raw_json: bool) {
    if raw_json {
        println!("{}", serde_json::to_string_pretty(outcome).unwrap_or_default());
        return;
    }
    let (text, _) = outcome.render_for_model();
    println!("{text}");
    if let Some(data) = &outcome.result {
        match data {
            Value::Null => {}
            Value::String(s) => println!("{s}"),
            other => println!("{}", serde_json::to_string_pretty(other).unwrap_or_default()),
        }
    }
}

/// Streams agent progress to stderr, leaving stdout for the final reply.
struct ConsoleEmitter {
    raw_json: bool,
}

impl ChatEmitter for ConsoleEmitter {
    fn emit_state(&self, state: AgentState) {
        if self.raw_json {
            return;
        }
        if state == AgentState::AwaitingModel {
            eprintln!("[agent] thinking...");
        }
    }
    fn emit_token(&self, text: &str) {
        if !self.raw_json {
            eprintln!("{text}");
        }
    }
    fn emit_tool_call(&self, tool: &str, input: &Value) {
        eprintln!("[tool] {tool} {input}");
    }
    fn emit_tool_result(&self, tool: &str, result: &str, is_error: bool) {
        let mark = if is_error { "failed" } else { "ok" };
        eprintln!("[tool] {tool} {mark}: {result}");
    }
    fn emit_approval(&self, request: &ApprovalRequest) {
        eprintln!(
            "[review] turn {}: {} call(s). {}",
            request.turn,
            request.calls.len(),
            request.report.summary()
        );
    }
    fn emit_complete(&self, truncated: bool) {
        if truncated {
            eprintln!("[agent] stopped at the iteration limit");
        }
    }
    fn emit_error(&self, message: &str) {
        eprintln!("[agent] error: {message}");
    }
}

/// Ask on stdin for every batch the agent wants to run.
fn console_approver() -> Arc<dyn Approver> {
    let (approver, mut requests) = ChannelApprover::new(1);
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        while let Some((request, reply)) = requests.recv().await {
            for call in &request.calls {
                eprintln!("  {} {}", call.name, call.input);
            }
            eprint!("Run these? [y/N] ");
            let answer = stdin.next_line().await.ok().flatten().unwrap_or_default();
            let decision = if matches!(answer.trim(), "y" | "Y" | "yes") {
                ApprovalDecision::Approve
            } else {
                ApprovalDecision::reject("declined at the console")
            };
            let _ = reply.send(decision);
        }
    });
    Arc::new(approver)
}

fn load_settings(config_dir: &Path) -> BridgeSettings {
    settings::load_settings(config_dir).unwrap_or_else(|e| fail(format!("bad settings file: {e}")))
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let profile = if cli.verbose {
        Profile::Development
    } else if cli.log_json {
        Profile::Production
    } else {
        Profile::Quiet
    };
    logging::init(profile);

    let config_dir = cli.config_dir.clone().unwrap_or_else(dirs_config_dir);
    let registry = Arc::new(build_registry());

    match cli.command {
        Commands::Commands => {
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&registry.catalog().to_json_schema()).unwrap_or_default()
                );
            } else {
                for c in registry.manifest().iter() {
                    println!("{:<28} {}", c.name, c.description);
                }
            }
        }
        Commands::Help { topic } => {
            println!("{}", registry.catalog().help_text(topic.as_deref()));
        }
        Commands::Schema => {
            println!(
                "{}",
                serde_json::to_string_pretty(&registry.catalog().to_json_schema()).unwrap_or_default()
            );
        }
        Commands::Validate { document } => {
            let settings = load_settings(&config_dir);
            let doc = project::load_document(&document).unwrap_or_else(|e| fail(e));
            let report = security::validate(&doc.scene, &doc.scripts, &settings.security);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
            } else {
                println!("{}", report.summary());
                for issue in &report.issues {
                    println!("  [{:?}] {}: {}", issue.severity, issue.issue_kind.as_str(), issue.message);
                }
            }
            if !report.healthy {
                process::exit(2);
            }
        }
        Commands::Run {
            engine,
            command,
            params,
        } => {
            let args: Value = serde_json::from_str(&params)
                .unwrap_or_else(|e| fail(format!("--params is not valid JSON: {e}")));
            let settings = load_settings(&config_dir);
            let session = start_session(&registry, settings, &engine).await;
            let outcome = registry.invoke(&command, args, &session.ctx).await;
            session.engine.shutdown().await;
            match outcome {
                Ok(outcome) => {
                    print_outcome(&outcome, cli.json);
                    if !outcome.success {
                        process::exit(1);
                    }
                }
                Err(e) => fail(e),
            }
        }
        Commands::Chat {
            engine,
            message,
            yes,
        } => {
            let settings = load_settings(&config_dir);
            let model = HttpModelClient::from_config(&settings.llm).unwrap_or_else(|e| fail(e));
            let session = start_session(&registry, settings, &engine).await;
            let approver: Arc<dyn Approver> = if yes {
                Arc::new(AutoApprove)
            } else {
                console_approver()
            };
            let mut agent = AgentLoop::new(Arc::clone(&registry), session.ctx.clone(), Arc::new(model))
                .with_approver(approver)
                .with_emitter(Arc::new(ConsoleEmitter { raw_json: cli.json }))
                .with_audit(AuditLog::new(config_dir.clone()));

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                }
            });

            let outcome = agent.send_message(&message, cancel).await;
            session.engine.shutdown().await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome).unwrap_or_default());
            } else if !outcome.reply.is_empty() {
                println!("{}", outcome.reply);
            }
            match outcome.state {
                AgentState::Done => {}
                AgentState::Cancelled => process::exit(130),
                _ => process::exit(1),
            }
        }
    }
}
