use anyhow::Result;
use clap::{Parser, Subcommand};
use delve_core::{ProgressEvent, ProgressKind};
use tracing_subscriber::EnvFilter;

mod mcp;
#[cfg(test)]
mod testing;

use mcp::tools::{DeepArgs, QuickArgs, StatusArgs, Tools};

#[derive(Parser, Debug)]
#[command(name = "delve")]
#[command(about = "Deep research over a resumable agent stream (CLI + MCP stdio server)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server (for Cursor / MCP clients).
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Run a deep research task to completion and print the report.
    Deep(DeepCmd),
    /// Answer a question with one grounded model call.
    Quick(QuickCmd),
    /// Show the status of a research interaction.
    Status(StatusCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct DeepCmd {
    query: String,
    /// Critique the report and answer its gaps with follow-up questions.
    #[arg(long)]
    auto_refine: bool,
    /// Append a web-grounded fact-check section.
    #[arg(long)]
    grounded: bool,
    /// Output format guidance appended to the query.
    #[arg(long)]
    format_instructions: Option<String>,
    /// File Search store name (repeatable).
    #[arg(long = "file-search-store")]
    file_search_store_names: Vec<String>,
    /// Wall-clock ceiling in seconds (default: DELVE_TIMEOUT_SECS).
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct QuickCmd {
    query: String,
    /// minimal|low|medium|high|max|dynamic, or a token count.
    #[arg(long, default_value = "medium")]
    thinking: String,
    #[arg(long)]
    include_thoughts: bool,
    #[arg(long)]
    model: Option<String>,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct StatusCmd {
    interaction_id: String,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Opt-in `KEY=value` file named by `DELVE_ENV_FILE`. Never overrides the process
/// environment and never logs values.
fn load_env_file() {
    let Some(p) = std::env::var("DELVE_ENV_FILE")
        .ok()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
    else {
        return;
    };
    let Ok(txt) = std::fs::read_to_string(&p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let s = s.strip_prefix("export ").unwrap_or(s);
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches(|c| c == '"' || c == '\'');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

/// Logs go to stderr; stdout carries JSON output or the MCP protocol.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("DELVE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn wants_text(output: &str) -> bool {
    output.trim().eq_ignore_ascii_case("text")
}

/// Print a tool envelope. `ok=false` becomes a non-zero exit.
fn emit(payload: &serde_json::Value, text: Option<String>) -> Result<()> {
    let ok = payload["ok"].as_bool().unwrap_or(false);
    match text {
        Some(t) if ok => println!("{t}"),
        Some(_) => eprintln!(
            "error: {} ({})",
            payload["error"]["message"].as_str().unwrap_or("unknown error"),
            payload["error"]["code"].as_str().unwrap_or("unexpected_error")
        ),
        None => println!("{payload}"),
    }
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn print_progress(ev: &ProgressEvent) {
    let content = ev.content.as_deref().unwrap_or_default();
    match ev.kind {
        ProgressKind::Start => eprintln!(
            "[start] interaction {}",
            ev.interaction_id.as_deref().unwrap_or("?")
        ),
        ProgressKind::Thought => eprintln!("[thought] {content}"),
        ProgressKind::Status => eprintln!("[status] {content}"),
        ProgressKind::Text | ProgressKind::Complete | ProgressKind::Error => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            mcp::server::serve_stdio()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Deep(args) => {
            let text = wants_text(&args.output);
            let payload = Tools::from_env()
                .deep(
                    DeepArgs {
                        query: Some(args.query),
                        auto_refine: Some(args.auto_refine),
                        grounded: Some(args.grounded),
                        format_instructions: args.format_instructions,
                        file_search_store_names: Some(args.file_search_store_names),
                        timeout_secs: args.timeout_secs,
                    },
                    |ev: &ProgressEvent| {
                        if text {
                            print_progress(ev);
                        }
                    },
                )
                .await;
            let report = payload["text"].as_str().map(str::to_string);
            emit(&payload, text.then(|| report.unwrap_or_default()))?;
        }
        Commands::Quick(args) => {
            let text = wants_text(&args.output);
            let payload = Tools::from_env()
                .quick(QuickArgs {
                    query: Some(args.query),
                    thinking_level: Some(args.thinking),
                    include_thoughts: Some(args.include_thoughts),
                    model: args.model,
                    system_instruction: None,
                })
                .await;
            let rendered = text.then(|| {
                let mut out = payload["text"].as_str().unwrap_or_default().to_string();
                let sources = payload["sources"].as_array().cloned().unwrap_or_default();
                if !sources.is_empty() {
                    out.push_str("\n\nSources:\n");
                    for (i, s) in sources.iter().enumerate() {
                        out.push_str(&format!(
                            "{}. {} {}\n",
                            i + 1,
                            s["title"].as_str().unwrap_or_default(),
                            s["uri"].as_str().unwrap_or_default()
                        ));
                    }
                }
                out
            });
            emit(&payload, rendered)?;
        }
        Commands::Status(args) => {
            let text = wants_text(&args.output);
            let payload = Tools::from_env()
                .status(StatusArgs {
                    interaction_id: Some(args.interaction_id),
                })
                .await;
            let rendered = text.then(|| {
                let mut out = format!(
                    "{}: {}",
                    payload["interaction_id"].as_str().unwrap_or_default(),
                    payload["status"].as_str().unwrap_or("unknown")
                );
                if let Some(t) = payload["text"].as_str() {
                    out.push_str("\n\n");
                    out.push_str(t);
                }
                out
            });
            emit(&payload, rendered)?;
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": mcp::envelope::SCHEMA_VERSION,
                "kind": "version",
                "ok": true,
                "name": "delve",
                "version": env!("CARGO_PKG_VERSION"),
                "mcp_stdio": cfg!(feature = "stdio"),
            });
            if wants_text(&args.output) {
                println!("delve {}", env!("CARGO_PKG_VERSION"));
            } else {
                println!("{v}");
            }
        }
    }
    Ok(())
}
