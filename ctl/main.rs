#![forbid(unsafe_code)]

//! `happyd-ctl` — local CLI companion for `happyd`.
//!
//! Talks to the daemon's HTTP API on localhost. Designed for quick
//! operator checks when the full CLI is not at hand.
//!
//! Exit codes: 0 success, 1 failure, 3 daemon unreachable.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "happyd-ctl", about = "Local control CLI for happyd", version, long_about = None)]
struct Cli {
    /// HTTP port of the running daemon.
    #[arg(long, default_value_t = 3333)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show daemon status.
    Status,
    /// Stop the daemon.
    Stop,
    /// List pending permission prompts.
    Prompts,
    /// Allow a pending permission prompt.
    Allow {
        /// Prompt id.
        id: String,
    },
    /// Deny a pending permission prompt.
    Deny {
        /// Prompt id.
        id: String,
    },
    /// Abort the current in-flight turn.
    Abort,
}

fn main() -> ExitCode {
    let args = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to build runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(args))
}

async fn run(args: Cli) -> ExitCode {
    let base = format!("http://127.0.0.1:{}", args.port);
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => client,
        Err(err) => {
            eprintln!("failed to build http client: {err}");
            return ExitCode::FAILURE;
        }
    };

    let request = match &args.command {
        Command::Status => client.get(format!("{base}/api/status")),
        Command::Stop => client.post(format!("{base}/api/shutdown")).json(&serde_json::json!({})),
        Command::Prompts => client.get(format!("{base}/api/ai/permissions")),
        Command::Allow { id } => client
            .post(format!("{base}/api/ai/permission/allow"))
            .json(&serde_json::json!({ "prompt_id": id })),
        Command::Deny { id } => client
            .post(format!("{base}/api/ai/permission/deny"))
            .json(&serde_json::json!({ "prompt_id": id })),
        Command::Abort => {
            client.post(format!("{base}/api/ai/abort")).json(&serde_json::json!({}))
        }
    };

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            eprintln!("cannot reach happyd on port {}: {err}", args.port);
            return ExitCode::from(3);
        }
    };

    let status = response.status();
    match response.json::<serde_json::Value>().await {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            if status.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            eprintln!("unexpected response: {err}");
            ExitCode::FAILURE
        }
    }
}
