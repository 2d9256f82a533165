//! engram-hooks
//!
//! Short-lived hook process: reads one JSON object from stdin, routes it
//! through the memory engine, writes one JSON object to stdout, and exits
//! 0 no matter what. With the `DEBUG` environment variable set, errors go
//! to stderr; otherwise the process is silent.

use std::io::Read;

use tracing_subscriber::EnvFilter;

mod hooks;
mod transcript;

use engram_core::ProjectRouter;
use hooks::{HookInput, HookOutput};

fn main() {
    if std::env::var("DEBUG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let output = run();
    // The host parses stdout as JSON; a serialization failure still must
    // produce an object
    let payload = serde_json::to_string(&output).unwrap_or_else(|_| "{}".to_string());
    println!("{}", payload);
    std::process::exit(0);
}

fn run() -> HookOutput {
    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        tracing::warn!("Failed to read stdin: {}", e);
        return HookOutput::empty();
    }
    if raw.trim().is_empty() {
        return HookOutput::empty();
    }

    let input: HookInput = match serde_json::from_str(&raw) {
        Ok(input) => input,
        Err(e) => {
            tracing::warn!("Malformed hook input: {}", e);
            return HookOutput::empty();
        }
    };

    let router = ProjectRouter::from_disk();
    hooks::handle(&router, input)
}
