//! Sandbox-side entrypoint, compiled into the agent container image. Reads
//! one JSON invocation from stdin, runs the function-calling loop, and emits
//! exactly one framed reply on stdout. Everything else goes to stderr.

use nanoclaw::agent::{self, AgentEnv};
use nanoclaw::llm::GeminiClient;
use nanoclaw::wire::{self, ContainerInput, ContainerOutput};
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut raw = String::new();
    if let Err(error) = tokio::io::stdin().read_to_string(&mut raw).await {
        emit(&ContainerOutput::failure(format!(
            "failed to read stdin: {error}"
        )));
        return;
    }

    let output = match serde_json::from_str::<ContainerInput>(&raw) {
        Err(error) => ContainerOutput::failure(format!("invalid container input: {error}")),
        Ok(input) => match GeminiClient::from_env() {
            Err(error) => ContainerOutput::failure(error.to_string()),
            Ok(client) => agent::run(&AgentEnv::default(), &client, input).await,
        },
    };

    emit(&output);
}

fn emit(output: &ContainerOutput) {
    match wire::emit_framed(output) {
        Ok(framed) => print!("{framed}"),
        Err(error) => {
            eprintln!("failed to frame output: {error}");
            std::process::exit(1);
        }
    }
}
