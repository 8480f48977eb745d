#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use args::{Args, Command};
use clap::Parser;
use conduit_config::Config;
use conduit_llm::{ChatRequest, Conduit, ConversationTurn, Mode, StreamEvent};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    let _telemetry_guard = conduit_telemetry::init(config.telemetry.as_ref(), "warn")?;

    tracing::debug!(config_path = %args.config.display(), "starting conduit");

    let conduit = Conduit::from_config(&config.llm)?;

    match args.command {
        Command::Chat {
            provider,
            mode,
            rules,
            prompt,
        } => chat(&conduit, provider.as_deref(), mode, rules, &prompt).await,
        Command::Health => {
            println!("{}", serde_json::to_string_pretty(&conduit.health())?);
            Ok(())
        }
    }
}

async fn chat(
    conduit: &Conduit,
    provider: Option<&str>,
    mode: Mode,
    rules: Option<String>,
    prompt: &str,
) -> anyhow::Result<()> {
    let client = conduit.resolve(provider)?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel_clone.cancel();
    });

    let mut request = ChatRequest::new(vec![ConversationTurn::user(prompt)])
        .with_mode(mode)
        .with_cancel(cancel);
    if let Some(rules) = rules {
        request = request.with_custom_rules(rules);
    }

    let mut stdout = tokio::io::stdout();
    let mut stream = client.send_message_stream(request);

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Text(text) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await?;
            }
            StreamEvent::FunctionCalls(calls) => {
                for call in calls {
                    let line = serde_json::to_string(&call)?;
                    stdout.write_all(format!("\n{line}\n").as_bytes()).await?;
                }
                stdout.flush().await?;
            }
            StreamEvent::Usage(usage) => {
                tracing::info!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "request complete"
                );
            }
        }
    }

    stdout.write_all(b"\n").await?;
    Ok(())
}

/// Wait for a shutdown signal (`SIGINT` or `SIGTERM`)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::debug!("shutdown signal received, cancelling request");
}
