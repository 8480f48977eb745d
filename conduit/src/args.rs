use std::path::PathBuf;

use clap::{Parser, Subcommand};
use conduit_llm::Mode;

/// Conduit LLM client
#[derive(Debug, Parser)]
#[command(name = "conduit", about = "Stream chat completions from Google, OpenAI-compatible and Ollama providers")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "conduit.toml", env = "CONDUIT_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one prompt and stream the reply to stdout
    Chat {
        /// Provider name; the configured default when omitted
        #[arg(short, long, env = "CONDUIT_PROVIDER")]
        provider: Option<String>,

        /// Working mode for the system prompt
        #[arg(short, long, default_value_t = Mode::Code)]
        mode: Mode,

        /// Extra rules appended to the system prompt
        #[arg(long)]
        rules: Option<String>,

        /// Prompt text
        prompt: String,
    },
    /// Print provider capabilities and health as JSON
    Health,
}
