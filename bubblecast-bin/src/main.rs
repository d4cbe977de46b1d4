use std::io::{self, Write};
use std::path::PathBuf;

use bubblecast_core::{
    config::{Config, Credentials, HttpCfg},
    consumer::{AnswerHandler, AskRequest, Outcome, StreamConsumer},
    http_client::HttpClient,
    server::{self, AppState},
};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "bubblecast chat relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// JSON or TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Ask a running server and print the answer as it streams in
    Ask {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        base: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bubblecast=info,tower_http=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();
}

/// Prints deltas live to stdout.
struct Printer {
    saw_delta: bool,
}

impl AnswerHandler for Printer {
    fn on_delta(&mut self, text: &str) {
        self.saw_delta = true;
        print!("{text}");
        io::stdout().flush().ok();
    }

    fn on_done(&mut self) {
        if self.saw_delta {
            println!();
        }
    }

    fn on_error(&mut self, message: &str) {
        if self.saw_delta {
            println!();
        }
        eprintln!("[error: {message}]");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut cfg = match config {
                Some(path) => Config::from_path(&path)?,
                None => Config::default(),
            };
            cfg.apply_env(|k| std::env::var(k).ok());
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            let creds = Credentials::resolve(&cfg, |k| std::env::var(k).ok());
            if creds.chat.is_none() {
                tracing::warn!(
                    keys = ?cfg.chat.api_key_envs,
                    "no chat credential; /chat-sse and /api/claude will report unavailable"
                );
            }
            let state = AppState::from_config(cfg, creds)?;
            server::serve(state).await?;
        }
        Commands::Ask {
            base,
            message,
            system,
            model,
            max_tokens,
            temperature,
        } => {
            let http = HttpClient::new(&HttpCfg::default())?;
            let req = AskRequest {
                system,
                model,
                max_tokens,
                temperature,
                ..AskRequest::new(message)
            };
            let mut printer = Printer { saw_delta: false };
            let outcome = StreamConsumer::new(base, http)
                .ask(req)
                .drive(&mut printer)
                .await;
            if let Outcome::Error(message) = outcome {
                anyhow::bail!("answer failed: {message}");
            }
        }
    }

    Ok(())
}
