use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docvoice::config::{load_config, SessionConfig};
use docvoice::session::Session;

#[derive(Parser)]
#[command(name = "docvoice", version, about = "Converse with a document in its own voice")]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask a single question and print the full answer.
    Ask {
        /// Document to converse with (txt, md, json, or pdf).
        file: PathBuf,
        question: String,
    },
    /// Interactive conversation. `/reset` clears memory, `/quit` exits.
    Chat {
        file: PathBuf,
    },
    /// Print retrieval diagnostics for a question without answering it.
    Metrics {
        file: PathBuf,
        question: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SessionConfig::default(),
    };

    match cli.command {
        Command::Ask { file, question } => {
            let streaming = config.llm.streaming;
            let session = Session::open(&file, config)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            if streaming {
                let mut stdout = std::io::stdout();
                let mut stream = session.ask_streaming(&question).await?;
                while let Some(fragment) = stream.next().await {
                    print!("{}", fragment?);
                    stdout.flush()?;
                }
                println!();
            } else {
                let answer = session.ask(&question).await?;
                println!("{}", answer.text);
            }
        }
        Command::Chat { file } => {
            let session = Session::open(&file, config)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            run_chat(&session).await?;
        }
        Command::Metrics { file, question } => {
            let session = Session::open(&file, config)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            let metrics = session.relevance_metrics(&question).await?;
            if metrics.no_match {
                println!("no chunks retrieved");
            } else {
                println!("best score:    {:.4}", metrics.best_score);
                println!("average score: {:.4}", metrics.average_score);
                for (i, score) in metrics.per_chunk_scores.iter().enumerate() {
                    println!("  chunk {i}: {score:.4}");
                }
            }
        }
    }

    Ok(())
}

async fn run_chat(session: &Session) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    println!("Chatting with the document. /reset clears memory, /quit exits.");

    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let question = line.trim();
        match question {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.reset().await?;
                println!("(memory cleared)");
                continue;
            }
            _ => {}
        }

        let mut stream = session.ask_streaming(question).await?;
        while let Some(fragment) = stream.next().await {
            match fragment {
                Ok(text) => {
                    print!("{text}");
                    stdout.flush()?;
                }
                Err(e) => {
                    eprintln!("\nerror: {e}");
                    break;
                }
            }
        }
        println!();
    }

    Ok(())
}
