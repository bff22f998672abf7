//! CLI entry point: ask one question, stream the run to stdout.

use clap::Parser;
use tokio_stream::StreamExt;

use augur::{Agent, Settings};
use graphflow_core::EventType;

#[derive(Parser)]
#[command(name = "augur", about = "Multi-step research agent", version)]
struct Args {
    /// The question to research.
    question: Vec<String>,

    /// Resume an existing thread.
    #[arg(long)]
    thread: Option<String>,

    /// Persistence DSN (e.g. sqlite:augur.db). In-memory when absent.
    #[arg(long, env = "AUGUR_DATABASE_URL")]
    database_url: Option<String>,

    /// Print every envelope as a JSON line instead of a readable feed.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "augur=info,graphflow_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let question = args.question.join(" ");
    if question.trim().is_empty() {
        anyhow::bail!("no question given");
    }

    let mut settings = Settings::from_env();
    if args.database_url.is_some() {
        settings.database_url = args.database_url.clone();
    }

    let agent = Agent::bootstrap(settings).await?;
    let mut stream = agent.run(question, args.thread);

    while let Some(envelope) = stream.next().await {
        if args.json {
            println!("{}", serde_json::to_string(&envelope)?);
            continue;
        }
        match envelope.event_type {
            EventType::System => {
                if let Some(thread_id) = envelope.payload["thread_id"].as_str() {
                    eprintln!("thread: {thread_id}");
                }
            }
            EventType::Custom => match envelope.event.as_str() {
                "supervisor_decision" => {
                    eprintln!(
                        "supervisor: {} ({})",
                        envelope.payload["decision"].as_str().unwrap_or(""),
                        envelope.payload["topic"].as_str().unwrap_or("")
                    );
                }
                "search_start" => {
                    eprintln!("searching: {}", envelope.payload["query"].as_str().unwrap_or(""));
                }
                "web_search_url" => {
                    eprintln!("  {}", envelope.payload["url"].as_str().unwrap_or(""));
                }
                "market_approved" => {
                    eprintln!("market: {}", envelope.payload["question"].as_str().unwrap_or(""));
                }
                _ => {}
            },
            EventType::Complete => {
                println!("\n{}", envelope.payload["response"].as_str().unwrap_or(""));
            }
            EventType::Error => {
                anyhow::bail!("run failed: {}", envelope.payload["error"].as_str().unwrap_or(""));
            }
            _ => {}
        }
    }

    Ok(())
}
