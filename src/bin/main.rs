//! Run one turn from the command line and print the classified output.
//!
//! Usage: orchestrator <thread-id> <message...>

use std::io::Write;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wealth_steward::{build_orchestrator, ClassifiedDelta, Settings, TurnEvent, TurnRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let thread_id = args.next().unwrap_or_default();
    let message = args.collect::<Vec<_>>().join(" ");
    if thread_id.is_empty() || message.trim().is_empty() {
        eprintln!("usage: orchestrator <thread-id> <message...>");
        std::process::exit(2);
    }

    let settings = Settings::from_env()?;
    let orchestrator = build_orchestrator(&settings)?;

    info!(%thread_id, "Running turn");
    let mut events = orchestrator.handle_turn(TurnRequest::new(thread_id, message));

    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            TurnEvent::Delta(ClassifiedDelta::Reasoning(text)) => eprint!("\x1b[2m{}\x1b[0m", text),
            TurnEvent::Delta(ClassifiedDelta::Content(text)) => {
                print!("{}", text);
                stdout.flush()?;
            }
            TurnEvent::Delta(ClassifiedDelta::ToolCall(call)) => {
                eprintln!("\n[tool] {}({})", call.name, call.arguments);
            }
            TurnEvent::Finished(status) => {
                println!();
                info!(?status, "Turn finished");
            }
            TurnEvent::Failed(failure) => {
                println!();
                eprintln!("turn failed ({}): {}", failure.kind.as_str(), failure.message);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
