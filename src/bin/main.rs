use clap::Parser;
use ops_copilot::{
    composer::ComposeEvent,
    models::{PipelineOutcome, Query, QueryOptions, Style},
    Copilot, CopilotConfig, OrchestrationError,
};
use std::io::Write;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Ask the operations copilot a question or issue a command.
#[derive(Debug, Parser)]
#[command(name = "copilot", version)]
struct Cli {
    /// Question or command text
    #[arg(required = true)]
    text: Vec<String>,

    /// Session to run the query in
    #[arg(long)]
    session: Option<Uuid>,

    /// Answer style: concise or detailed
    #[arg(long)]
    style: Option<Style>,

    /// Number of chunks to retrieve
    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    temperature: Option<f32>,

    /// Approve and dispatch a prepared action as this operator
    #[arg(long)]
    approve: Option<String>,

    /// Print the decision log
    #[arg(long)]
    trace: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CopilotConfig::from_env()?;
    let copilot = Copilot::init(config).await?;

    let mut query = Query::new(cli.text.join(" ")).with_options(QueryOptions {
        top_k: cli.top_k,
        style: cli.style,
        temperature: cli.temperature,
    });
    if let Some(session) = cli.session {
        query = query.with_session(session);
    }
    info!(query_id = %query.query_id, "Running query");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                ComposeEvent::Fragment(text) => {
                    let _ = write!(stdout, "{}", text);
                }
                ComposeEvent::Restart => {
                    let _ = writeln!(stdout, "\n--- revising answer ---");
                }
                ComposeEvent::Replace(text) => {
                    let _ = write!(stdout, "\n--- keeping earlier draft ---\n{}", text);
                }
            }
            let _ = stdout.flush();
        }
    });

    let outcome = copilot.ask_streaming(query, tx).await;
    let _ = printer.await;

    let result = match outcome {
        Ok(result) => result,
        Err(OrchestrationError::Cancelled(reason)) => {
            eprintln!("Query cancelled: {}", reason);
            copilot.shutdown().await?;
            return Ok(());
        }
        Err(e) => {
            copilot.shutdown().await?;
            return Err(e.into());
        }
    };

    println!();
    match &result.outcome {
        PipelineOutcome::Knowledge(knowledge) => {
            if knowledge.low_confidence {
                println!("{}", ops_copilot::agent::LOW_CONFIDENCE_CAVEAT.trim());
            }
            println!("\nSources:");
            for chunk in &knowledge.retrieved {
                println!("  [{}] {} (score {:.2})", chunk.id(), chunk.chunk.label(), chunk.score);
            }
            println!(
                "\nGrounding: {:.2} (threshold {:.2}, {:?}){}",
                knowledge.critique.grounding_score,
                knowledge.critique.threshold,
                knowledge.critique.verdict,
                if knowledge.recomposed { ", recomposed" } else { "" }
            );
        }
        PipelineOutcome::Action(action) => {
            println!("{}", action.message);
            println!("Request id: {}", action.request.request_id);

            if let Some(actor) = &cli.approve {
                let done = copilot
                    .desk()
                    .approve_and_dispatch(action.request.request_id, actor)
                    .await?;
                let note = done
                    .history
                    .last()
                    .and_then(|t| t.note.clone())
                    .unwrap_or_default();
                println!("Action {}: {}", done.state, note);
            }
        }
        PipelineOutcome::Halted(halt) => {
            println!("{}", halt.message);
        }
    }

    if cli.trace {
        println!("\nDecision log:");
        for entry in &result.decision_log {
            println!(
                "  {:>2} {:<14} {} -> {}",
                entry.sequence, entry.stage, entry.input_summary, entry.output_summary
            );
        }
    }

    copilot.shutdown().await?;
    Ok(())
}
