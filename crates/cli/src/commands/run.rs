//! `codeloom run`: one prompt, or an interactive loop reading stdin.

use anyhow::Context;
use codeloom_agent::TurnState;
use codeloom_core::error::StoreError;
use codeloom_core::event::EventType;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::app::App;
use crate::console::{self, Console};

pub struct RunArgs {
    pub prompt: Option<String>,
    pub session: Option<String>,
    pub model: Option<String>,
    pub yes: bool,
}

type Input = Lines<BufReader<Stdin>>;

pub async fn run(app: App, args: RunArgs) -> anyhow::Result<()> {
    let session = match &args.session {
        Some(id) => match app.orchestrator.sessions().get(id).await {
            Ok(session) => session,
            Err(StoreError::NotFound { .. }) => anyhow::bail!("no session with ID {id}"),
            Err(e) => return Err(e.into()),
        },
        None => app.orchestrator.sessions().create("").await?,
    };
    if let Some(model) = &args.model {
        app.orchestrator.choose_model(&session.id, model)?;
    }
    if args.yes {
        app.orchestrator.gate().auto_approve_session(&session.id);
    }

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut console = Console::new();

    match args.prompt {
        Some(prompt) => turn(&app, &session.id, prompt, &mut input, &mut console).await?,
        None => {
            eprintln!("  codeloom: session {}", session.id);
            eprintln!("  /model <id> switches models, /exit or Ctrl-D quits.");
            loop {
                print!("\n> ");
                std::io::stdout().flush()?;
                let Some(line) = input.next_line().await? else {
                    break;
                };
                let line = line.trim();
                match line {
                    "" => continue,
                    "/exit" | "/quit" => break,
                    _ => {}
                }
                if let Some(model) = line.strip_prefix("/model ") {
                    match app.orchestrator.choose_model(&session.id, model.trim()) {
                        Ok(()) => eprintln!("  model: {}", model.trim()),
                        Err(e) => eprintln!("  {e}"),
                    }
                    continue;
                }
                turn(&app, &session.id, line.to_string(), &mut input, &mut console).await?;
            }
        }
    }

    if !app.orchestrator.shutdown().await {
        warn!("Exited with turns still running");
    }
    Ok(())
}

/// Run one turn, streaming the reply to stdout and asking permission on stdin.
async fn turn(
    app: &App,
    session_id: &str,
    prompt: String,
    input: &mut Input,
    console: &mut Console,
) -> anyhow::Result<()> {
    let listening = CancellationToken::new();
    let _stop_listening = listening.clone().drop_guard();
    let mut messages = app.store.events().messages.subscribe(listening.clone());
    let mut agent = app.orchestrator.events().subscribe(listening.clone());
    let mut permissions = app.orchestrator.gate().events().subscribe(listening.clone());

    let mut handle = app.orchestrator.start(session_id, prompt)?;
    let result = loop {
        tokio::select! {
            result = &mut handle => break result.context("turn task failed")?,
            Some(event) = messages.recv() => {
                if let Some(delta) = console.text_delta(session_id, &event.payload) {
                    print!("{delta}");
                    std::io::stdout().flush()?;
                }
            }
            Some(event) = agent.recv() => {
                if let Some(line) = console::status_line(&event.payload) {
                    eprintln!("{line}");
                }
            }
            Some(event) = permissions.recv() => {
                if event.kind != EventType::Created {
                    continue;
                }
                eprint!("{}", console::permission_prompt(&event.payload));
                let answer = input.next_line().await?.unwrap_or_default();
                app.orchestrator
                    .gate()
                    .respond(&event.payload.id, console::parse_decision(&answer));
            }
            _ = tokio::signal::ctrl_c() => {
                app.orchestrator.cancel(session_id);
            }
        }
    };

    // Flush whatever the last store events carried.
    while let Some(event) = messages.try_recv() {
        if let Some(delta) = console.text_delta(session_id, &event.payload) {
            print!("{delta}");
        }
    }
    while let Some(event) = agent.try_recv() {
        if let Some(line) = console::status_line(&event.payload) {
            eprintln!("{line}");
        }
    }
    println!();
    console.reset();

    // Failures were already shown from their TurnFailed event.
    if matches!(&result, Ok(outcome) if outcome.state == TurnState::Done) {
        let session = app.orchestrator.sessions().get(session_id).await?;
        eprintln!(
            "  {} in / {} out tokens, ${:.4}",
            session.input_tokens, session.output_tokens, session.cost
        );
    }
    Ok(())
}
