mod config;
mod controller;
mod conversation;
mod error;
mod logger;
mod models;
mod protocol;
mod tokens;
mod worker;

use anyhow::{bail, Context, Result};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use config::{BackendConfig, ScriptedConfig};
use controller::{AssistantController, ViewUpdate};

/// Context window assumed for the usage readout in `/status`.
const CONTEXT_WINDOW: usize = 4096;

const HELP: &str = "\
Commands:
  /new     start a new conversation
  /retry   reload the assistant after a failure
  /status  show assistant state and context usage
  /help    show this help
  /quit    exit";

#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    config_path: Option<PathBuf>,
    scripted: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Options> {
    let mut options = Options::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                options.config_path = Some(PathBuf::from(path));
            }
            "--scripted" => options.scripted = true,
            other => bail!("unknown argument: {other}\nusage: taskdesk-assistant [--config <path>] [--scripted]"),
        }
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init(logger::DEFAULT_DIRECTIVE)?;
    let options = parse_args(std::env::args().skip(1))?;

    let mut config = match &options.config_path {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };
    if options.scripted {
        config.backend = BackendConfig::Scripted(ScriptedConfig {
            chunk_delay_ms: 40,
            load_delay_ms: 300,
            ..Default::default()
        });
    }
    info!(backend = ?config.backend, "starting assistant");

    let mut controller = AssistantController::from_config(&config);
    controller.initialize()?;

    // stdin is read on its own task so the event loop never blocks on it
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(read_lines(line_tx));

    let res = run(&mut controller, &mut line_rx).await;
    controller.shutdown();
    res
}

async fn read_lines(tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

async fn run(
    controller: &mut AssistantController,
    lines: &mut mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    println!("{HELP}\n");
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                if !handle_input(controller, line.trim())? {
                    break;
                }
            }
            envelope = controller.next_event() => {
                match envelope {
                    Some(envelope) => {
                        if let Some(update) = controller.handle_event(envelope) {
                            render(controller, &update)?;
                        }
                    }
                    None => println!("\n! the assistant stopped unexpectedly, type /retry to restart"),
                }
            }
        }
    }
    Ok(())
}

/// Returns `false` when the user asked to quit.
fn handle_input(controller: &mut AssistantController, input: &str) -> Result<bool> {
    match input {
        "" => {}
        "/quit" => return Ok(false),
        "/help" => println!("{HELP}"),
        "/status" => {
            println!(
                "state: {} | turns: {} | tokens: {} ({:.1}% of {CONTEXT_WINDOW})",
                controller.state(),
                controller.conversation().len(),
                controller.total_tokens(),
                controller.context_usage_percentage(CONTEXT_WINDOW),
            );
            if let Some(progress) = controller.load_progress() {
                println!("loading: {}% {}", progress.percent(), progress.status_text);
            }
        }
        "/new" => {
            if let Err(e) = controller.reset() {
                println!("! {e}");
            }
        }
        "/retry" => {
            if controller.can_retry() {
                controller.initialize()?;
            } else {
                println!("! nothing to retry (state: {})", controller.state());
            }
        }
        text if controller.can_send() => match controller.send_message(text) {
            Ok(_) => {
                print!("assistant> ");
                io::stdout().flush()?;
            }
            Err(e) => println!("! {e}"),
        },
        _ => println!("! the assistant is {}, please wait", controller.state()),
    }
    Ok(true)
}

fn render(controller: &AssistantController, update: &ViewUpdate) -> Result<()> {
    let mut stdout = io::stdout().lock();
    match update {
        ViewUpdate::Progress(progress) => {
            writeln!(stdout, "[{:>3}%] {}", progress.percent(), progress.status_text)?;
        }
        ViewUpdate::Ready | ViewUpdate::ConversationReset => {
            if let Some(greeting) = controller.fresh_greeting() {
                writeln!(stdout, "assistant> {}", greeting.content)?;
            }
        }
        ViewUpdate::LoadFailed(message) => {
            writeln!(stdout, "! failed to load the assistant: {message}")?;
            writeln!(stdout, "  type /retry to try again")?;
        }
        ViewUpdate::Chunk { text, .. } => write!(stdout, "{text}")?,
        ViewUpdate::TurnFinished(_) => writeln!(stdout)?,
        ViewUpdate::TurnFailed { message, .. } => {
            writeln!(stdout, "\n! response failed: {message}")?;
        }
    }
    stdout.flush()?;
    Ok(())
}
