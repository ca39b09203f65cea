use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::json;

use crate::bus::{Broadcaster, InputQueue, InputSource};
use crate::capability::build_registry;
use crate::config::RuntimeConfig;
use crate::control::{ControlInput, parse_control_input};
use crate::provider::ModelResolver;
use crate::runtime::AgentRuntime;
use crate::server::{ServerState, run_server, server_auth_token_from_env, shutdown_signal};
use crate::session::{InputOutcome, OutputSink, Session};
use crate::telemetry::TelemetrySink;

const CONSOLE_PROMPT: &str = "User> ";
const SERVER_STOP_GRACE: Duration = Duration::from_secs(2);

/// Prints to the terminal and mirrors everything to web clients.
pub struct ConsoleSink {
    broadcaster: Broadcaster,
}

impl ConsoleSink {
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }
}

impl OutputSink for ConsoleSink {
    fn agent(&self, text: &str) {
        println!("Agent: {text}\n");
        self.broadcaster.publish(text);
    }

    fn notice(&self, text: &str) {
        println!("[system] {text}\n");
        self.broadcaster.publish(format!("[system] {text}"));
    }

    fn error(&self, text: &str) {
        eprintln!("[error] {text}\n");
        self.broadcaster.publish(format!("[error] {text}"));
    }
}

#[derive(Debug, Clone)]
pub struct WebOptions {
    pub host: String,
    pub port: u16,
}

/// Reads console lines on a dedicated thread. EOF and Ctrl-C enqueue `exit`.
pub fn spawn_console_reader(queue: InputQueue) -> Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("console-reader".to_string())
        .spawn(move || match DefaultEditor::new() {
            Ok(editor) => read_with_editor(editor, &queue),
            Err(err) => {
                tracing::warn!(error = %err, "line editor unavailable; reading plain stdin");
                read_plain_stdin(&queue);
            }
        })
        .context("failed to start console reader thread")
}

fn read_with_editor(mut editor: DefaultEditor, queue: &InputQueue) {
    loop {
        match editor.readline(CONSOLE_PROMPT) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = editor.add_history_entry(line.as_str());
                }
                let exit = parse_control_input(&line) == ControlInput::Exit;
                if !queue.push(InputSource::Console, line) || exit {
                    return;
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                queue.push(InputSource::Console, "exit");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "console read failed");
                queue.push(InputSource::Console, "exit");
                return;
            }
        }
    }
}

fn read_plain_stdin(queue: &InputQueue) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let exit = parse_control_input(&line) == ControlInput::Exit;
        if !queue.push(InputSource::Console, line) || exit {
            return;
        }
    }
    queue.push(InputSource::Console, "exit");
}

fn prepare_runtime(
    cfg: &RuntimeConfig,
    resolver: Arc<dyn ModelResolver>,
    telemetry: &TelemetrySink,
) -> Result<Arc<AgentRuntime>> {
    std::fs::create_dir_all(&cfg.auto_skills_dir).with_context(|| {
        format!(
            "failed to create auto skills directory '{}'",
            cfg.auto_skills_dir.display()
        )
    })?;
    let registry = build_registry(cfg);
    let runtime = AgentRuntime::build(cfg, registry, resolver, telemetry.clone())?;
    Ok(Arc::new(runtime))
}

/// Runs the interactive agent: console and/or web console feeding one session.
pub async fn run_agent(
    cfg: RuntimeConfig,
    resolver: Arc<dyn ModelResolver>,
    web: Option<WebOptions>,
    console: bool,
    telemetry: &TelemetrySink,
) -> Result<()> {
    if !console && web.is_none() {
        return Err(anyhow::anyhow!(
            "invalid value: --no-console requires --web, otherwise nothing can send input"
        ));
    }

    let runtime = prepare_runtime(&cfg, resolver, telemetry)?;
    let generation = runtime.current();
    println!(
        "Agent ready: {} ({}), {} skills loaded.",
        generation.provider,
        generation.model_name,
        generation.tools.len()
    );
    if !generation.issues.is_empty() {
        println!(
            "{} capability load issue(s); run `skillhost skills list` for details.",
            generation.issues.len()
        );
    }
    telemetry.emit(
        "agent.started",
        json!({
            "provider": generation.provider.id(),
            "model": generation.model_name,
            "tools": generation.tools.len(),
            "web": web.is_some(),
            "console": console
        }),
    );

    let (queue, mut inputs) = InputQueue::new();
    let broadcaster = Broadcaster::new();
    let sink = Arc::new(ConsoleSink::new(broadcaster.clone()));
    let mut session = Session::new(cfg.clone(), runtime.clone(), telemetry.clone(), sink);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = web.map(|options| {
        let state = ServerState {
            runtime: runtime.clone(),
            inputs: queue.clone(),
            broadcaster: broadcaster.clone(),
            telemetry: telemetry.clone(),
            profile: cfg.profile.clone(),
            auth_token: server_auth_token_from_env(),
        };
        tokio::spawn(async move {
            let stop = async move {
                let _ = stop_rx.await;
            };
            if let Err(err) = run_server(state, &options.host, options.port, stop).await {
                tracing::error!(error = %format!("{err:#}"), "web console stopped");
                eprintln!("[error] web console stopped: {err:#}");
            }
        })
    });

    if console {
        println!("Type 'exit' or 'quit' to leave.\n");
        spawn_console_reader(queue.clone())?;
    }
    drop(queue);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            message = inputs.recv() => {
                let Some(message) = message else {
                    break;
                };
                if message.source == InputSource::Web {
                    println!("User (web): {}\n", message.text.trim());
                }
                if session.handle_input(&message.text).await == InputOutcome::Exit {
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }

    println!("Bye!");
    let _ = stop_tx.send(());
    if let Some(task) = server_task
        && tokio::time::timeout(SERVER_STOP_GRACE, task).await.is_err()
    {
        tracing::debug!("web console did not stop within grace period");
    }
    Ok(())
}

/// One-shot: runs a single input through the full loop and exits.
pub async fn run_ask(
    cfg: RuntimeConfig,
    resolver: Arc<dyn ModelResolver>,
    prompt: &str,
    telemetry: &TelemetrySink,
) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(anyhow::anyhow!("invalid value: prompt cannot be empty"));
    }
    let runtime = prepare_runtime(&cfg, resolver, telemetry)?;
    let sink = Arc::new(ConsoleSink::new(Broadcaster::new()));
    let mut session = Session::new(cfg, runtime, telemetry.clone(), sink);
    session.handle_input(prompt).await;
    if session.last_run().failed {
        return Err(anyhow::anyhow!("agent turn failed; see the error above"));
    }
    Ok(())
}
