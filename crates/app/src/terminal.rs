//! Line-oriented front-end over stdin/stdout.
//!
//! Plain lines are sent as user turns and slash commands drive the rest of the session.
//! Replies stream to stdout; status, progress and errors go to stderr.

use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use hearth_llm::{CUSTOM_MODEL_ID, builtin_models};
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::task::TaskTracker;

use crate::chat::{LifecycleState, Message, SessionController, SessionObserver};
use crate::error::SessionError;
use crate::settings::Settings;
use crate::transcript::suggested_file_name;

const HELP: &str = "\
commands:
  /load              load the selected model
  /models            list built-in models
  /model <id>        select a built-in model
  /custom <id>       select a custom model identifier
  /system <text>     set the system prompt
  /temp <0..2>       set the temperature
  /max <n>           set the max tokens per reply
  /concise           toggle concise mode
  /theme             toggle the theme
  /regen             regenerate the last reply
  /stop              stop the running reply
  /clear             start a new chat
  /export [path]     write the conversation to a file
  /import <path>     replace the conversation from a file
  /quit              exit";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TerminalError {
    #[snafu(display("failed to read from stdin on `{stage}`: {source}"))]
    ReadStdin {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    UnknownCommand { stage: &'static str, name: String },
    #[snafu(display("`/{command}` needs an argument"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
    },
    #[snafu(display("`/{command}` expects a number, got `{value}`"))]
    InvalidNumber {
        stage: &'static str,
        command: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Submit(String),
    Load,
    Models,
    Model(String),
    Custom(String),
    System(String),
    Temperature(f64),
    MaxTokens(u64),
    Concise,
    Theme,
    Regenerate,
    Stop,
    Clear,
    Export(Option<PathBuf>),
    Import(PathBuf),
    Help,
    Quit,
}

impl Command {
    /// Parses one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::Submit(line.to_string())));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        let command = match name {
            "load" => Self::Load,
            "models" => Self::Models,
            "model" => Self::Model(required(argument, "model")?),
            "custom" => Self::Custom(required(argument, "custom")?),
            "system" => Self::System(argument.to_string()),
            "temp" => Self::Temperature(number(argument, "temp")?),
            "max" => Self::MaxTokens(number(argument, "max")?),
            "concise" => Self::Concise,
            "theme" => Self::Theme,
            "regen" => Self::Regenerate,
            "stop" => Self::Stop,
            "clear" | "new" => Self::Clear,
            "export" => Self::Export((!argument.is_empty()).then(|| PathBuf::from(argument))),
            "import" => Self::Import(PathBuf::from(required(argument, "import")?)),
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => {
                return UnknownCommandSnafu {
                    stage: "parse-command",
                    name,
                }
                .fail();
            }
        };
        Ok(Some(command))
    }
}

fn required(argument: &str, command: &'static str) -> Result<String, CommandError> {
    if argument.is_empty() {
        return MissingArgumentSnafu {
            stage: "parse-command-argument",
            command,
        }
        .fail();
    }
    Ok(argument.to_string())
}

fn number<T: std::str::FromStr>(argument: &str, command: &'static str) -> Result<T, CommandError> {
    let argument = required(argument, command)?;
    argument.parse::<T>().ok().ok_or_else(|| {
        InvalidNumberSnafu {
            stage: "parse-command-number",
            command,
            value: argument.clone(),
        }
        .build()
    })
}

/// Reads commands until `/quit` or end of input.
pub async fn run(controller: SessionController) -> Result<(), TerminalError> {
    print_history(&controller.messages());
    eprintln!(
        "model: {} (not loaded, use /load). /help lists commands.",
        controller.settings().model_label()
    );

    let tasks = TaskTracker::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let read = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(source) => {
                break Err::<(), _>(source).context(ReadStdinSnafu {
                    stage: "read-command-line",
                });
            }
        };
        match Command::parse(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => break Ok(()),
            Ok(Some(command)) => dispatch(&controller, command, &tasks),
            Err(error) => eprintln!("{error}"),
        }
    };

    shutdown(&controller, &tasks).await;
    read
}

/// Stops a running reply and waits for every spawned command to settle.
async fn shutdown(controller: &SessionController, tasks: &TaskTracker) {
    if controller.stop() {
        tracing::info!("stopped the running reply on exit");
    }
    tasks.close();
    tasks.wait().await;
}

fn dispatch(controller: &SessionController, command: Command, tasks: &TaskTracker) {
    match command {
        Command::Submit(text) => {
            let controller = controller.clone();
            tasks.spawn(async move {
                let state = controller.lifecycle_state();
                if controller.submit(&text).await.is_none() {
                    eprintln!("message not sent while {state}; use /load first");
                }
            });
        }
        Command::Load => {
            let controller = controller.clone();
            tasks.spawn(async move {
                if let Err(error @ SessionError::Busy { .. }) = controller.load_model().await {
                    eprintln!("{error}");
                }
            });
        }
        Command::Regenerate => {
            let controller = controller.clone();
            tasks.spawn(async move {
                if controller.regenerate().await.is_none() {
                    eprintln!("nothing to regenerate");
                }
            });
        }
        Command::Models => {
            let selected = controller.settings().model_id.clone();
            for model in builtin_models() {
                let marker = if model.id == selected { '*' } else { ' ' };
                let description = model.description.as_deref().unwrap_or_default();
                println!("{marker} {:<40} {:<24} {description}", model.id, model.name);
            }
        }
        Command::Model(model_id) => {
            controller.update_settings(|settings| settings.model_id = model_id);
        }
        Command::Custom(model_id) => {
            controller.update_settings(|settings| {
                settings.model_id = CUSTOM_MODEL_ID.to_string();
                settings.custom_model_id = model_id;
            });
        }
        Command::System(prompt) => {
            controller.update_settings(|settings| settings.system_prompt = prompt);
        }
        Command::Temperature(temperature) => {
            controller.update_settings(|settings| settings.temperature = temperature);
        }
        Command::MaxTokens(max_tokens) => {
            controller.update_settings(|settings| settings.max_tokens = max_tokens);
        }
        Command::Concise => {
            controller.update_settings(|settings| settings.concise_mode = !settings.concise_mode);
        }
        Command::Theme => {
            controller.toggle_theme();
        }
        Command::Stop => {
            if !controller.stop() {
                eprintln!("nothing is being generated");
            }
        }
        Command::Clear => {
            if !controller.clear() {
                eprintln!("cannot clear while a reply is being generated");
            }
        }
        Command::Export(path) => export(controller, path),
        Command::Import(path) => import(controller, path),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}

fn export(controller: &SessionController, path: Option<PathBuf>) {
    let path = path.unwrap_or_else(|| PathBuf::from(suggested_file_name(Utc::now())));
    let written = controller
        .export_json()
        .map_err(|error| error.to_string())
        .and_then(|json| std::fs::write(&path, json).map_err(|error| error.to_string()));
    match written {
        Ok(()) => eprintln!("exported to {}", path.display()),
        Err(error) => eprintln!("export failed: {error}"),
    }
}

fn import(controller: &SessionController, path: PathBuf) {
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            eprintln!("cannot read {}: {error}", path.display());
            return;
        }
    };
    match controller.import_transcript(&raw) {
        Ok(count) => eprintln!("imported {count} messages from {}", path.display()),
        Err(error @ SessionError::Busy { .. }) => eprintln!("{error}"),
        // Already reported through the observer.
        Err(_) => {}
    }
}

fn print_history(messages: &[Message]) {
    for message in messages {
        println!("{}> {}", message.role, message.content);
    }
}

/// Prints streamed replies incrementally and session events to stderr.
#[derive(Default)]
pub struct TerminalObserver {
    // Bytes of the in-flight reply already written, while one is streaming.
    printed: Mutex<Option<usize>>,
}

impl TerminalObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionObserver for TerminalObserver {
    fn on_messages_changed(&self, messages: &[Message]) {
        let mut printed = self.printed.lock();
        let Some(last) = messages.last().filter(|last| last.is_assistant()) else {
            *printed = None;
            return;
        };

        let mut stdout = std::io::stdout().lock();
        match (*printed, last.is_streaming) {
            (None, true) => {
                let _ = write!(stdout, "assistant> {}", last.content);
                *printed = Some(last.content.len());
            }
            (Some(done), true) => {
                let _ = write!(stdout, "{}", last.content.get(done..).unwrap_or_default());
                *printed = Some(last.content.len());
            }
            (Some(done), false) => {
                let _ = writeln!(stdout, "{}", last.content.get(done..).unwrap_or_default());
                if last.has_image_request {
                    let _ = writeln!(stdout, "(image generation is not available; the reply describes it instead)");
                }
                *printed = None;
            }
            (None, false) => {}
        }
        let _ = stdout.flush();
    }

    fn on_status_changed(&self, state: LifecycleState, detail: Option<&str>) {
        match (state, detail) {
            (LifecycleState::Generating, _) => {}
            (state, Some(detail)) => eprintln!("[{state}] {detail}"),
            (state, None) => tracing::debug!(%state, "status changed"),
        }
    }

    fn on_progress(&self, fraction: f64) {
        eprintln!("[loading] {:>3.0}%", fraction.clamp(0.0, 1.0) * 100.0);
    }

    fn on_error(&self, message: &str) {
        eprintln!("error: {message}");
    }

    fn on_settings_changed(&self, settings: &Settings) {
        eprintln!(
            "[settings] model={} temperature={} max_tokens={} concise={} theme={:?}",
            settings.model_label(),
            settings.temperature,
            settings.max_tokens,
            settings.concise_mode,
            settings.theme
        );
    }
}
