use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parlor::{
    AppConfig, ChatError, ChatNotice, ChatSession, MessageId, ProviderConnector, RigConnector,
    Settings, TurnOutcome,
};
use parlor_llm::scripted::Script;
use parlor_llm::{
    Fragment, Model, SCRIPTED_PROVIDER_ID, ScriptStep, ScriptedProvider, default_models,
    supports_deep_think,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
commands:
  <text>            send a prompt
  /stop             stop the streaming answer
  /regen            regenerate the last answer
  /clear            clear the conversation
  /key <api-key>    save the API key
  /model <name>     save the model name
  /models           list known models
  /think on|off     toggle deep think
  /help             show this help
  /quit             exit";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        tracing::error!("parlor exited with an error: {}", error);
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ChatError> {
    let config = AppConfig::load();
    let store = config.open_store().await?;

    // The scripted provider echoes prompts back, for trying the client offline.
    let scripted = (config.provider_id == SCRIPTED_PROVIDER_ID).then(ScriptedProvider::default);
    let connector: Arc<dyn ProviderConnector> = match &scripted {
        Some(provider) => Arc::new(provider.clone()),
        None => Arc::new(RigConnector),
    };
    let session = ChatSession::open(store, config, connector)?;

    for message in session.transcript().iter() {
        println!("{}> {}", role_label(message.is_assistant()), message.content);
    }
    let settings = session.settings();
    println!(
        "model: {}{}. type /help for commands.",
        settings.effective_model(),
        if settings.has_api_key() { "" } else { " (no API key, use /key)" }
    );

    let renderer = tokio::spawn(render_stream(session.clone()));
    let notifier = tokio::spawn(report_notices(session.subscribe_notices()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Help => println!("{HELP}"),
            Command::Send(prompt) => {
                queue_echo(scripted.as_ref(), &session, prompt);
                if let Err(error) = session.send(prompt) {
                    report_error(&error);
                }
            }
            Command::Regenerate => {
                if session.can_regenerate()
                    && let Some(prompt) = last_user_prompt(&session)
                {
                    queue_echo(scripted.as_ref(), &session, &prompt);
                }
                if let Err(error) = session.regenerate() {
                    report_error(&error);
                }
            }
            Command::Stop => {
                if !session.stop() {
                    println!("[nothing to stop]");
                }
            }
            Command::Clear => match session.clear_history() {
                Ok(()) => println!("[conversation cleared]"),
                Err(error) => report_error(&error),
            },
            Command::Key(api_key) => {
                let current = Settings::clone(&session.settings());
                let updated = Settings {
                    api_key: api_key.to_string(),
                    ..current
                };
                if let Err(error) = session.update_settings(updated) {
                    report_error(&error);
                }
            }
            Command::Model(model_name) => {
                let updated = Settings::clone(&session.settings()).with_model(model_name);
                match session.update_settings(updated) {
                    Ok(settings) => println!("[model: {}]", settings.effective_model()),
                    Err(error) => report_error(&error),
                }
            }
            Command::Think(enabled) => {
                let settings = session.set_deep_think(enabled);
                if enabled && !settings.can_deep_think() {
                    println!("[{} has no deep think mode]", settings.model_name);
                } else {
                    println!("[model: {}]", settings.effective_model());
                }
            }
            Command::Models => {
                for line in model_lines(&default_models(), &session.settings().model_name) {
                    println!("{line}");
                }
            }
            Command::Unknown(command) => println!("unknown command {command}, try /help"),
        }
    }

    session.stop();
    renderer.abort();
    notifier.abort();
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Empty,
    Send(&'a str),
    Stop,
    Regenerate,
    Clear,
    Key(&'a str),
    Model(&'a str),
    Models,
    Think(bool),
    Help,
    Quit,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Send(line);
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };
        match (name, argument) {
            ("stop", _) => Self::Stop,
            ("regen", _) => Self::Regenerate,
            ("clear", _) => Self::Clear,
            ("key", key) => Self::Key(key),
            ("model", model) if !model.is_empty() => Self::Model(model),
            ("models", _) => Self::Models,
            ("think", "on") => Self::Think(true),
            ("think", "off") => Self::Think(false),
            ("help", _) => Self::Help,
            ("quit" | "exit", _) => Self::Quit,
            _ => Self::Unknown(line),
        }
    }
}

/// Prints the growing assistant answer as deltas against what is already on screen.
async fn render_stream(session: ChatSession) {
    let mut transcript = session.subscribe_transcript();
    let mut printed: Option<(MessageId, usize)> = session
        .transcript()
        .last()
        .map(|message| (message.id.clone(), message.content.len()));

    while transcript.changed().await.is_ok() {
        let snapshot = transcript.borrow_and_update().clone();
        let Some(last) = snapshot.last().filter(|message| message.is_assistant()) else {
            continue;
        };

        let offset = match &printed {
            Some((id, len)) if *id == last.id => *len,
            _ => {
                print!("{}> ", role_label(true));
                0
            }
        };
        if let Some(delta) = last.content.get(offset..) {
            print!("{delta}");
        }
        let _ = std::io::stdout().flush();
        printed = Some((last.id.clone(), last.content.len()));
    }
}

async fn report_notices(mut notices: broadcast::Receiver<ChatNotice>) {
    loop {
        match notices.recv().await {
            Ok(ChatNotice::TurnFinished { outcome }) => match outcome {
                TurnOutcome::Completed => println!(),
                TurnOutcome::Cancelled => println!(" [stopped]"),
                TurnOutcome::Failed { .. } => println!(),
            },
            Ok(ChatNotice::StreamFailed { reason }) => eprintln!("\n[stream failed: {reason}]"),
            Ok(ChatNotice::ConfigurationRequired { details }) => {
                eprintln!("[{details}; set one with /key <api-key>]")
            }
            Ok(ChatNotice::SettingsSaved) => println!("[settings saved]"),
            Ok(ChatNotice::PersistenceFailed { reason }) => {
                eprintln!("[could not save history: {reason}]")
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn report_error(error: &ChatError) {
    match error {
        // Already reported through ChatNotice::ConfigurationRequired.
        ChatError::Configuration { .. } => {}
        ChatError::ConcurrentTurn { .. } => println!("[still answering, /stop first]"),
        ChatError::RegenerateUnavailable { .. } => println!("[nothing to regenerate]"),
        ChatError::EmptyPrompt { .. } => {}
        other => eprintln!("[{other}]"),
    }
}

fn last_user_prompt(session: &ChatSession) -> Option<String> {
    session
        .transcript()
        .iter()
        .rev()
        .find(|message| !message.is_assistant())
        .map(|message| message.content.clone())
}

/// Queues an echo of `prompt` when the next turn is going to reach the scripted provider.
fn queue_echo(scripted: Option<&ScriptedProvider>, session: &ChatSession, prompt: &str) {
    if let Some(provider) = scripted
        && session.settings().has_api_key()
        && session.turn_state().is_idle()
    {
        provider.push_script(echo_script(prompt));
    }
}

fn echo_script(prompt: &str) -> Script {
    let mut script = vec![ScriptStep::Fragment(Fragment::reasoning("echoing the prompt"))];
    for word in prompt.split_inclusive(' ') {
        script.push(ScriptStep::Pause(Duration::from_millis(40)));
        script.push(ScriptStep::Fragment(Fragment::text(word)));
    }
    script
}

/// One line per model; `*` marks the saved model, `[deep think]` a reasoning twin.
fn model_lines(models: &[Model], current: &str) -> Vec<String> {
    models
        .iter()
        .map(|model| {
            let marker = if model.id == current { '*' } else { ' ' };
            let mut line = format!("{marker} {}", model.name);
            if let Some(description) = &model.description {
                line.push_str(&format!(" - {description}"));
            }
            if supports_deep_think(&model.id) {
                line.push_str(" [deep think]");
            }
            line
        })
        .collect()
}

fn role_label(is_assistant: bool) -> &'static str {
    if is_assistant { "assistant" } else { "you" }
}
