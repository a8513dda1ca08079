use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chat_sdk::{ChatClient, ChatClientConfig, ChatError, Message, SessionConfig, StreamCallbacks};
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing session token; pass --token, or --token-url with --api-key, or --ws-url")]
    MissingToken,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response has no `{0}` field")]
    MissingField(&'static str),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("stdin read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "chat-cli", about = "Interactive terminal chat over the chat WebSocket API")]
struct Cli {
    /// Full WebSocket URL; skips token handling entirely.
    #[arg(long, env = "CHAT_WS_URL")]
    ws_url: Option<String>,

    #[arg(long, env = "CHAT_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "CHAT_TOKEN")]
    token: Option<String>,

    /// Endpoint that exchanges an API key for a session token.
    #[arg(long, env = "CHAT_TOKEN_URL")]
    token_url: Option<String>,

    #[arg(long, env = "CHAT_API_KEY")]
    api_key: Option<String>,

    /// Defaults to a fresh UUID.
    #[arg(long, env = "CHAT_CONVERSATION_ID")]
    conversation_id: Option<String>,

    #[arg(long, env = "CHAT_APP_ID", default_value = "chat-cli")]
    app_id: String,

    #[arg(long, env = "CHAT_MODEL")]
    model: Option<String>,

    #[arg(long, env = "CHAT_MAX_TURNS")]
    max_turns: Option<u32>,
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(String),
    Interrupt,
    Quit,
    Empty,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = client_config(&cli, resolve_token(&cli).await?)?;
    let client = ChatClient::new(config)?;
    info!(conversation_id = %client.conversation_id(), app_id = %client.app_id(), "cli: starting");

    let _subscription = subscribe_printer(&client);
    client.connect(None, None).await?;
    eprintln!("connected to conversation {} (/interrupt, /quit)", client.conversation_id());

    let result = run_repl(&client).await;
    client.disconnect();
    result
}

fn client_config(cli: &Cli, token: Option<String>) -> Result<ChatClientConfig, CliError> {
    let conversation_id = cli.conversation_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let config = ChatClientConfig::new(conversation_id, cli.app_id.clone());
    let config = if let Some(url) = &cli.ws_url {
        config.with_url(url.clone())
    } else {
        config.with_base_url(cli.base_url.clone(), token.ok_or(CliError::MissingToken)?)
    };

    let mut session = SessionConfig::default();
    session.model.clone_from(&cli.model);
    session.max_turns = cli.max_turns;
    Ok(config.with_session_defaults(session))
}

// =============================================================================
// TOKEN
// =============================================================================

async fn resolve_token(cli: &Cli) -> Result<Option<String>, CliError> {
    if let Some(token) = &cli.token {
        return Ok(Some(token.clone()));
    }
    match (&cli.token_url, &cli.api_key) {
        (Some(url), Some(api_key)) => fetch_token(url, api_key).await.map(Some),
        _ => Ok(None),
    }
}

async fn fetch_token(url: &str, api_key: &str) -> Result<String, CliError> {
    debug!(%url, "cli: requesting session token");
    let response = reqwest::Client::new().post(url).bearer_auth(api_key).send().await?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ChatError::Api { message, status: Some(status.as_u16()) }.into());
    }

    let value = response.json::<Value>().await?;
    token_from_body(&value)
}

fn token_from_body(body: &Value) -> Result<String, CliError> {
    body.get("token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .ok_or(CliError::MissingField("token"))
}

// =============================================================================
// OUTPUT
// =============================================================================

fn subscribe_printer(client: &ChatClient) -> chat_sdk::Subscription {
    // Set while a streamed reply is being printed, so its final message is not printed twice.
    let streamed = Arc::new(AtomicBool::new(false));
    let chunk_flag = Arc::clone(&streamed);

    client.on_message(
        move |message| print_message(message, streamed.swap(false, Ordering::SeqCst)),
        StreamCallbacks::new()
            .on_chunk(move |chunk| {
                chunk_flag.store(true, Ordering::SeqCst);
                print!("{chunk}");
                let _ = std::io::stdout().flush();
            })
            .on_complete(|| println!())
            .on_error(|err| eprintln!("error: {err}"))
            .on_system(|info| debug!(subtype = %info.subtype, model = ?info.model, "cli: system")),
    )
}

fn print_message(message: &Message, already_streamed: bool) {
    if let Some(raw) = message.raw() {
        if raw.total_cost_usd.is_some() || raw.duration_ms.is_some() {
            eprintln!(
                "[turn finished: {} ms, ${:.4}]",
                raw.duration_ms.unwrap_or_default(),
                raw.total_cost_usd.unwrap_or_default()
            );
            return;
        }
    }
    if !already_streamed {
        println!("{}", message.content());
    }
}

// =============================================================================
// INPUT
// =============================================================================

async fn run_repl(client: &ChatClient) -> Result<(), CliError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = client.transport().subscribe_state();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                match parse_input(&line) {
                    Input::Send(text) => {
                        client.send_message(&text)?;
                    }
                    Input::Interrupt => client.interrupt()?,
                    Input::Quit => return Ok(()),
                    Input::Empty => {}
                }
            }
            Ok(()) = state.changed() => {
                if !client.is_connected() {
                    eprintln!("connection closed");
                    return Ok(());
                }
            }
        }
    }
}

fn parse_input(line: &str) -> Input {
    match line.trim() {
        "" => Input::Empty,
        "/quit" | "/exit" => Input::Quit,
        "/interrupt" => Input::Interrupt,
        text => Input::Send(text.to_owned()),
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
