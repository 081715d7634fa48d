//! Command parsing
//!
//! Turns request bodies into `(target_id, payload)` commands for the bridge.
//! A batch body is `{"messages": [...]}`; each entry carries the target in
//! `Car_ID` and the payload in `message` or, failing that, `EP`.

use std::fmt;

use serde_json::{Map, Value};

/// Key holding the target id in request bodies
pub const TARGET_KEY: &str = "Car_ID";
/// Preferred payload key
pub const MESSAGE_KEY: &str = "message";
/// Fallback payload key, and the only one the local manager sends
pub const ENDPOINT_KEY: &str = "EP";

/// A single parsed command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub target_id: String,
    pub payload: Value,
}

/// Errors from parsing a request body or one of its entries
#[derive(Debug)]
pub enum CommandError {
    /// Body is not valid JSON
    InvalidJson(serde_json::Error),
    /// Body is JSON but not an object
    NotAnObject,
    /// Batch body without a `messages` array
    MissingMessages,
    /// Required field absent
    MissingField(&'static str),
    /// Target id is neither a string nor a number
    InvalidTarget,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::InvalidJson(e) => write!(f, "invalid JSON: {}", e),
            CommandError::NotAnObject => write!(f, "expected a JSON object"),
            CommandError::MissingMessages => write!(f, "missing 'messages' array"),
            CommandError::MissingField(name) => write!(f, "missing field '{}'", name),
            CommandError::InvalidTarget => {
                write!(f, "'{}' must be a string or a number", TARGET_KEY)
            }
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::InvalidJson(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        CommandError::InvalidJson(e)
    }
}

/// A parsed batch: the original body plus the entries that could be used
#[derive(Debug, Clone)]
pub struct Batch {
    /// The request body, echoed back in the response
    pub body: Map<String, Value>,
    /// Usable entries with their index in `messages`
    pub commands: Vec<(usize, Command)>,
    /// Indices of malformed entries
    pub skipped: Vec<usize>,
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>, CommandError> {
    match serde_json::from_slice(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(CommandError::NotAnObject),
    }
}

fn target_id(entry: &Map<String, Value>) -> Result<String, CommandError> {
    match entry.get(TARGET_KEY) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(CommandError::InvalidTarget),
        None => Err(CommandError::MissingField(TARGET_KEY)),
    }
}

/// Parse one batch entry. `message` wins over `EP` when both are present.
pub fn parse_entry(entry: &Value) -> Result<Command, CommandError> {
    let entry = entry.as_object().ok_or(CommandError::NotAnObject)?;
    let target_id = target_id(entry)?;
    let payload = entry
        .get(MESSAGE_KEY)
        .or_else(|| entry.get(ENDPOINT_KEY))
        .cloned()
        .ok_or(CommandError::MissingField(MESSAGE_KEY))?;
    Ok(Command { target_id, payload })
}

/// Parse a batch body. Malformed entries are reported in `skipped`; only a
/// body that is not a JSON object with a `messages` array is an error.
pub fn parse_batch(body: &[u8]) -> Result<Batch, CommandError> {
    let body = parse_object(body)?;
    let entries = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or(CommandError::MissingMessages)?;

    let mut commands = Vec::with_capacity(entries.len());
    let mut skipped = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        match parse_entry(entry) {
            Ok(command) => commands.push((index, command)),
            Err(_) => skipped.push(index),
        }
    }

    Ok(Batch {
        body,
        commands,
        skipped,
    })
}

/// Parse a local manager body `{"Car_ID": .., "EP": ..}`
pub fn parse_endpoint_update(
    body: &[u8],
) -> Result<(Map<String, Value>, Command), CommandError> {
    let body = parse_object(body)?;
    let target_id = target_id(&body)?;
    let payload = body
        .get(ENDPOINT_KEY)
        .cloned()
        .ok_or(CommandError::MissingField(ENDPOINT_KEY))?;
    Ok((body, Command { target_id, payload }))
}
