//! Errors that cross the wire.
//!
//! A [`SerializedError`] is the plain-data form of a failure:
//! `{name, message, stack?, cause?}` with causes nested recursively. On the
//! receiving side [`SerializedError::revive`] turns it back into a
//! [`RemoteError`] whose `source()` chain mirrors the original.

use std::error::Error;
use std::fmt;
use std::fmt::Write as _;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::RpcError;

/// Marker key identifying an error passed as a plain argument value.
pub const ERROR_TYPE_KEY: &str = "$type";
const ERROR_TYPE_VALUE: &str = "Error";

/// Generic error name used when the concrete type is unknown.
pub const GENERIC_ERROR_NAME: &str = "Error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedError>>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    /// A generic error carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(GENERIC_ERROR_NAME, message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_cause(mut self, cause: SerializedError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Capture `err` and its whole `source()` chain.
    ///
    /// [`RemoteError`] and [`RpcError`] keep their names; other error types
    /// are recorded as `Error`.
    pub fn from_error(err: &(dyn Error + 'static)) -> Self {
        if let Some(remote) = err.downcast_ref::<RemoteError>() {
            return Self::from_remote(remote);
        }
        if let Some(rpc) = err.downcast_ref::<RpcError>() {
            return rpc.to_serialized();
        }
        let mut serialized = Self::msg(err.to_string());
        if let Some(source) = err.source() {
            serialized.cause = Some(Box::new(Self::from_error(source)));
        }
        serialized
    }

    pub(crate) fn from_remote(remote: &RemoteError) -> Self {
        Self {
            name: remote.name.clone(),
            message: remote.message.clone(),
            stack: remote.stack.clone(),
            cause: remote
                .cause
                .as_deref()
                .map(|cause| Box::new(Self::from_remote(cause))),
        }
    }

    /// Rebuild a local error value, preserving the cause chain.
    pub fn revive(&self) -> RemoteError {
        RemoteError {
            name: self.name.clone(),
            message: self.message.clone(),
            stack: self.stack.clone(),
            cause: self.cause.as_deref().map(|cause| Box::new(cause.revive())),
        }
    }

    /// Depth of the cause chain, counting this error.
    pub fn chain_len(&self) -> usize {
        1 + self.cause.as_deref().map_or(0, SerializedError::chain_len)
    }
}

impl<E: Error + 'static> From<E> for SerializedError {
    fn from(err: E) -> Self {
        Self::from_error(&err)
    }
}

/// An error raised on the remote end of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    name: String,
    message: String,
    stack: Option<String>,
    cause: Option<Box<RemoteError>>,
}

impl RemoteError {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    pub fn cause(&self) -> Option<&RemoteError> {
        self.cause.as_deref()
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl Error for RemoteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Encode an error as an argument value, tagged with `"$type": "Error"`.
pub fn error_to_arg(error: &SerializedError) -> Value {
    let mut value = serde_json::to_value(error).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert(
            ERROR_TYPE_KEY.to_string(),
            Value::String(ERROR_TYPE_VALUE.to_string()),
        );
    }
    value
}

/// Recognize an argument value produced by [`error_to_arg`].
pub fn arg_to_error(value: &Value) -> Option<SerializedError> {
    if !is_error_value(value) {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

fn is_error_value(value: &Value) -> bool {
    value.get(ERROR_TYPE_KEY).and_then(Value::as_str) == Some(ERROR_TYPE_VALUE)
}

/// Rewrite every error nested anywhere in `args` into the form
/// [`error_to_arg`] produces.
///
/// Errors are found by their `"$type": "Error"` tag at any depth. A tagged
/// value that is not a valid error fails the whole call; the `Err` holds its
/// JSON pointer within the argument list.
pub fn normalize_error_args(args: &mut [Value]) -> std::result::Result<(), String> {
    let mut pointer = String::new();
    for (index, arg) in args.iter_mut().enumerate() {
        pointer.clear();
        let _ = write!(pointer, "/{index}");
        normalize_value(arg, &mut pointer)?;
    }
    Ok(())
}

fn normalize_value(value: &mut Value, pointer: &mut String) -> std::result::Result<(), String> {
    if is_error_value(value) {
        let error = arg_to_error(value).ok_or_else(|| pointer.clone())?;
        *value = error_to_arg(&error);
        return Ok(());
    }
    let depth = pointer.len();
    match value {
        Value::Array(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                let _ = write!(pointer, "/{index}");
                normalize_value(item, pointer)?;
                pointer.truncate(depth);
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                let _ = write!(pointer, "/{}", key.replace('~', "~0").replace('/', "~1"));
                normalize_value(item, pointer)?;
                pointer.truncate(depth);
            }
        }
        _ => {}
    }
    Ok(())
}

/// An error carried inside call arguments or results.
///
/// Serializes as the tagged value of [`error_to_arg`], so typed arguments
/// can hold errors at any depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorArg(pub SerializedError);

impl Serialize for ErrorArg {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        error_to_arg(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ErrorArg {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        arg_to_error(&value)
            .map(ErrorArg)
            .ok_or_else(|| D::Error::custom("expected an error value tagged with \"$type\": \"Error\""))
    }
}

impl From<SerializedError> for ErrorArg {
    fn from(error: SerializedError) -> Self {
        ErrorArg(error)
    }
}
