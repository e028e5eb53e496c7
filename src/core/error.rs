use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidValue,
    ConfigFileNotFound,

    ValidationInvalidArgument,

    PrivilegeEscalationUnavailable,
    DependencyMissing,

    RemoteCommandFailed,
    RemoteChannelClosed,

    TransferFailed,

    SecretsUnavailable,
    SecretsUndecryptable,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",
            ErrorCode::ConfigFileNotFound => "config.file_not_found",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::PrivilegeEscalationUnavailable => "preflight.privilege_unavailable",
            ErrorCode::DependencyMissing => "preflight.dependency_missing",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::RemoteChannelClosed => "remote.channel_closed",

            ErrorCode::TransferFailed => "transfer.failed",

            ErrorCode::SecretsUnavailable => "secrets.unavailable",
            ErrorCode::SecretsUndecryptable => "secrets.undecryptable",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMissingKeyDetails {
    pub keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDetails {
    pub user: String,
    pub host: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub target: TargetDetails,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChannelClosedDetails {
    pub command: String,
    pub reason: String,
    pub target: TargetDetails,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailedDetails {
    pub local_path: String,
    pub remote_path: String,
    pub error: String,
    pub target: TargetDetails,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyMissingDetails {
    pub dependency: String,
    pub exit_code: i32,
    pub target: TargetDetails,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
        }
    }

    pub fn config_missing_keys(keys: Vec<String>, path: Option<String>) -> Self {
        let message = format!("Missing required configuration: {}", keys.join(", "));
        Self::new(
            ErrorCode::ConfigMissingKey,
            message,
            to_details(ConfigMissingKeyDetails { keys, path }),
        )
        .with_hint("Run 'caput init' and edit caput.conf")
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let problem = problem.into();
        let message = format!("Invalid value for {}: {}", key, problem);
        Self::new(
            ErrorCode::ConfigInvalidValue,
            message,
            to_details(ConfigInvalidValueDetails {
                key,
                value,
                problem,
            }),
        )
    }

    pub fn config_file_not_found(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::ConfigFileNotFound,
            format!("Configuration file {} not found", path),
            serde_json::json!({ "path": path }),
        )
        .with_hint("Run 'caput init' to create a sample configuration")
    }

    pub fn validation_invalid_argument(field: impl Into<String>, problem: impl Into<String>) -> Self {
        let problem = problem.into();
        Self::new(
            ErrorCode::ValidationInvalidArgument,
            problem.clone(),
            to_details(InvalidArgumentDetails {
                field: field.into(),
                problem,
            }),
        )
    }

    pub fn privilege_unavailable(target: TargetDetails) -> Self {
        let sudoers = format!("{} ALL=(ALL) NOPASSWD:ALL", target.user);
        Self::new(
            ErrorCode::PrivilegeEscalationUnavailable,
            format!(
                "Setup user {} does not have passwordless sudo on {}",
                target.user, target.host
            ),
            serde_json::json!({ "target": target, "sudoersEntry": sudoers }),
        )
        .with_hint(format!("Add this sudoers entry on the server: {}", sudoers))
    }

    pub fn dependency_missing(details: DependencyMissingDetails) -> Self {
        let message = format!(
            "Required dependency {} is missing or inactive on {}",
            details.dependency, details.target.host
        );
        Self::new(ErrorCode::DependencyMissing, message, to_details(details))
            .with_hint("Install and start the service on the server, then re-run 'caput server'")
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        let message = format!(
            "Remote command failed (exit {}) on {}@{}: {}",
            details.exit_code,
            details.target.user,
            details.target.host,
            shell::summarize(&details.command)
        );
        Self::new(ErrorCode::RemoteCommandFailed, message, to_details(details))
    }

    pub fn remote_channel_closed(details: RemoteChannelClosedDetails) -> Self {
        let message = format!(
            "Connection to {}@{} closed before an exit status was reported ({}): {}",
            details.target.user,
            details.target.host,
            details.reason,
            shell::summarize(&details.command)
        );
        Self::new(ErrorCode::RemoteChannelClosed, message, to_details(details))
    }

    pub fn transfer_failed(details: TransferFailedDetails) -> Self {
        let message = format!(
            "Upload of {} to {}:{} failed: {}",
            details.local_path, details.target.host, details.remote_path, details.error
        );
        Self::new(ErrorCode::TransferFailed, message, to_details(details))
    }

    pub fn secrets_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::SecretsUnavailable,
            message,
            Value::Object(serde_json::Map::new()),
        )
    }

    pub fn secrets_undecryptable(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::SecretsUndecryptable,
            message,
            Value::Object(serde_json::Map::new()),
        )
        .with_hint("Check that the master key matches config/credentials.yml.enc")
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalIoError,
            "IO error",
            to_details(InternalIoErrorDetails {
                error: error.into(),
                context,
            }),
        )
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalJsonError,
            "JSON error",
            serde_json::json!({ "error": error.into(), "context": context }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    /// Replace the recorded remote command for commands that embed secrets.
    pub fn redact_command(mut self, replacement: &str) -> Self {
        if let Some(command) = self.details.get_mut("command") {
            if let Value::String(original) = command {
                let summary = shell::summarize(original);
                if !summary.is_empty() {
                    self.message = self.message.replace(summary, replacement);
                }
            }
            *command = Value::String(replacement.to_string());
        }
        self
    }

    /// Single line shown to the operator before the process exits.
    pub fn diagnostic(&self) -> String {
        match self.code {
            ErrorCode::InternalIoError | ErrorCode::InternalJsonError | ErrorCode::InternalUnexpected => {
                let detail = self
                    .details
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                format!("error: {}: {}", self.message, detail)
            }
            _ => format!("error: {}", self.message),
        }
    }
}
