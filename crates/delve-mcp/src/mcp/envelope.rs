use delve_core::{BackendError, Error, FailureCode};
use serde::Serialize;

pub(crate) const SCHEMA_VERSION: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorCode {
    InvalidParams,
    NotConfigured,
    ConnectionFailed,
    StreamDisconnected,
    ResearchFailed,
    Timeout,
    NoResponse,
    BackendUnavailable,
    BackendError,
    UnexpectedError,
}

impl ErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "invalid_params",
            Self::NotConfigured => "not_configured",
            Self::ConnectionFailed => "connection_failed",
            Self::StreamDisconnected => "stream_disconnected",
            Self::ResearchFailed => "research_failed",
            Self::Timeout => "timeout",
            Self::NoResponse => "no_response",
            Self::BackendUnavailable => "backend_unavailable",
            Self::BackendError => "backend_error",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub(crate) fn retryable(self) -> bool {
        match self {
            Self::ConnectionFailed
            | Self::StreamDisconnected
            | Self::Timeout
            | Self::NoResponse
            | Self::BackendUnavailable => true,
            Self::InvalidParams
            | Self::NotConfigured
            | Self::ResearchFailed
            | Self::BackendError
            | Self::UnexpectedError => false,
        }
    }

    pub(crate) fn hint(self) -> &'static str {
        match self {
            Self::InvalidParams => "Check the tool arguments; required strings must be non-empty.",
            Self::NotConfigured => {
                "Set DELVE_GEMINI_API_KEY (or GEMINI_API_KEY / GOOGLE_API_KEY) in the server environment, or point DELVE_ENV_FILE at a file that sets it."
            }
            Self::ConnectionFailed => {
                "The research service never started the interaction. It may be overloaded; retry in a minute."
            }
            Self::StreamDisconnected => {
                "The interaction may still be running. Call research_status with the interaction_id to check on it."
            }
            Self::ResearchFailed => "The research agent reported a failure. Rephrase or narrow the query.",
            Self::Timeout => {
                "The run exceeded its wall-clock ceiling. Check research_status with the interaction_id, or raise timeout_secs."
            }
            Self::NoResponse => "The follow-up produced no text. Retry, or rephrase the question.",
            Self::BackendUnavailable => "Transient service error; retry shortly.",
            Self::BackendError => "The service rejected the request. Check the API key, agent and model names.",
            Self::UnexpectedError => "Unexpected failure; see server logs (stderr).",
        }
    }
}

impl From<FailureCode> for ErrorCode {
    fn from(code: FailureCode) -> Self {
        match code {
            FailureCode::ConnectionFailed => Self::ConnectionFailed,
            FailureCode::StreamDisconnected => Self::StreamDisconnected,
            FailureCode::ResearchFailed => Self::ResearchFailed,
            FailureCode::Timeout => Self::Timeout,
            FailureCode::NoResponse => Self::NoResponse,
        }
    }
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::InvalidRequest(_) => Self::InvalidParams,
            Error::NotConfigured(_) => Self::NotConfigured,
            Error::Backend(BackendError::Retryable(_)) => Self::BackendUnavailable,
            Error::Backend(BackendError::Fatal(_)) => Self::BackendError,
            Error::Research { code, .. } => (*code).into(),
        }
    }
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
    if payload.get("request").is_none() {
        payload["request"] = serde_json::Value::Null;
    }
}

pub(crate) fn error_obj(
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: String,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: hint.to_string(),
        retryable: code.retryable(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": hint.to_string(),
            "retryable": code.retryable()
        }),
    }
}

/// `ok=false` payload for an engine error. Keeps the interaction id so callers can check on a
/// run that is still going.
pub(crate) fn error_payload(e: &Error) -> serde_json::Value {
    let code = ErrorCode::from(e);
    let mut err = error_obj(code, e, code.hint());
    if let Some(fc) = e.failure_code() {
        err["failure_code"] = serde_json::json!(fc.as_str());
    }
    let mut payload = serde_json::json!({ "ok": false, "error": err });
    if let Some(id) = e.interaction_id() {
        payload["interaction_id"] = serde_json::json!(id);
    }
    payload
}
