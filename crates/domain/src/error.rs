/// Shared error type used across all Agent Blob crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("denied by policy: {0}")]
    PolicyDenied(String),

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable classification tag carried on `run.final` error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Http(_) => "http",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol",
            Self::PolicyDenied(_) => "policy_denied",
            Self::Tool { .. } => "tool",
            Self::Provider { .. } => "provider",
            Self::StateConflict(_) => "state_conflict",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Config(_) => "config",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::PolicyDenied("shell.run".into()).kind(), "policy_denied");
        assert_eq!(
            Error::Provider {
                provider: "openai".into(),
                message: "boom".into()
            }
            .kind(),
            "provider"
        );
        assert_eq!(Error::ResourceExhausted("queue_full".into()).kind(), "resource_exhausted");
        assert_eq!(Error::StateConflict("stop after done".into()).kind(), "state_conflict");
    }

    #[test]
    fn display_includes_context() {
        let e = Error::Tool {
            tool: "shell_run".into(),
            message: "exit 1".into(),
        };
        assert_eq!(e.to_string(), "tool shell_run: exit 1");
    }
}
