use thiserror::Error;

/// Main error type for confr operations.
#[derive(Error, Debug)]
pub enum ConfrError {
    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid header name: {0}")]
    HeaderName(#[from] reqwest::header::InvalidHeaderName),

    #[error("Invalid header value: {0}")]
    HeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Template error: {0}")]
    Minijinja(#[from] minijinja::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("Poison Error: {0}")]
    PoisonError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("backend not found for key: {0}")]
    BackendNotFound(String),

    #[error("render error in {template}: {message}")]
    RenderError { template: String, message: String },

    #[error("include cycle detected: {0}")]
    IncludeCycle(String),

    #[error("include depth exceeded (max {max}) at {path}")]
    IncludeDepth { path: String, max: usize },

    #[error("check command failed for {resource}: {cause}")]
    CheckError { resource: String, cause: String },

    #[error("reload command failed for {resource}: {cause}")]
    ReloadError { resource: String, cause: String },

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),
}

/// Convenience Result type that uses ConfrError
pub type Result<T> = std::result::Result<T, ConfrError>;

/// Classification of a resource-processing failure, used by the run loop's
/// failure-mode policy (fail-fast / best-effort) to decide how to log and
/// aggregate it without string-matching the underlying error. See spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Config,
    Fetch,
    Render,
    Check,
    Rename,
    Reload,
    Transport,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Config => "config",
            FailureKind::Fetch => "fetch",
            FailureKind::Render => "render",
            FailureKind::Check => "check",
            FailureKind::Rename => "rename",
            FailureKind::Reload => "reload",
            FailureKind::Transport => "transport",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfrError::ConfigError("missing src".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing src");
    }

    #[test]
    fn test_check_error_display() {
        let err = ConfrError::CheckError {
            resource: "nginx".into(),
            cause: "exit status 1".into(),
        };
        assert!(err.to_string().contains("check command failed for nginx"));
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::Render.to_string(), "render");
    }
}
