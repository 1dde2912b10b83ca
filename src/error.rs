//! Error types for Convoy

use thiserror::Error;

/// Result type for Convoy operations
pub type Result<T> = std::result::Result<T, ConvoyError>;

/// Convoy error types
#[derive(Error, Debug)]
pub enum ConvoyError {
    #[error("Compose error: {0}")]
    Compose(String),

    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Usage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Exec(ExecError),

    #[error("Operation interrupted")]
    Shutdown,
}

impl From<ExecError> for ConvoyError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Shutdown => ConvoyError::Shutdown,
            ExecError::Api(api) => ConvoyError::Api(api),
            other => ConvoyError::Exec(other),
        }
    }
}

/// Errors raised by the container engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("No such image: {0}")]
    ImageNotFound(String),

    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{explanation}")]
    Status { code: u16, explanation: String },
}

impl ApiError {
    /// HTTP-style status code of the failed request
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::ImageNotFound(_) | ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::Status { code, .. } => *code,
        }
    }

    /// Human readable explanation, as reported per object
    pub fn explanation(&self) -> String {
        self.to_string()
    }
}

/// Failure of a single unit of work inside a parallel run
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("{0}")]
    OperationFailed(String),

    #[error("Container \"{0}\" is unhealthy.")]
    HealthCheckFailed(String),

    #[error("Service \"{0}\" is missing a healthcheck configuration")]
    NoHealthCheckConfigured(String),

    #[error("Service \"{container}\" didn't complete successfully: exit {exit_code}")]
    CompletedUnsuccessfully { container: String, exit_code: i64 },

    #[error(transparent)]
    Api(#[from] ApiError),

    /// A dependency failed, the action never ran
    #[error("upstream error")]
    Upstream,

    #[error("Circular dependency detected between: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Operation interrupted")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecError {
    /// Known domain errors are reported per object; anything else is
    /// re-raised once the run has finished.
    pub fn is_recognized(&self) -> bool {
        matches!(
            self,
            ExecError::OperationFailed(_)
                | ExecError::HealthCheckFailed(_)
                | ExecError::NoHealthCheckConfigured(_)
                | ExecError::CompletedUnsuccessfully { .. }
                | ExecError::Api(_)
                | ExecError::Upstream
        )
    }

    pub fn is_image_not_found(&self) -> bool {
        matches!(self, ExecError::Api(ApiError::ImageNotFound(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_maps_to_top_level_variant() {
        let err: ConvoyError = ExecError::Shutdown.into();
        assert!(matches!(err, ConvoyError::Shutdown));

        let err: ConvoyError = ExecError::Api(ApiError::ImageNotFound("busybox".into())).into();
        assert!(matches!(err, ConvoyError::Api(ApiError::ImageNotFound(_))));
    }

    #[test]
    fn test_usage_error_is_bare_message() {
        let err = ConvoyError::Usage("Unknown signal: SIGBOGUS".into());
        assert_eq!(err.to_string(), "Unknown signal: SIGBOGUS");
    }

    #[test]
    fn test_recognized_errors() {
        assert!(ExecError::OperationFailed("boom".into()).is_recognized());
        assert!(ExecError::Api(ApiError::NotFound("abc".into())).is_recognized());
        assert!(!ExecError::Other(anyhow::anyhow!("unexpected")).is_recognized());
        assert!(!ExecError::Shutdown.is_recognized());
    }

    #[test]
    fn test_api_status_codes() {
        assert_eq!(ApiError::ImageNotFound("x".into()).status_code(), 404);
        assert_eq!(ApiError::Conflict("x".into()).status_code(), 409);
        let err = ApiError::Status {
            code: 500,
            explanation: "server error".into(),
        };
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.explanation(), "server error");
    }
}
