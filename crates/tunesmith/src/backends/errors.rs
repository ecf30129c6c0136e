use thiserror::Error;

use crate::dataset::DatasetError;

/// Errors produced by backend adapters.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("training process failed: {0}")]
    ProcessFailed(String),

    #[error("invalid dataset: {0}")]
    InvalidDataset(#[from] DatasetError),

    #[error("unsupported operation: {0}")]
    NotSupported(String),

    #[error("training run cancelled")]
    Cancelled,

    #[error("execution error: {0}")]
    ExecutionError(String),
}

impl BackendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackendError::Cancelled)
    }
}

fn is_network_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || (err.status().is_none() && err.is_request())
}

impl From<reqwest::Error> for BackendError {
    fn from(error: reqwest::Error) -> Self {
        if is_network_error(&error) {
            let msg = if error.is_timeout() {
                "request timed out".to_string()
            } else if let Some(url) = error.url() {
                match (url.host_str(), url.port()) {
                    (Some(host), Some(port)) => {
                        format!("could not connect to {host}:{port}")
                    }
                    (Some(host), None) => format!("could not connect to {host}"),
                    _ => "could not connect to the backend".to_string(),
                }
            } else {
                "could not connect to the backend".to_string()
            };
            return BackendError::ConnectionFailed(msg);
        }

        match error.status() {
            Some(status) => {
                BackendError::RequestFailed(format!("{error} (status: {status})"))
            }
            None => BackendError::RequestFailed(error.to_string()),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(error: std::io::Error) -> Self {
        BackendError::ExecutionError(error.to_string())
    }
}
