//! Environment-driven runtime settings for the stock backends.

use std::path::PathBuf;

use url::Url;

use crate::backends::BackendError;

pub const OLLAMA_HOST_DEFAULT: &str = "localhost";
pub const OLLAMA_DEFAULT_PORT: u16 = 11434;
pub const VLLM_URL_DEFAULT: &str = "http://localhost:8000";

/// Connection settings for a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaRuntime {
    /// Host name, `host:port`, or full URL.
    pub host: String,
}

impl OllamaRuntime {
    pub fn from_env() -> Self {
        let host =
            std::env::var("OLLAMA_HOST").unwrap_or_else(|_| OLLAMA_HOST_DEFAULT.to_string());
        Self { host }
    }

    /// Base URL for API calls. `OLLAMA_HOST` is sometimes just the host or
    /// `host:port` without a scheme; default the scheme and port when
    /// missing.
    pub fn base_url(&self) -> Result<Url, BackendError> {
        let base = if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.clone()
        } else {
            format!("http://{}", self.host)
        };

        let mut base_url = Url::parse(&base)
            .map_err(|e| BackendError::RequestFailed(format!("invalid base URL: {e}")))?;

        let explicit_default_port = self.host.ends_with(":80") || self.host.ends_with(":443");
        if base_url.port().is_none() && !explicit_default_port {
            base_url
                .set_port(Some(OLLAMA_DEFAULT_PORT))
                .map_err(|_| BackendError::RequestFailed("failed to set default port".into()))?;
        }

        Ok(base_url)
    }
}

impl Default for OllamaRuntime {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Connection settings for a vLLM-compatible inference server.
#[derive(Debug, Clone)]
pub struct VllmRuntime {
    pub base_url: String,
}

impl VllmRuntime {
    pub fn from_env() -> Self {
        let base_url = std::env::var("VLLM_URL").unwrap_or_else(|_| VLLM_URL_DEFAULT.to_string());
        Self { base_url }
    }
}

impl Default for VllmRuntime {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Python runtime for the script-driven trainer.
#[derive(Debug, Clone)]
pub struct TrainerRuntime {
    /// Interpreter, e.g. `python3` or a venv path.
    pub python: String,
    /// Where per-job run directories and checkpoints live.
    pub output_root: PathBuf,
}

impl TrainerRuntime {
    pub fn from_env() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let default_root = home.join(".config/tunesmith/training");
        let default_venv = home.join(".config/tunesmith/venv");

        // Explicit env var first, then an auto-detected venv, then the
        // system interpreter.
        let python = if let Ok(python) = std::env::var("TRAINING_PYTHON") {
            python
        } else if default_venv.join("bin/python").exists() {
            default_venv.join("bin/python").display().to_string()
        } else {
            "python3".to_string()
        };

        let output_root = std::env::var("TRAINING_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(default_root);

        Self {
            python,
            output_root,
        }
    }
}

impl Default for TrainerRuntime {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_scheme_and_port() {
        let runtime = OllamaRuntime {
            host: "localhost".into(),
        };
        assert_eq!(
            runtime.base_url().unwrap().as_str(),
            "http://localhost:11434/"
        );
    }

    #[test]
    fn explicit_port_is_kept() {
        let runtime = OllamaRuntime {
            host: "http://10.0.0.5:9000".into(),
        };
        assert_eq!(
            runtime.base_url().unwrap().as_str(),
            "http://10.0.0.5:9000/"
        );
    }

    #[test]
    fn standard_ports_are_not_overridden() {
        let runtime = OllamaRuntime {
            host: "ollama.internal:80".into(),
        };
        let url = runtime.base_url().unwrap();
        assert_eq!(url.port_or_known_default(), Some(80));
    }
}
