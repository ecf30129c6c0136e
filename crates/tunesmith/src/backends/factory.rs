use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use super::{Backend, OllamaBackend, TransformersBackend, VllmBackend};
use crate::model::Framework;

/// Stock backend table: one environment-configured adapter per supported
/// framework. Adding a framework means adding an entry here; the
/// orchestrator dispatches through the table and never branches on the
/// concrete type.
pub fn stock_backends() -> Result<HashMap<Framework, Arc<dyn Backend>>> {
    let mut backends: HashMap<Framework, Arc<dyn Backend>> = HashMap::new();
    backends.insert(Framework::Ollama, Arc::new(OllamaBackend::from_env()?));
    backends.insert(Framework::Vllm, Arc::new(VllmBackend::from_env()?));
    backends.insert(
        Framework::Transformers,
        Arc::new(TransformersBackend::from_env()),
    );
    Ok(backends)
}
