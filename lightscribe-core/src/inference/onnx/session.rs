//! ONNX Runtime session construction.
//!
//! Threading is tuned through `LIGHTSCRIBE_ORT_INTRA_THREADS`,
//! `LIGHTSCRIBE_ORT_INTER_THREADS` and `LIGHTSCRIBE_ORT_PARALLEL`.

use std::path::Path;

use ort::{
    ep,
    session::builder::{GraphOptimizationLevel, SessionBuilder},
    session::Session,
};
use tracing::info;

use crate::error::{Result, ScribeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionTuning {
    pub intra_threads: usize,
    pub inter_threads: usize,
    pub parallel_execution: bool,
}

impl SessionTuning {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let logical_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        Self {
            intra_threads: parse("LIGHTSCRIBE_ORT_INTRA_THREADS")
                .unwrap_or_else(|| logical_cores.clamp(2, 12))
                .clamp(1, 32),
            inter_threads: parse("LIGHTSCRIBE_ORT_INTER_THREADS")
                .unwrap_or(1)
                .clamp(1, 8),
            parallel_execution: lookup("LIGHTSCRIBE_ORT_PARALLEL")
                .map(|v| v.trim() == "1" || v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

fn session_err(e: ort::Error) -> ScribeError {
    ScribeError::OnnxSession(e.to_string())
}

pub(crate) fn create_session(model_path: &Path, tuning: SessionTuning) -> Result<Session> {
    let session = SessionBuilder::new()
        .map_err(session_err)?
        .with_intra_threads(tuning.intra_threads)
        .map_err(session_err)?
        .with_inter_threads(tuning.inter_threads)
        .map_err(session_err)?
        .with_parallel_execution(tuning.parallel_execution)
        .map_err(session_err)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(session_err)?
        .with_execution_providers([ep::CPU::default().build()])
        .map_err(session_err)?
        .commit_from_file(model_path)
        .map_err(session_err)?;

    info!(
        path = %model_path.display(),
        intra_threads = tuning.intra_threads,
        inter_threads = tuning.inter_threads,
        parallel_execution = tuning.parallel_execution,
        inputs = ?session.inputs().iter().map(|i| i.name().to_string()).collect::<Vec<_>>(),
        "ONNX session ready"
    );
    Ok(session)
}
