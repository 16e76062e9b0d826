// ONNX Runtime session construction with execution-provider selection, plus
// the session pool shared by inference calls

use anyhow::{bail, Context, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::{debug, info, warn};

use crate::core::errors::{ModelError, ModelResult};
use crate::core::types::CancelFlag;

/// How often a waiting `acquire_unless_cancelled` looks at its flag
const ACQUIRE_POLL: Duration = Duration::from_millis(20);

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

/// Intra-op threads for CPU inference.
///
/// Windows is capped at 6: thread synchronization overhead outweighs the
/// extra cores there (microsoft/onnxruntime#3713).
fn optimal_intra_op_threads() -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let optimal = std::cmp::min(6, total_cores).max(1);

    #[cfg(not(target_os = "windows"))]
    let optimal = total_cores.max(1);

    debug!("CPU threads: {} total cores, using {} for inference", total_cores, optimal);
    optimal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    TensorRt,
    Cuda,
    CoreMl,
    DirectMl,
    OpenVino,
    Cpu,
}

impl Accelerator {
    pub fn label(self) -> &'static str {
        match self {
            Accelerator::TensorRt => "TensorRT",
            Accelerator::Cuda => "CUDA",
            Accelerator::CoreMl => "CoreML",
            Accelerator::DirectMl => "DirectML",
            Accelerator::OpenVino => "OpenVINO-CPU",
            Accelerator::Cpu => "CPU",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "TENSORRT" => Some(Accelerator::TensorRt),
            "CUDA" => Some(Accelerator::Cuda),
            "COREML" => Some(Accelerator::CoreMl),
            "DIRECTML" => Some(Accelerator::DirectMl),
            "OPENVINO" => Some(Accelerator::OpenVino),
            "CPU" => Some(Accelerator::Cpu),
            _ => None,
        }
    }

    /// Providers compiled into this build, fastest first. CPU is always last.
    pub fn compiled() -> Vec<Self> {
        #[allow(unused_mut)]
        let mut order = Vec::new();
        #[cfg(feature = "tensorrt")]
        order.push(Accelerator::TensorRt);
        #[cfg(feature = "cuda")]
        order.push(Accelerator::Cuda);
        #[cfg(all(target_os = "macos", feature = "coreml"))]
        order.push(Accelerator::CoreMl);
        #[cfg(all(target_os = "windows", feature = "directml"))]
        order.push(Accelerator::DirectMl);
        #[cfg(feature = "openvino")]
        order.push(Accelerator::OpenVino);
        order.push(Accelerator::Cpu);
        order
    }

    pub fn build(self, model_bytes: &[u8]) -> Result<Session> {
        let threads = optimal_intra_op_threads();
        let session = match self {
            #[cfg(feature = "tensorrt")]
            Accelerator::TensorRt => Session::builder()?
                .with_execution_providers([TensorRTExecutionProvider::default().build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(threads)?
                .with_inter_threads(1)?
                .commit_from_memory(model_bytes)?,

            #[cfg(feature = "cuda")]
            Accelerator::Cuda => Session::builder()?
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(threads)?
                .with_inter_threads(1)?
                .commit_from_memory(model_bytes)?,

            #[cfg(all(target_os = "macos", feature = "coreml"))]
            Accelerator::CoreMl => Session::builder()?
                .with_execution_providers([CoreMLExecutionProvider::default().build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(threads)?
                .with_inter_threads(1)?
                .commit_from_memory(model_bytes)?,

            // DirectML needs sequential execution, no memory pattern and a
            // conservative optimization level
            #[cfg(all(target_os = "windows", feature = "directml"))]
            Accelerator::DirectMl => Session::builder()?
                .with_execution_providers([DirectMLExecutionProvider::default().build()])?
                .with_parallel_execution(false)?
                .with_memory_pattern(false)?
                .with_optimization_level(GraphOptimizationLevel::Level1)?
                .with_intra_threads(threads)?
                .with_inter_threads(1)?
                .commit_from_memory(model_bytes)?,

            #[cfg(feature = "openvino")]
            Accelerator::OpenVino => Session::builder()?
                .with_execution_providers([OpenVINOExecutionProvider::default()
                    .with_device_type("CPU")
                    .build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(threads)?
                .with_inter_threads(1)?
                .commit_from_memory(model_bytes)?,

            Accelerator::Cpu => Session::builder()?
                .with_execution_providers([CPUExecutionProvider::default().build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(threads)?
                .with_inter_threads(1)?
                .commit_from_memory(model_bytes)?,

            #[allow(unreachable_patterns)]
            other => bail!(
                "{} backend not available in this build (enable the matching cargo feature)",
                other.label()
            ),
        };
        Ok(session)
    }
}

/// Build a session on the first working provider.
///
/// `forced_backend` (from `INFERENCE_BACKEND`) pins one provider; `AUTO` or
/// `None` walks `Accelerator::compiled()` in order.
pub fn build_session_with_acceleration(
    model_bytes: &[u8],
    model_name: &str,
    forced_backend: Option<&str>,
) -> Result<(Accelerator, Session)> {
    if let Some(name) = forced_backend.filter(|b| !b.eq_ignore_ascii_case("auto")) {
        let accelerator = match Accelerator::parse(name) {
            Some(a) => a,
            None => bail!(
                "Unknown inference backend '{}'. Valid options: TENSORRT, CUDA, OPENVINO, DIRECTML, COREML, CPU, AUTO",
                name
            ),
        };
        info!("INFERENCE_BACKEND={}, forcing {} for {}", name, accelerator.label(), model_name);
        let session = accelerator
            .build(model_bytes)
            .with_context(|| format!("Failed to load {} with {}", model_name, accelerator.label()))?;
        return Ok((accelerator, session));
    }

    for accelerator in Accelerator::compiled() {
        match accelerator.build(model_bytes) {
            Ok(session) => {
                if accelerator == Accelerator::Cpu {
                    warn!("Using CPU-only inference for {} (no GPU acceleration available)", model_name);
                } else {
                    info!("✓ Using {} acceleration for {}", accelerator.label(), model_name);
                }
                return Ok((accelerator, session));
            }
            Err(e) => debug!("{} unavailable for {}: {:#}", accelerator.label(), model_name, e),
        }
    }

    bail!(
        "Failed to load {} ONNX model ({:.1} MB) on any backend",
        model_name,
        model_bytes.len() as f32 / 1_048_576.0
    )
}

/// Fixed set of sessions handed out over a bounded channel
pub struct OnnxSessionPool {
    sender: Sender<Session>,
    receiver: Receiver<Session>,
}

impl OnnxSessionPool {
    pub fn new(sessions: Vec<Session>) -> Self {
        let (sender, receiver) = bounded(sessions.len().max(1));
        for session in sessions {
            // Capacity equals the session count, so this never blocks
            let _ = sender.send(session);
        }
        Self { sender, receiver }
    }

    /// Waits for a free session, giving up once `cancel` is set
    pub fn acquire_unless_cancelled(&self, cancel: &CancelFlag) -> ModelResult<Session> {
        loop {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }
            match self.receiver.recv_timeout(ACQUIRE_POLL) {
                Ok(session) => return Ok(session),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ModelError::InferenceFailed("session pool closed".to_string()))
                }
            }
        }
    }

    pub fn release(&self, session: Session) {
        if self.sender.send(session).is_err() {
            warn!("Session pool closed, dropping session");
        }
    }

    pub fn available(&self) -> usize {
        self.receiver.len()
    }
}
