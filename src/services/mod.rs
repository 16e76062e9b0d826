pub mod cache;
pub mod classifier;
pub mod components;
pub mod layout;
pub mod ml_detector;
#[cfg(feature = "onnx")]
pub mod onnx_builder;
pub mod panels;
pub mod postprocess;
pub mod preprocessing;
pub mod skew;
pub mod threshold;

// Re-export commonly used services
pub use cache::ResultCache;
pub use components::{Component, ConnectedComponentAnalyzer, ShapeFeatures};
pub use layout::PanelLayoutAnalyzer;
pub use ml_detector::{MlDetector, RegionModel};
pub use panels::PanelBorderScanner;
pub use preprocessing::{PreprocessedPage, PreprocessingPipeline};
