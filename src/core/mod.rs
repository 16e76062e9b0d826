pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::{AnalyzerConfig, BinarizationMethod, ProcessingOptions, ReadingDirection};
pub use errors::{ConfigError, DetectError, DetectResult, ModelError};
pub use types::{
    Advisory, BoundingBox, CancelFlag, Detection, DetectionSet, DetectionSource, PanelLayout, PixelBuffer,
    RegionClass, StageTiming,
};
