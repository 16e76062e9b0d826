// Manga page preprocessing and speech-bubble / panel region detection
//
// core: configuration, errors and data types
// services: preprocessing stages, detectors, merging and layout
// orchestration: the page analyzer tying stages, timeouts and the cache together

pub mod core;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::{AnalyzerConfig, BinarizationMethod, ProcessingOptions, ReadingDirection},
    errors::{ConfigError, DetectError, DetectResult, ModelError},
    types::{
        Advisory, BoundingBox, CancelFlag, Detection, DetectionSet, DetectionSource, PanelLayout,
        PixelBuffer, RegionClass,
    },
};

pub use orchestration::PageAnalyzer;

pub use services::{MlDetector, RegionModel, ResultCache};

pub use utils::{load_pixel_buffer_async, Metrics};
