pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{content_defect, load_pixel_buffer_async};
pub use metrics::{Metrics, MetricsSnapshot};
