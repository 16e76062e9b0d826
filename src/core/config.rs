use crate::core::errors::{ConfigError, DetectError, DetectResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Global binarization strategy used by the preprocessing pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinarizationMethod {
    Otsu,
    Adaptive,
    Sauvola,
}

impl FromStr for BinarizationMethod {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "otsu" => Ok(BinarizationMethod::Otsu),
            "adaptive" => Ok(BinarizationMethod::Adaptive),
            "sauvola" => Ok(BinarizationMethod::Sauvola),
            other => Err(DetectError::unsupported(
                "binarization_method",
                format!("unknown method '{}' (expected otsu, adaptive or sauvola)", other),
            )),
        }
    }
}

impl fmt::Display for BinarizationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinarizationMethod::Otsu => "otsu",
            BinarizationMethod::Adaptive => "adaptive",
            BinarizationMethod::Sauvola => "sauvola",
        };
        f.write_str(name)
    }
}

/// Page reading direction (manga is usually right-to-left)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingDirection {
    Ltr,
    Rtl,
}

impl FromStr for ReadingDirection {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ltr" => Ok(ReadingDirection::Ltr),
            "rtl" => Ok(ReadingDirection::Rtl),
            other => Err(DetectError::unsupported(
                "reading_direction",
                format!("unknown direction '{}' (expected ltr or rtl)", other),
            )),
        }
    }
}

/// Per-invocation processing options.
///
/// Validated once before any stage runs; stages never clamp or second-guess
/// these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    pub enable_denoising: bool,
    pub enable_binarization: bool,
    pub enable_deskewing: bool,
    pub enable_contrast_enhancement: bool,
    pub enable_panel_detection: bool,
    pub max_dimension: u32,
    pub min_dimension: u32,
    pub denoise_strength: u32,
    pub binarization_method: BinarizationMethod,
    pub adaptive_block_size: u32,
    pub adaptive_c: f32,
    /// Degrees
    pub max_skew_angle: f32,
    /// Degrees; smaller estimated skews are left alone
    pub skew_correction_threshold: f32,
    pub contrast_clip_limit: f32,
    pub contrast_tile_size: u32,
    pub screen_tone_removal: bool,
    pub ml_confidence_threshold: f32,
    pub heuristic_confidence_threshold: f32,
    pub nms_threshold: f32,
    pub max_detections: usize,
    pub reading_direction: ReadingDirection,
    /// Local variance band treated as halftone dots (empirical)
    pub screen_tone_variance_min: f32,
    pub screen_tone_variance_max: f32,
    /// Edge pixels with fewer in-component neighbours count as tail tips (empirical)
    pub tail_neighbor_threshold: u32,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            enable_denoising: true,
            enable_binarization: true,
            enable_deskewing: true,
            enable_contrast_enhancement: true,
            enable_panel_detection: true,
            max_dimension: 2048,
            min_dimension: 400,
            denoise_strength: 10,
            binarization_method: BinarizationMethod::Adaptive,
            adaptive_block_size: 15,
            adaptive_c: 10.0,
            max_skew_angle: 15.0,
            skew_correction_threshold: 0.5,
            contrast_clip_limit: 2.0,
            contrast_tile_size: 8,
            screen_tone_removal: true,
            ml_confidence_threshold: 0.75,
            heuristic_confidence_threshold: 0.6,
            nms_threshold: 0.3,
            max_detections: 50,
            reading_direction: ReadingDirection::Ltr,
            screen_tone_variance_min: 100.0,
            screen_tone_variance_max: 2000.0,
            tail_neighbor_threshold: 3,
        }
    }
}

impl ProcessingOptions {
    /// Defaults overridden by `MANGA_*` environment variables, then validated
    pub fn from_env() -> DetectResult<Self> {
        let _ = dotenvy::dotenv();

        let mut opts = Self::default();
        read_env("MANGA_ENABLE_DENOISING", &mut opts.enable_denoising)?;
        read_env("MANGA_ENABLE_BINARIZATION", &mut opts.enable_binarization)?;
        read_env("MANGA_ENABLE_DESKEWING", &mut opts.enable_deskewing)?;
        read_env(
            "MANGA_ENABLE_CONTRAST_ENHANCEMENT",
            &mut opts.enable_contrast_enhancement,
        )?;
        read_env("MANGA_ENABLE_PANEL_DETECTION", &mut opts.enable_panel_detection)?;
        read_env("MANGA_MAX_DIMENSION", &mut opts.max_dimension)?;
        read_env("MANGA_MIN_DIMENSION", &mut opts.min_dimension)?;
        read_env("MANGA_DENOISE_STRENGTH", &mut opts.denoise_strength)?;
        read_env("MANGA_BINARIZATION_METHOD", &mut opts.binarization_method)?;
        read_env("MANGA_ADAPTIVE_BLOCK_SIZE", &mut opts.adaptive_block_size)?;
        read_env("MANGA_ADAPTIVE_C", &mut opts.adaptive_c)?;
        read_env("MANGA_MAX_SKEW_ANGLE", &mut opts.max_skew_angle)?;
        read_env(
            "MANGA_SKEW_CORRECTION_THRESHOLD",
            &mut opts.skew_correction_threshold,
        )?;
        read_env("MANGA_CONTRAST_CLIP_LIMIT", &mut opts.contrast_clip_limit)?;
        read_env("MANGA_CONTRAST_TILE_SIZE", &mut opts.contrast_tile_size)?;
        read_env("MANGA_SCREEN_TONE_REMOVAL", &mut opts.screen_tone_removal)?;
        read_env("MANGA_ML_CONFIDENCE_THRESHOLD", &mut opts.ml_confidence_threshold)?;
        read_env(
            "MANGA_HEURISTIC_CONFIDENCE_THRESHOLD",
            &mut opts.heuristic_confidence_threshold,
        )?;
        read_env("MANGA_NMS_THRESHOLD", &mut opts.nms_threshold)?;
        read_env("MANGA_MAX_DETECTIONS", &mut opts.max_detections)?;
        read_env("MANGA_READING_DIRECTION", &mut opts.reading_direction)?;

        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> DetectResult<()> {
        if self.min_dimension == 0 {
            return Err(DetectError::unsupported("min_dimension", "must be > 0"));
        }
        if self.max_dimension > 8192 {
            return Err(DetectError::unsupported(
                "max_dimension",
                format!("must be <= 8192, got {}", self.max_dimension),
            ));
        }
        if self.min_dimension > self.max_dimension {
            return Err(DetectError::unsupported(
                "min_dimension",
                format!(
                    "must not exceed max_dimension ({} > {})",
                    self.min_dimension, self.max_dimension
                ),
            ));
        }
        if self.denoise_strength > 100 {
            return Err(DetectError::unsupported(
                "denoise_strength",
                format!("must be between 0 and 100, got {}", self.denoise_strength),
            ));
        }
        if self.adaptive_block_size < 3 || self.adaptive_block_size % 2 == 0 {
            return Err(DetectError::unsupported(
                "adaptive_block_size",
                format!("must be an odd number >= 3, got {}", self.adaptive_block_size),
            ));
        }
        if !self.adaptive_c.is_finite() {
            return Err(DetectError::unsupported("adaptive_c", "must be finite"));
        }
        if !(self.max_skew_angle > 0.0 && self.max_skew_angle <= 45.0) {
            return Err(DetectError::unsupported(
                "max_skew_angle",
                format!("must be in (0, 45] degrees, got {}", self.max_skew_angle),
            ));
        }
        if !(self.skew_correction_threshold >= 0.0 && self.skew_correction_threshold.is_finite()) {
            return Err(DetectError::unsupported(
                "skew_correction_threshold",
                format!("must be >= 0, got {}", self.skew_correction_threshold),
            ));
        }
        if !(self.contrast_clip_limit > 0.0 && self.contrast_clip_limit.is_finite()) {
            return Err(DetectError::unsupported(
                "contrast_clip_limit",
                format!("must be > 0, got {}", self.contrast_clip_limit),
            ));
        }
        if self.contrast_tile_size == 0 || self.contrast_tile_size > 64 {
            return Err(DetectError::unsupported(
                "contrast_tile_size",
                format!("must be between 1 and 64, got {}", self.contrast_tile_size),
            ));
        }
        for (name, value) in [
            ("ml_confidence_threshold", self.ml_confidence_threshold),
            ("heuristic_confidence_threshold", self.heuristic_confidence_threshold),
            ("nms_threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DetectError::unsupported(
                    name,
                    format!("must be in [0.0, 1.0], got {}", value),
                ));
            }
        }
        if self.max_detections == 0 {
            return Err(DetectError::unsupported("max_detections", "must be > 0"));
        }
        if !(self.screen_tone_variance_min >= 0.0
            && self.screen_tone_variance_min <= self.screen_tone_variance_max)
        {
            return Err(DetectError::unsupported(
                "screen_tone_variance_min",
                format!(
                    "band [{}, {}] is empty or negative",
                    self.screen_tone_variance_min, self.screen_tone_variance_max
                ),
            ));
        }
        if self.tail_neighbor_threshold == 0 || self.tail_neighbor_threshold > 8 {
            return Err(DetectError::unsupported(
                "tail_neighbor_threshold",
                format!("must be between 1 and 8, got {}", self.tail_neighbor_threshold),
            ));
        }
        Ok(())
    }

    /// Stable byte fingerprint for cache keys
    pub fn fingerprint(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

fn read_env<T>(key: &str, slot: &mut T) -> DetectResult<()>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            *slot = raw.trim().parse().map_err(|e: T::Err| {
                DetectError::unsupported(key, format!("cannot parse '{}': {}", raw, e))
            })?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Engine-wide settings for the page analyzer
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Pages analyzed at the same time (each may hold several full-size buffers)
    pub max_concurrent_pages: usize,
    pub cache_capacity: usize,
    pub detection_timeout: Duration,
    pub model_load_timeout: Duration,
    pub model_path: Option<String>,
    pub ml_input_size: u32,
    pub inference_backend: Option<String>,
    pub log_level: Level,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pages: 2,
            cache_capacity: 64,
            detection_timeout: Duration::from_secs(30),
            model_load_timeout: Duration::from_secs(20),
            model_path: None,
            ml_input_size: 640,
            inference_backend: None,
            log_level: Level::INFO,
        }
    }
}

impl AnalyzerConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(defaults.log_level);

        Ok(Self {
            max_concurrent_pages: parse_env("MAX_CONCURRENT_PAGES")?
                .unwrap_or(defaults.max_concurrent_pages),
            cache_capacity: parse_env("RESULT_CACHE_CAPACITY")?.unwrap_or(defaults.cache_capacity),
            detection_timeout: parse_env::<u64>("DETECTION_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.detection_timeout),
            model_load_timeout: parse_env::<u64>("MODEL_LOAD_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.model_load_timeout),
            model_path: env::var("DETECTOR_MODEL_PATH")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            ml_input_size: parse_env("ML_INPUT_SIZE")?.unwrap_or(defaults.ml_input_size),
            inference_backend: env::var("INFERENCE_BACKEND")
                .ok()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty()),
            log_level,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_pages == 0 {
            return Err(ConfigError::InvalidConcurrency(self.max_concurrent_pages));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::InvalidCacheCapacity(self.cache_capacity));
        }
        if self.detection_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                name: "detection_timeout",
                reason: "must be > 0".to_string(),
            });
        }
        if self.model_load_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                name: "model_load_timeout",
                reason: "must be > 0".to_string(),
            });
        }
        if !(320..=2048).contains(&self.ml_input_size) {
            return Err(ConfigError::InvalidModelInputSize(self.ml_input_size));
        }
        Ok(())
    }

    pub fn log_filter(&self) -> String {
        let level = match self.log_level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        format!("manga_regions={},ort=off", level)
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::EnvVarError(format!("{}='{}': {}", key, raw, e))),
        _ => Ok(None),
    }
}
