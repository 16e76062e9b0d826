// Page analyzer: main detection workflow
//
// Validates options, consults the result cache, then runs the model and the
// preprocessing + heuristic path side by side before merging, suppressing,
// ordering and associating detections.

use futures::future::join_all;
use rayon::prelude::*;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::core::config::{AnalyzerConfig, ProcessingOptions};
use crate::core::errors::{ConfigResult, DetectError, DetectResult};
use crate::core::types::{
    Advisory, BoundingBox, CancelFlag, Detection, DetectionSet, PixelBuffer, StageTiming,
};
use crate::services::cache::ResultCache;
use crate::services::components::ConnectedComponentAnalyzer;
use crate::services::layout::PanelLayoutAnalyzer;
use crate::services::ml_detector::MlDetector;
use crate::services::panels::PanelBorderScanner;
use crate::services::postprocess::{drop_panel_interiors, finalize, merge_detections, non_max_suppression};
use crate::services::preprocessing::PreprocessingPipeline;
use crate::services::skew::unrotate_point;
use crate::services::threshold;
use crate::utils::{content_defect, Metrics};

/// Heuristic detections already mapped back to the source frame
struct HeuristicPass {
    detections: Vec<Detection>,
    stages: Vec<StageTiming>,
}

fn record(stages: &mut Vec<StageTiming>, stage: &'static str, start: Instant) {
    stages.push(StageTiming {
        stage,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
    });
}

/// Preprocess, find bubble and panel candidates, and map them from the
/// working frame (resized, deskewed) back onto `buffer`
fn heuristic_pass(
    buffer: &PixelBuffer,
    options: &ProcessingOptions,
    cancel: &CancelFlag,
) -> DetectResult<HeuristicPass> {
    let page = PreprocessingPipeline::run(buffer, options, cancel)?;
    let mut stages = page.stages.clone();

    cancel.check()?;
    let start = Instant::now();
    let mut detections = ConnectedComponentAnalyzer::analyze(&page.gray, options);
    record(&mut stages, "components", start);

    if options.enable_panel_detection {
        cancel.check()?;
        let start = Instant::now();
        let binary = if options.enable_binarization {
            Cow::Borrowed(&page.gray)
        } else {
            Cow::Owned(threshold::binarize(
                &page.gray,
                options.binarization_method,
                options.adaptive_block_size,
                options.adaptive_c,
            ))
        };
        let panels = PanelBorderScanner::scan(&binary);
        detections = drop_panel_interiors(detections, &panels);
        detections.extend(panels);
        record(&mut stages, "panels", start);
    }

    let (frame_w, frame_h) = page.dimensions();
    let detections = detections
        .into_iter()
        .filter_map(|d| {
            let bbox = to_source_frame(
                &d.bbox(),
                (frame_w, frame_h),
                page.skew_angle,
                page.scale,
                (buffer.width(), buffer.height()),
            )?;
            Some(d.with_bbox(bbox))
        })
        .collect();

    Ok(HeuristicPass { detections, stages })
}

/// Axis-aligned box of a working-frame box's corners after undoing the
/// deskew rotation and the resize. `None` if nothing is left after clamping.
fn to_source_frame(
    bbox: &BoundingBox,
    frame: (u32, u32),
    skew_angle: f32,
    scale: f32,
    source: (u32, u32),
) -> Option<BoundingBox> {
    let corners = [
        (bbox.x, bbox.y),
        (bbox.right(), bbox.y),
        (bbox.x, bbox.bottom()),
        (bbox.right(), bbox.bottom()),
    ];

    let (mut min_x, mut min_y) = (f32::MAX, f32::MAX);
    let (mut max_x, mut max_y) = (f32::MIN, f32::MIN);
    for (x, y) in corners {
        let (x, y) = if skew_angle != 0.0 {
            unrotate_point(x, y, frame.0, frame.1, skew_angle)
        } else {
            (x, y)
        };
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }

    let mapped = BoundingBox::from_corners(min_x / scale, min_y / scale, max_x / scale, max_y / scale)
        .clamped(source.0 as f32, source.1 as f32);
    (mapped.area() > 0.0).then_some(mapped)
}

/// Main page analyzer
pub struct PageAnalyzer {
    config: AnalyzerConfig,
    ml_detector: MlDetector,
    cache: Option<ResultCache>,
    metrics: Metrics,
    page_semaphore: Arc<Semaphore>,
    load_advisory: Option<Advisory>,
}

impl PageAnalyzer {
    pub fn new(
        config: AnalyzerConfig,
        ml_detector: MlDetector,
        cache: Option<ResultCache>,
        metrics: Metrics,
    ) -> Self {
        let page_semaphore = Arc::new(Semaphore::new(config.max_concurrent_pages.max(1)));
        Self {
            config,
            ml_detector,
            cache,
            metrics,
            page_semaphore,
            load_advisory: None,
        }
    }

    /// Build the analyzer with its own cache and metrics, loading the
    /// configured model.
    #[instrument(skip(config))]
    pub async fn from_config(config: AnalyzerConfig) -> ConfigResult<Self> {
        config.validate()?;
        let metrics = Metrics::new();
        let cache = ResultCache::new(config.cache_capacity, Some(metrics.clone()))?;
        let (ml_detector, load_advisory) = MlDetector::load(&config).await;

        info!(
            "✓ Ready (pages: {}, cache: {} entries, model: {})",
            config.max_concurrent_pages,
            config.cache_capacity,
            ml_detector.backend_name()
        );

        let mut analyzer = Self::new(config, ml_detector, Some(cache), metrics);
        analyzer.load_advisory = load_advisory;
        Ok(analyzer)
    }

    /// Advisory attached to every result when a configured model could not
    /// be loaded
    pub fn with_load_advisory(mut self, advisory: Option<Advisory>) -> Self {
        self.load_advisory = advisory;
        self
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn ml_backend(&self) -> &str {
        self.ml_detector.backend_name()
    }

    /// Detect bubbles and panels on one page.
    ///
    /// The model and the heuristic path share one deadline. A late model only
    /// costs its detections (with an `MlTimedOut` advisory); a late heuristic
    /// path fails the call with `ProcessingTimeout`.
    #[instrument(skip(self, buffer, options), fields(width = buffer.width(), height = buffer.height()))]
    pub async fn detect(&self, buffer: PixelBuffer, options: &ProcessingOptions) -> DetectResult<DetectionSet> {
        options.validate()?;

        let key = self.cache.as_ref().map(|_| ResultCache::key(&buffer, options));
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }

        let _permit = self
            .page_semaphore
            .acquire()
            .await
            .map_err(|e| DetectError::TaskJoinFailed(format!("page semaphore closed: {}", e)))?;

        let start = Instant::now();
        let result = self.run_page(buffer, options).await;
        self.settle(result, key, start)
    }

    /// Synchronous single-page detection on the calling thread.
    ///
    /// Same result as `detect`, but without the deadline or the page permit.
    pub fn detect_blocking(&self, buffer: &PixelBuffer, options: &ProcessingOptions) -> DetectResult<DetectionSet> {
        options.validate()?;

        let key = self.cache.as_ref().map(|_| ResultCache::key(buffer, options));
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }

        let start = Instant::now();
        let result = self.run_page_blocking(buffer, options);
        self.settle(result, key, start)
    }

    /// Detect on every page concurrently, bounded by `max_concurrent_pages`.
    /// Result `i` belongs to page `i`.
    #[instrument(skip(self, buffers, options), fields(pages = buffers.len()))]
    pub async fn detect_batch(
        &self,
        buffers: Vec<PixelBuffer>,
        options: &ProcessingOptions,
    ) -> Vec<DetectResult<DetectionSet>> {
        let results = join_all(buffers.into_iter().map(|buffer| self.detect(buffer, options))).await;
        self.metrics.record_batch_processed();
        results
    }

    /// Detect on every page with a dedicated worker pool of
    /// `min(max_concurrent_pages, cores)` threads. Result `i` belongs to page `i`.
    pub fn detect_batch_blocking(
        &self,
        buffers: &[PixelBuffer],
        options: &ProcessingOptions,
    ) -> Vec<DetectResult<DetectionSet>> {
        let threads = self.config.max_concurrent_pages.min(num_cpus::get()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("page-worker-{}", i))
            .build();

        let results = match pool {
            Ok(pool) => pool.install(|| {
                buffers
                    .par_iter()
                    .map(|buffer| self.detect_blocking(buffer, options))
                    .collect()
            }),
            Err(e) => {
                warn!("Worker pool unavailable, processing {} pages sequentially: {}", buffers.len(), e);
                buffers
                    .iter()
                    .map(|buffer| self.detect_blocking(buffer, options))
                    .collect()
            }
        };
        self.metrics.record_batch_processed();
        results
    }

    fn cached(&self, key: Option<u64>) -> Option<DetectionSet> {
        let (cache, key) = (self.cache.as_ref()?, key?);
        let hit = cache.get(key)?;
        debug!("Cache hit for page {:016x}", key);
        Some(hit)
    }

    fn base_advisories(&self) -> Vec<Advisory> {
        if self.load_advisory.is_some() {
            self.metrics.record_ml_fallback();
        }
        self.load_advisory.iter().cloned().collect()
    }

    fn empty_frame(&self, reason: String) -> DetectionSet {
        warn!("Degenerate frame, skipping detection: {}", reason);
        self.metrics.record_empty_frame();
        let mut advisories = self.base_advisories();
        advisories.push(Advisory::CorruptedFrame { reason });
        DetectionSet {
            advisories,
            ..DetectionSet::default()
        }
    }

    fn model_failed(&self, advisories: &mut Vec<Advisory>, reason: String) {
        self.metrics.record_ml_fallback();
        advisories.push(Advisory::ModelUnavailable { reason });
    }

    async fn run_page(&self, buffer: PixelBuffer, options: &ProcessingOptions) -> DetectResult<DetectionSet> {
        if let Some(reason) = content_defect(&buffer) {
            return Ok(self.empty_frame(reason));
        }

        let buffer = Arc::new(buffer);
        let cancel = CancelFlag::new();
        let timeout = self.config.detection_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let ml_task = self.ml_detector.is_available().then(|| {
            let detector = self.ml_detector.clone();
            let buffer = Arc::clone(&buffer);
            let threshold = options.ml_confidence_threshold;
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || detector.try_detect_with_cancel(&buffer, threshold, &cancel))
        });

        let heuristic_task = {
            let buffer = Arc::clone(&buffer);
            let options = options.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || heuristic_pass(&buffer, &options, &cancel))
        };

        let ml_outcome = async move {
            match ml_task {
                Some(task) => Some(tokio::time::timeout_at(deadline, task).await),
                None => None,
            }
        };
        let (ml_outcome, heuristic_outcome) =
            tokio::join!(ml_outcome, tokio::time::timeout_at(deadline, heuristic_task));

        let pass = match heuristic_outcome {
            Ok(Ok(pass)) => pass?,
            Ok(Err(e)) => return Err(DetectError::TaskJoinFailed(format!("heuristic path: {}", e))),
            Err(_) => {
                // Blocking tasks stop at their next stage boundary or pool wait
                cancel.cancel();
                self.metrics.record_timeout();
                return Err(DetectError::ProcessingTimeout {
                    elapsed_ms: timeout.as_millis() as u64,
                });
            }
        };

        let mut advisories = self.base_advisories();
        let ml_detections = match ml_outcome {
            None => Vec::new(),
            Some(Ok(Ok(Some(detections)))) => detections,
            Some(Ok(Ok(None))) => {
                let reason = format!("{} inference failed", self.ml_detector.backend_name());
                self.model_failed(&mut advisories, reason);
                Vec::new()
            }
            Some(Ok(Err(e))) => {
                warn!("Model task failed: {}", e);
                self.model_failed(&mut advisories, format!("model task failed: {}", e));
                Vec::new()
            }
            Some(Err(_)) => {
                cancel.cancel();
                warn!("Model missed the {}ms deadline, using heuristic detections only", timeout.as_millis());
                self.metrics.record_ml_timeout();
                advisories.push(Advisory::MlTimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                });
                Vec::new()
            }
        };

        Ok(self.assemble(ml_detections, pass, options, advisories))
    }

    fn run_page_blocking(&self, buffer: &PixelBuffer, options: &ProcessingOptions) -> DetectResult<DetectionSet> {
        if let Some(reason) = content_defect(buffer) {
            return Ok(self.empty_frame(reason));
        }

        let mut advisories = self.base_advisories();
        let ml_detections = if self.ml_detector.is_available() {
            match self.ml_detector.try_detect(buffer, options.ml_confidence_threshold) {
                Some(detections) => detections,
                None => {
                    let reason = format!("{} inference failed", self.ml_detector.backend_name());
                    self.model_failed(&mut advisories, reason);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let pass = heuristic_pass(buffer, options, &CancelFlag::new())?;
        Ok(self.assemble(ml_detections, pass, options, advisories))
    }

    fn assemble(
        &self,
        ml_detections: Vec<Detection>,
        pass: HeuristicPass,
        options: &ProcessingOptions,
        advisories: Vec<Advisory>,
    ) -> DetectionSet {
        for timing in &pass.stages {
            self.metrics.record_stage(timing.stage, timing.elapsed_ms);
        }

        let start = Instant::now();
        let ml_count = ml_detections.len();
        let heuristic_count = pass.detections.len();
        let merged = merge_detections(ml_detections, pass.detections);
        let kept = non_max_suppression(merged, options.nms_threshold);
        let ordered = PanelLayoutAnalyzer::sort_panels(kept, options.reading_direction);
        let mut detections = finalize(ordered, options);

        let layout = options
            .enable_panel_detection
            .then(|| PanelLayoutAnalyzer::analyze(&mut detections, options.reading_direction));
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_stage("postprocess", elapsed_ms);

        debug!(
            "Merged {} model + {} heuristic candidates into {} detections ({:.2}ms)",
            ml_count,
            heuristic_count,
            detections.len(),
            elapsed_ms
        );

        DetectionSet {
            detections,
            layout,
            advisories,
        }
    }

    /// Record metrics for a finished page and cache complete results
    fn settle(
        &self,
        result: DetectResult<DetectionSet>,
        key: Option<u64>,
        start: Instant,
    ) -> DetectResult<DetectionSet> {
        match result {
            Ok(set) => {
                self.metrics.record_page(start.elapsed(), set.len());
                let transient = set
                    .advisories
                    .iter()
                    .any(|a| matches!(a, Advisory::MlTimedOut { .. }));
                if let (Some(cache), Some(key), false) = (&self.cache, key, transient) {
                    cache.put(key, set.clone());
                }
                info!(
                    "Page done in {:.2}ms: {} detections",
                    start.elapsed().as_secs_f64() * 1000.0,
                    set.len()
                );
                Ok(set)
            }
            Err(e) => {
                self.metrics.record_page_failed();
                warn!("Page failed: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ReadingDirection;
    use crate::core::errors::ModelResult;
    use crate::core::types::{DetectionSource, RegionClass};
    use crate::services::ml_detector::RegionModel;
    use image::{Rgba, RgbaImage};
    use imageproc::drawing::{draw_filled_ellipse_mut, draw_filled_rect_mut, draw_hollow_rect_mut};
    use imageproc::rect::Rect;
    use std::time::Duration;

    fn ellipse_page() -> PixelBuffer {
        let mut img = RgbaImage::from_pixel(800, 1200, Rgba([255, 255, 255, 255]));
        draw_filled_ellipse_mut(&mut img, (400, 600), 100, 75, Rgba([0, 0, 0, 255]));
        PixelBuffer::from_rgba_image(img).unwrap()
    }

    fn white_page() -> PixelBuffer {
        PixelBuffer::filled(500, 500, [255, 255, 255, 255]).unwrap()
    }

    fn analyzer(config: AnalyzerConfig, detector: MlDetector) -> PageAnalyzer {
        let metrics = Metrics::new();
        let cache = ResultCache::new(config.cache_capacity, Some(metrics.clone())).unwrap();
        PageAnalyzer::new(config, detector, Some(cache), metrics)
    }

    /// Sleeps far past any test deadline before answering
    struct SlowModel(Duration);

    impl RegionModel for SlowModel {
        fn name(&self) -> &str {
            "slow"
        }

        fn try_detect(&self, _image: &PixelBuffer, _threshold: f32) -> ModelResult<Vec<Detection>> {
            std::thread::sleep(self.0);
            Ok(Vec::new())
        }
    }

    /// Waits for cancellation and reports whether it saw it
    struct StuckModel(Arc<std::sync::atomic::AtomicBool>);

    impl RegionModel for StuckModel {
        fn name(&self) -> &str {
            "stuck"
        }

        fn try_detect(&self, _image: &PixelBuffer, _threshold: f32) -> ModelResult<Vec<Detection>> {
            Ok(Vec::new())
        }

        fn try_detect_with_cancel(
            &self,
            _image: &PixelBuffer,
            _threshold: f32,
            cancel: &CancelFlag,
        ) -> ModelResult<Vec<Detection>> {
            for _ in 0..1000 {
                if cancel.is_cancelled() {
                    self.0.store(true, std::sync::atomic::Ordering::SeqCst);
                    return Err(crate::core::errors::ModelError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(Vec::new())
        }
    }

    struct FixedModel(Vec<Detection>);

    impl RegionModel for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn try_detect(&self, _image: &PixelBuffer, threshold: f32) -> ModelResult<Vec<Detection>> {
            Ok(self.0.iter().filter(|d| d.confidence >= threshold).cloned().collect())
        }
    }

    fn assert_ellipse_result(set: &DetectionSet) {
        assert_eq!(set.len(), 1, "{:?}", set.detections);
        let d = &set.detections[0];
        assert!(matches!(d.class, RegionClass::SpeechBubble | RegionClass::ThoughtBubble));
        assert!(d.confidence > 0.6);
        assert_eq!(d.source, DetectionSource::Heuristic);
        assert!((d.x - 300.0).abs() <= 10.0 && (d.y - 525.0).abs() <= 10.0, "{:?}", d);
        assert!((d.bbox().right() - 500.0).abs() <= 10.0, "{:?}", d);
        assert!((d.bbox().bottom() - 675.0).abs() <= 10.0, "{:?}", d);
        assert_eq!(d.id, 0);
        assert_eq!(d.panel_id, None);
    }

    #[tokio::test]
    async fn test_single_ellipse_page() {
        let analyzer = analyzer(AnalyzerConfig::default(), MlDetector::null());
        let set = analyzer
            .detect(ellipse_page(), &ProcessingOptions::default())
            .await
            .unwrap();
        assert_ellipse_result(&set);
        assert!(set.advisories.is_empty());
        assert_eq!(set.layout, Some(Default::default()));
    }

    #[test]
    fn test_blocking_matches_async_scenario() {
        let analyzer = analyzer(AnalyzerConfig::default(), MlDetector::null());
        let set = analyzer
            .detect_blocking(&ellipse_page(), &ProcessingOptions::default())
            .unwrap();
        assert_ellipse_result(&set);
    }

    #[tokio::test]
    async fn test_uniform_white_page_is_empty() {
        let analyzer = analyzer(AnalyzerConfig::default(), MlDetector::null());
        let set = analyzer
            .detect(white_page(), &ProcessingOptions::default())
            .await
            .unwrap();
        assert!(set.is_empty());
        assert!(matches!(set.advisories[..], [Advisory::CorruptedFrame { .. }]));
        assert_eq!(analyzer.metrics().snapshot().empty_frames, 1);
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_any_work() {
        let analyzer = analyzer(AnalyzerConfig::default(), MlDetector::null());
        let options = ProcessingOptions {
            adaptive_block_size: 14,
            ..ProcessingOptions::default()
        };
        let err = analyzer.detect(ellipse_page(), &options).await.unwrap_err();
        assert!(matches!(err, DetectError::UnsupportedOption { ref option, .. } if option == "adaptive_block_size"));

        let snapshot = analyzer.metrics().snapshot();
        assert_eq!(snapshot.pages_processed, 0);
        assert_eq!(snapshot.cache_misses, 0);
    }

    #[tokio::test]
    async fn test_repeated_page_is_served_from_cache() {
        let analyzer = analyzer(AnalyzerConfig::default(), MlDetector::null());
        let options = ProcessingOptions::default();

        let first = analyzer.detect(ellipse_page(), &options).await.unwrap();
        let second = analyzer.detect(ellipse_page(), &options).await.unwrap();
        assert_eq!(first, second);

        let snapshot = analyzer.metrics().snapshot();
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.pages_processed, 1);
    }

    #[tokio::test]
    async fn test_batch_results_keep_input_order() {
        let analyzer = analyzer(AnalyzerConfig::default(), MlDetector::null());
        let pages = vec![white_page(), ellipse_page(), white_page()];

        let results = analyzer.detect_batch(pages, &ProcessingOptions::default()).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].as_ref().unwrap().is_empty());
        assert_ellipse_result(results[1].as_ref().unwrap());
        assert!(results[2].as_ref().unwrap().is_empty());
    }

    /// Three 3 px framed panels, with a bubble in the top-left one
    fn panel_page() -> PixelBuffer {
        let mut img = RgbaImage::from_pixel(600, 800, Rgba([255, 255, 255, 255]));
        for (x, y, w, h) in [(20, 20, 260, 360), (320, 20, 260, 360), (20, 420, 560, 360)] {
            for inset in 0..3 {
                draw_hollow_rect_mut(
                    &mut img,
                    Rect::at(x + inset, y + inset).of_size(w - 2 * inset as u32, h - 2 * inset as u32),
                    Rgba([0, 0, 0, 255]),
                );
            }
        }
        draw_filled_ellipse_mut(&mut img, (150, 200), 75, 45, Rgba([0, 0, 0, 255]));
        PixelBuffer::from_rgba_image(img).unwrap()
    }

    #[test]
    fn test_framed_panels_survive_their_interiors() {
        let analyzer = analyzer(AnalyzerConfig::default(), MlDetector::null());
        let set = analyzer
            .detect_blocking(&panel_page(), &ProcessingOptions::default())
            .unwrap();

        let panels: Vec<&Detection> = set
            .detections
            .iter()
            .filter(|d| d.class == RegionClass::Panel)
            .collect();
        assert_eq!(panels.len(), 3, "{:?}", set.detections);

        let others: Vec<&Detection> = set
            .detections
            .iter()
            .filter(|d| d.class != RegionClass::Panel)
            .collect();
        for other in &others {
            assert!(
                panels.iter().all(|p| p.iou(other) <= 0.9),
                "panel interior reported as {:?}",
                other
            );
        }
        assert_eq!(others.len(), 1, "{:?}", set.detections);

        let bubble = others[0];
        assert!((bubble.center_x - 150.0).abs() <= 10.0 && (bubble.center_y - 200.0).abs() <= 10.0);
        let home = panels
            .iter()
            .find(|p| {
                (p.x..p.bbox().right()).contains(&bubble.center_x)
                    && (p.y..p.bbox().bottom()).contains(&bubble.center_y)
            })
            .unwrap();
        assert_eq!(bubble.panel_id, Some(home.id));

        let layout = set.layout.unwrap();
        assert_eq!(layout.reading_order.len(), 3);
    }

    #[test]
    fn test_blocking_batch_keeps_input_order() {
        let analyzer = analyzer(AnalyzerConfig::default(), MlDetector::null());
        let pages = vec![ellipse_page(), white_page()];

        let results = analyzer.detect_batch_blocking(&pages, &ProcessingOptions::default());
        assert_ellipse_result(results[0].as_ref().unwrap());
        assert!(results[1].as_ref().unwrap().is_empty());
        assert_eq!(analyzer.metrics().snapshot().batches_processed, 1);
    }

    #[tokio::test]
    async fn test_slow_model_falls_back_to_heuristics() {
        let config = AnalyzerConfig {
            detection_timeout: Duration::from_millis(1500),
            ..AnalyzerConfig::default()
        };
        let detector = MlDetector::with_model(Arc::new(SlowModel(Duration::from_secs(4))));
        let analyzer = analyzer(config, detector);
        let options = ProcessingOptions {
            enable_denoising: false,
            enable_contrast_enhancement: false,
            enable_deskewing: false,
            ..ProcessingOptions::default()
        };

        let set = analyzer.detect(ellipse_page(), &options).await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.advisories, vec![Advisory::MlTimedOut { timeout_ms: 1500 }]);
        assert_eq!(analyzer.metrics().snapshot().ml_timeouts, 1);
        // Timed-out results are not cached
        assert!(analyzer.cache.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_model_is_told_to_stop() {
        let config = AnalyzerConfig {
            detection_timeout: Duration::from_millis(1500),
            ..AnalyzerConfig::default()
        };
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let detector = MlDetector::with_model(Arc::new(StuckModel(Arc::clone(&released))));
        let analyzer = analyzer(config, detector);
        let options = ProcessingOptions {
            enable_denoising: false,
            enable_contrast_enhancement: false,
            enable_deskewing: false,
            ..ProcessingOptions::default()
        };

        let set = analyzer.detect(ellipse_page(), &options).await.unwrap();
        assert_eq!(set.advisories, vec![Advisory::MlTimedOut { timeout_ms: 1500 }]);

        let mut stopped = false;
        for _ in 0..100 {
            if released.load(std::sync::atomic::Ordering::SeqCst) {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stopped, "model task kept running after the deadline");
    }

    #[tokio::test]
    async fn test_slow_heuristic_path_times_out() {
        let config = AnalyzerConfig {
            detection_timeout: Duration::from_millis(1),
            ..AnalyzerConfig::default()
        };
        let analyzer = analyzer(config, MlDetector::null());

        let mut img = RgbaImage::from_pixel(2048, 2048, Rgba([255, 255, 255, 255]));
        draw_filled_rect_mut(&mut img, Rect::at(100, 100).of_size(400, 300), Rgba([0, 0, 0, 255]));
        let page = PixelBuffer::from_rgba_image(img).unwrap();

        let err = analyzer.detect(page, &ProcessingOptions::default()).await.unwrap_err();
        assert_eq!(err, DetectError::ProcessingTimeout { elapsed_ms: 1 });

        let snapshot = analyzer.metrics().snapshot();
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.pages_failed, 1);
    }

    #[tokio::test]
    async fn test_model_detections_win_over_overlapping_heuristics() {
        let model_bubble = Detection::new(
            BoundingBox::new(298.0, 523.0, 204.0, 154.0),
            0.9,
            RegionClass::ThoughtBubble,
            DetectionSource::Ml,
        );
        let detector = MlDetector::with_model(Arc::new(FixedModel(vec![model_bubble])));
        let analyzer = analyzer(AnalyzerConfig::default(), detector);

        let set = analyzer
            .detect(ellipse_page(), &ProcessingOptions::default())
            .await
            .unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.detections[0].source, DetectionSource::Ml);
        assert_eq!(set.detections[0].class, RegionClass::ThoughtBubble);
    }

    #[tokio::test]
    async fn test_load_advisory_is_attached() {
        let analyzer = analyzer(AnalyzerConfig::default(), MlDetector::null()).with_load_advisory(Some(
            Advisory::ModelUnavailable {
                reason: "missing file".to_string(),
            },
        ));
        let options = ProcessingOptions {
            reading_direction: ReadingDirection::Rtl,
            ..ProcessingOptions::default()
        };

        let set = analyzer.detect(ellipse_page(), &options).await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(matches!(set.advisories[..], [Advisory::ModelUnavailable { .. }]));
        assert_eq!(analyzer.metrics().snapshot().ml_fallbacks, 1);
    }

    #[test]
    fn test_source_frame_mapping() {
        let bbox = BoundingBox::new(100.0, 100.0, 50.0, 20.0);

        let mapped = to_source_frame(&bbox, (400, 400), 0.0, 0.5, (800, 800)).unwrap();
        assert_eq!(mapped, BoundingBox::new(200.0, 200.0, 100.0, 40.0));

        // Rotation grows the axis-aligned box around the same center
        let mapped = to_source_frame(&bbox, (400, 400), 10.0, 1.0, (400, 400)).unwrap();
        let (cx, cy) = mapped.center();
        let (ex, ey) = unrotate_point(125.0, 110.0, 400, 400, 10.0);
        assert!((cx - ex).abs() < 1e-3 && (cy - ey).abs() < 1e-3);
        assert!(mapped.width > 50.0 && mapped.height > 20.0);

        let outside = BoundingBox::new(500.0, 500.0, 10.0, 10.0);
        assert!(to_source_frame(&outside, (400, 400), 0.0, 1.0, (400, 400)).is_none());
    }
}
