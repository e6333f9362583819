//! Scan pipeline
//!
//! One pass over a frame: localize, rectify, recognize with every requested
//! engine over the full frame and the rectified card, analyze the card
//! visually, then match against the catalog. Engine invocations run on a
//! bounded thread pool; everything else is sequential.

use image::RgbImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::analysis::{MatchCandidate, MatchOutcome, Matcher};
use crate::capture::Frame;
use crate::config::ScannerConfig;
use crate::error::{EngineError, ScanError};
use crate::storage::{self, CatalogIndex, CatalogLookup, HttpImageCache, ImageCache};
use crate::vision::artwork::match_artwork;
use crate::vision::detection::CardDetector;
use crate::vision::ocr::{EngineKind, EngineRegistry};
use crate::vision::visual::{detect_first_edition, detect_rarity, RarityEstimate};
use crate::vision::{
    blur_score, LocalizationMethod, Localizer, ModelManager, PreprocessingStrategy, RecognitionResult, Recognizer,
    Scope, BLUR_THRESHOLD, ROI_FIRST_EDITION,
};

/// Per-task scan request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Engines to run; empty means every loaded engine
    pub engines: Vec<EngineKind>,
    pub preprocessing: PreprocessingStrategy,
    /// Scan language; the configured default when unset
    pub language: Option<String>,
    /// Free-form caller data, echoed in the report
    pub metadata: HashMap<String, serde_json::Value>,
}

/// An engine invocation that failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineFailure {
    pub engine: EngineKind,
    pub scope: Scope,
    pub error: EngineError,
}

/// Everything one scan produced
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub task_id: String,
    pub metadata: HashMap<String, serde_json::Value>,

    pub name: Option<String>,
    pub card_id: Option<u64>,
    pub set_code: Option<String>,
    pub rarity: Option<String>,
    pub visual_rarity: Option<RarityEstimate>,
    pub language: String,
    pub first_edition: bool,
    /// Highest identifier confidence across all results (0-100)
    pub ocr_confidence: f32,
    pub match_score: f32,
    pub image_path: Option<PathBuf>,
    pub ambiguous: bool,

    /// Artwork id of the reference image the art matched
    pub artwork_match: Option<u64>,
    pub artwork_matches: usize,

    pub candidates: Vec<MatchCandidate>,
    pub results: Vec<RecognitionResult>,
    pub engine_errors: Vec<EngineFailure>,

    pub localization: Option<LocalizationMethod>,
    pub blur_score: f64,
    pub is_blurry: bool,
    pub elapsed_ms: u64,
    /// Set when the task aborted (undecodable frame)
    pub error: Option<String>,
}

impl ScanReport {
    fn new(options: &ScanOptions, language: &str) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            metadata: options.metadata.clone(),
            language: language.to_string(),
            ..Default::default()
        }
    }

    fn apply_match(&mut self, outcome: MatchOutcome) {
        if let Some(best) = &outcome.best {
            self.name = Some(best.name.clone());
            self.card_id = Some(best.card_id);
            self.set_code = Some(best.set_code.clone());
            self.rarity = Some(best.rarity.clone());
            self.match_score = best.confidence;
            self.image_path = best.image_path.clone();
        }
        self.language = outcome.language;
        self.ambiguous = outcome.ambiguous;
        self.candidates = outcome.candidates;
    }
}

/// Localizes, recognizes and matches cards
pub struct ScanPipeline {
    localizer: Localizer,
    recognizer: Recognizer,
    engines: EngineRegistry,
    matcher: Option<Matcher>,
    images: Option<Arc<dyn ImageCache>>,
    pool: rayon::ThreadPool,
    config: ScannerConfig,
}

impl ScanPipeline {
    /// Assemble a pipeline from already loaded parts
    pub fn new(
        config: ScannerConfig,
        engines: EngineRegistry,
        localizer: Localizer,
        catalog: Option<Arc<dyn CatalogLookup>>,
        images: Option<Arc<dyn ImageCache>>,
    ) -> Result<Self, ScanError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.engines.max_threads.max(1))
            .thread_name(|i| format!("ocr-{}", i))
            .build()
            .map_err(|e| ScanError::Config(format!("could not build OCR thread pool: {}", e)))?;

        let recognizer = Recognizer::new(
            catalog.clone(),
            &config.engines,
            config.preprocessing.clone(),
            &config.general.language,
        );
        let matcher = catalog.map(|c| Matcher::new(c, images.clone()));

        Ok(Self {
            localizer,
            recognizer,
            engines,
            matcher,
            images,
            pool,
            config,
        })
    }

    /// Load models, catalog and image cache as configured
    ///
    /// Enabled OCR engines must load. The card detector is optional unless a
    /// model path is configured.
    pub fn from_config(config: ScannerConfig) -> Result<Self, ScanError> {
        let models = match &config.general.models_dir {
            Some(dir) => ModelManager::with_dir(dir.clone()),
            None => ModelManager::new(),
        }
        .map_err(|e| ScanError::Config(format!("{:#}", e)))?;

        let engines = EngineRegistry::from_config(&config.engines, &models)?;
        if engines.is_empty() {
            warn!("No OCR engines enabled");
        }

        let detector_model = config.localization.detector_model.as_deref();
        let detector = match models.resolve_card_detector(detector_model) {
            Ok(path) => Some(CardDetector::load(
                &path,
                config.localization.detector_oriented,
                config.localization.detector_confidence,
            )?),
            Err(e) if detector_model.is_some() => return Err(e.into()),
            Err(_) => {
                info!("No card detector model; the detector strategy will use contours");
                None
            }
        };
        let localizer = Localizer::new(config.localization.clone(), detector);

        let catalog_dir = match &config.general.catalog_dir {
            Some(dir) => dir.clone(),
            None => storage::get_catalog_dir().map_err(|e| ScanError::Catalog(format!("{:#}", e)))?,
        };
        let catalog = CatalogIndex::load_dir(&catalog_dir, &config.general.language)
            .map_err(|e| ScanError::Catalog(format!("{:#}", e)))?;
        info!("Catalog languages: {:?}", catalog.languages());

        let images_dir = match &config.general.images_dir {
            Some(dir) => dir.clone(),
            None => storage::get_images_dir().map_err(|e| ScanError::Config(format!("{:#}", e)))?,
        };
        let images: Arc<dyn ImageCache> =
            Arc::new(HttpImageCache::new(images_dir).map_err(|e| ScanError::Config(format!("{:#}", e)))?);
        let catalog: Arc<dyn CatalogLookup> = Arc::new(catalog);

        Self::new(config, engines, localizer, Some(catalog), Some(images))
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    /// Decode and scan; failures end up in the report's `error`
    pub fn process_scan(&self, bytes: &[u8], options: &ScanOptions) -> ScanReport {
        let started = Instant::now();
        match Frame::decode(bytes) {
            Ok(frame) => self.process_frame(&frame, options),
            Err(e) => {
                warn!("Scan aborted: {}", e);
                let mut report = ScanReport::new(options, &self.language_for(options));
                report.error = Some(e.to_string());
                report.elapsed_ms = started.elapsed().as_millis() as u64;
                report
            }
        }
    }

    /// Scan a decoded frame
    pub fn process_frame(&self, frame: &Frame, options: &ScanOptions) -> ScanReport {
        // Without a stop signal a pass always completes
        let mut report = None;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_pass(frame, options, &|| false, &mut |r: ScanReport| report = Some(r))
        }));
        match outcome {
            Ok(()) => report.unwrap_or_else(|| ScanReport::new(options, &self.language_for(options))),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Scan pass panicked: {}", message);
                let mut report = ScanReport::new(options, &self.language_for(options));
                report.error = Some(format!("scan pass panicked: {}", message));
                report
            }
        }
    }

    /// Run one pass, checking `should_stop` between stages
    ///
    /// `publish` receives the finished report; a pass that observes the stop
    /// signal publishes nothing.
    pub fn run_pass(
        &self,
        frame: &Frame,
        options: &ScanOptions,
        should_stop: &dyn Fn() -> bool,
        publish: &mut dyn FnMut(ScanReport),
    ) {
        let started = Instant::now();
        let language = self.language_for(options);
        let mut report = ScanReport::new(options, &language);

        let gray = image::imageops::grayscale(&frame.image);
        report.blur_score = blur_score(&gray);
        report.is_blurry = report.blur_score < BLUR_THRESHOLD;

        let (card, method, _quad) = self.localizer.extract_card(&frame.image, options.preprocessing);
        report.localization = Some(method);
        debug!("Localized card via {:?}", method);
        if should_stop() {
            return;
        }

        let kinds = if options.engines.is_empty() {
            self.engines.kinds()
        } else {
            options.engines.clone()
        };
        let (results, failures) = self.recognize_all(&frame.image, &card, &kinds, &language);
        report.ocr_confidence = results.iter().map(|r| r.set_id_conf).fold(0.0, f32::max);
        report.results = results;
        report.engine_errors = failures;
        if should_stop() {
            return;
        }

        report.visual_rarity = Some(detect_rarity(&card, &self.config.visual));
        report.first_edition = self.first_edition(&card, &kinds);
        if should_stop() {
            return;
        }

        if let Some(matcher) = &self.matcher {
            let outcome = matcher.match_results(&report.results, &language);
            let best = outcome.best.clone();
            report.apply_match(outcome);

            if let Some(best) = best {
                self.match_art(&card, &best, matcher.catalog().as_ref(), &mut report);
            }
        }
        if should_stop() {
            return;
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            task = %report.task_id,
            elapsed_ms = report.elapsed_ms,
            "Scan finished: {:?} {:?} (score {:.0}, ambiguous: {})",
            report.name,
            report.set_code,
            report.match_score,
            report.ambiguous
        );
        publish(report);
    }

    fn language_for(&self, options: &ScanOptions) -> String {
        options
            .language
            .as_deref()
            .unwrap_or(&self.config.general.language)
            .to_uppercase()
    }

    /// Every requested engine over both scopes, in request order
    fn recognize_all(
        &self,
        full: &RgbImage,
        card: &RgbImage,
        kinds: &[EngineKind],
        language: &str,
    ) -> (Vec<RecognitionResult>, Vec<EngineFailure>) {
        let jobs: Vec<(EngineKind, Scope)> = kinds
            .iter()
            .flat_map(|&kind| [(kind, Scope::Full), (kind, Scope::Crop)])
            .collect();

        let outcomes: Vec<(EngineKind, Scope, Result<RecognitionResult, EngineError>)> = self.pool.install(|| {
            jobs.par_iter()
                .map(|&(kind, scope)| {
                    let image = match scope {
                        Scope::Full => full,
                        Scope::Crop => card,
                    };
                    let outcome = self.engines.get(kind).and_then(|engine| {
                        contain_panic(|| self.recognizer.recognize(image, engine.as_ref(), scope))
                    });
                    (kind, scope, outcome)
                })
                .collect()
        });

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (engine, scope, outcome) in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(error) => {
                    warn!(engine = %engine, scope = %scope, "OCR failed: {}", error);
                    results.push(RecognitionResult::empty(engine, scope, language));
                    failures.push(EngineFailure { engine, scope, error });
                }
            }
        }
        (results, failures)
    }

    /// OCR the first-edition region with the first engine that answers
    fn first_edition(&self, card: &RgbImage, kinds: &[EngineKind]) -> bool {
        let Some(region) = ROI_FIRST_EDITION.crop(card) else {
            return false;
        };
        for &kind in kinds {
            let Ok(engine) = self.engines.get(kind) else {
                continue;
            };
            match contain_panic(|| self.recognizer.read_text(&region, engine.as_ref())) {
                Ok(output) => return detect_first_edition(&output.texts()),
                Err(e) => debug!("First-edition OCR with {} failed: {}", kind, e),
            }
        }
        false
    }

    /// Compare the card art against the best card's catalog images
    fn match_art(
        &self,
        card: &RgbImage,
        best: &MatchCandidate,
        catalog: &dyn CatalogLookup,
        report: &mut ScanReport,
    ) {
        let Some(images) = &self.images else {
            return;
        };
        let Some(entry) = catalog
            .get_card(&report.language, best.card_id)
            .or_else(|| catalog.get_card(catalog.default_language(), best.card_id))
        else {
            return;
        };

        let mut paths = HashMap::new();
        let mut references = Vec::new();
        for art in &entry.card_images {
            let Some(path) = images.ensure_image(art.id, &art.image_url, true) else {
                continue;
            };
            match image::open(&path) {
                Ok(img) => {
                    references.push((art.id, img.to_rgb8()));
                    paths.insert(art.id, path);
                }
                Err(e) => warn!("Unreadable reference image {:?}: {}", path, e),
            }
        }
        if references.is_empty() {
            return;
        }

        let (art_id, matches) = match_artwork(card, &references, &self.config.visual);
        report.artwork_match = art_id;
        report.artwork_matches = matches;
        if let Some(path) = art_id.and_then(|id| paths.remove(&id)) {
            report.image_path = Some(path);
        }
    }
}

/// Run one engine call; a panic becomes `EngineError::Crashed`
fn contain_panic<T>(call: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
    std::panic::catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|payload| Err(EngineError::Crashed(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
