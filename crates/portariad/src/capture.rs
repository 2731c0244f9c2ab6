//! Camera polling loops.
//!
//! Each active camera runs a tokio task that ticks at a fixed period. A tick
//! captures a frame and runs inference on the blocking pool, then hands the
//! result to the engine. A tick that is still running makes the next tick
//! of the same camera a no-op.

use crate::engine::{
    EngineError, EngineHandle, ExtractError, FeatureExtractor, ModelProvider, TextExtractor,
};
use portaria_core::cooldown::wait_seconds;
use portaria_core::orchestrator::{FaceObservation, PlateObservation};
use portaria_core::{AccessOutcome, DetectionSample, OcrResult};
use portaria_hw::{Camera, FrameSource, Resolution, StreamError, StreamHandle};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shortest period a capture loop will tick at.
const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Face,
    Plate,
}

impl StreamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamRole::Face => "face",
            StreamRole::Plate => "plate",
        }
    }

    pub fn parse(s: &str) -> Option<StreamRole> {
        match s.trim().to_ascii_lowercase().as_str() {
            "face" | "facial" => Some(StreamRole::Face),
            "plate" | "vehicle" => Some(StreamRole::Plate),
            _ => None,
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub enum Extractor {
    Face(Box<dyn FeatureExtractor>),
    Plate(Box<dyn TextExtractor>),
}

impl Extractor {
    pub fn role(&self) -> StreamRole {
        match self {
            Extractor::Face(_) => StreamRole::Face,
            Extractor::Plate(_) => StreamRole::Plate,
        }
    }
}

#[derive(Error, Debug)]
enum TickError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

enum Reading {
    Faces(Vec<DetectionSample>),
    Text(OcrResult),
}

/// A camera, its open stream and the model that reads its frames.
struct Station {
    source: Box<dyn FrameSource>,
    stream: Option<StreamHandle>,
    extractor: Extractor,
}

impl Station {
    /// Capture and extract one frame. Dark frames yield nothing.
    fn sample(&mut self) -> Result<Option<Reading>, TickError> {
        let handle = self.stream.as_ref().ok_or(StreamError::NotStreaming)?;
        let frame = self.source.capture_frame(handle)?;
        if frame.is_dark {
            return Ok(None);
        }
        let reading = match &mut self.extractor {
            Extractor::Face(e) => Reading::Faces(e.detect_faces(&frame)?),
            Extractor::Plate(e) => Reading::Text(e.recognize(&frame)?),
        };
        Ok(Some(reading))
    }

    fn release(&mut self) {
        if let Some(handle) = self.stream.take() {
            self.source.stop_stream(handle);
        }
    }
}

/// Clears the in-flight flag when a tick finishes, however it finishes.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One running camera loop.
pub struct CaptureLoop {
    role: StreamRole,
    station: Arc<Mutex<Station>>,
    task: JoinHandle<()>,
}

impl CaptureLoop {
    /// Open the stream and start polling every `period`.
    pub async fn start(
        mut source: Box<dyn FrameSource>,
        extractor: Extractor,
        engine: EngineHandle,
        period: Duration,
    ) -> Result<Self, EngineError> {
        let role = extractor.role();
        let (source, opened) = tokio::task::spawn_blocking(move || {
            let opened = source.start_stream();
            (source, opened)
        })
        .await
        .map_err(|e| StreamError::CaptureFailed(format!("stream start aborted: {e}")))?;
        let handle = opened?;
        tracing::info!(camera = %role, source = source.label(), period_ms = period.as_millis() as u64, "stream started");

        let station = Arc::new(Mutex::new(Station {
            source,
            stream: Some(handle),
            extractor,
        }));
        let task = tokio::spawn(poll(role, station.clone(), engine, period));
        Ok(Self { role, station, task })
    }

    /// Stop polling and release the camera.
    pub async fn stop(self) {
        self.task.abort();
        let station = self.station;
        let released = tokio::task::spawn_blocking(move || {
            station.lock().unwrap_or_else(PoisonError::into_inner).release();
        })
        .await;
        if let Err(e) = released {
            tracing::warn!(camera = %self.role, error = %e, "camera release failed");
        }
    }
}

async fn poll(role: StreamRole, station: Arc<Mutex<Station>>, engine: EngineHandle, period: Duration) {
    let in_flight = Arc::new(AtomicBool::new(false));
    // `interval` panics on a zero period.
    let mut ticker = tokio::time::interval(period.max(MIN_POLL_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if in_flight.swap(true, Ordering::AcqRel) {
            tracing::trace!(camera = %role, "previous tick still running; skipped");
            continue;
        }
        let guard = InFlight(in_flight.clone());
        let station = station.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tick(role, station, &engine).await;
        });
    }
}

async fn tick(role: StreamRole, station: Arc<Mutex<Station>>, engine: &EngineHandle) {
    let sampled = tokio::task::spawn_blocking(move || {
        station.lock().unwrap_or_else(PoisonError::into_inner).sample()
    })
    .await;

    let reading = match sampled {
        Ok(Ok(Some(reading))) => reading,
        Ok(Ok(None)) => {
            tracing::debug!(camera = %role, "dark frame skipped");
            return;
        }
        Ok(Err(e)) => {
            tracing::warn!(camera = %role, error = %e, "capture tick failed");
            return;
        }
        Err(e) => {
            tracing::warn!(camera = %role, error = %e, "capture tick aborted");
            return;
        }
    };

    match reading {
        Reading::Faces(samples) => match engine.face_samples(samples).await {
            Ok(observations) => observations.iter().for_each(log_face),
            Err(e) => tracing::warn!(camera = %role, error = %e, "face tick dropped"),
        },
        Reading::Text(ocr) => match engine.plate_text(ocr).await {
            Ok(observation) => log_plate(&observation),
            Err(e) => tracing::warn!(camera = %role, error = %e, "plate tick dropped"),
        },
    }
}

fn log_face(observation: &FaceObservation) {
    match observation {
        FaceObservation::Recognized { name, access, .. } => log_access(name, access),
        FaceObservation::Unrecognized { spoofing_suspected } => {
            tracing::debug!(spoofing_suspected, "unrecognized face");
        }
    }
}

fn log_plate(observation: &PlateObservation) {
    match observation {
        PlateObservation::NoPlate => tracing::trace!("no plate in frame"),
        PlateObservation::Unauthorized(plate) => tracing::debug!(plate = %plate, "unauthorized plate"),
        PlateObservation::Recognized { name, access, .. } => log_access(name, access),
    }
}

fn log_access(name: &str, access: &Result<AccessOutcome, portaria_core::OrchestratorError>) {
    match access {
        Ok(AccessOutcome::CoolingDown { remaining }) => {
            tracing::debug!(resident = name, wait_secs = wait_seconds(*remaining), "registration cooling down");
        }
        Ok(AccessOutcome::AwaitingLiveness) => tracing::debug!(resident = name, "awaiting liveness"),
        Ok(AccessOutcome::Registered { .. }) => {}
        Err(e) => tracing::warn!(resident = name, error = %e, "registration failed; will retry"),
    }
}

/// Devices and periods for the two cameras.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub face_device: String,
    pub plate_device: String,
    pub face_period: Duration,
    pub plate_period: Duration,
}

impl CaptureSettings {
    fn period(&self, role: StreamRole) -> Duration {
        match role {
            StreamRole::Face => self.face_period,
            StreamRole::Plate => self.plate_period,
        }
    }

    fn device(&self, role: StreamRole) -> &str {
        match role {
            StreamRole::Face => &self.face_device,
            StreamRole::Plate => &self.plate_device,
        }
    }
}

/// Owner of the camera loops.
pub struct Cameras {
    engine: EngineHandle,
    settings: CaptureSettings,
    models: Option<Arc<dyn ModelProvider>>,
    active: tokio::sync::Mutex<HashMap<StreamRole, CaptureLoop>>,
}

impl Cameras {
    pub fn new(engine: EngineHandle, settings: CaptureSettings, models: Option<Arc<dyn ModelProvider>>) -> Self {
        Self {
            engine,
            settings,
            models,
            active: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn models_available(&self) -> bool {
        self.models.is_some()
    }

    /// Start the configured V4L2 camera for `role`.
    pub async fn activate(&self, role: StreamRole) -> Result<(), EngineError> {
        let models = self.models.as_ref().ok_or_else(|| {
            EngineError::ModelUnavailable(format!("no inference backend for the {role} camera"))
        })?;
        let unavailable = |e: ExtractError| EngineError::ModelUnavailable(e.to_string());
        let extractor = match role {
            StreamRole::Face => Extractor::Face(models.feature_extractor().map_err(unavailable)?),
            StreamRole::Plate => Extractor::Plate(models.text_extractor().map_err(unavailable)?),
        };
        let source = Box::new(Camera::new(self.settings.device(role), Resolution::default()));
        self.activate_with(source, extractor).await
    }

    /// Start a loop over an arbitrary source. The role follows the extractor.
    pub async fn activate_with(&self, source: Box<dyn FrameSource>, extractor: Extractor) -> Result<(), EngineError> {
        let role = extractor.role();
        let mut active = self.active.lock().await;
        if active.contains_key(&role) {
            return Err(EngineError::AlreadyActive(role.as_str()));
        }
        let capture = CaptureLoop::start(source, extractor, self.engine.clone(), self.settings.period(role)).await?;
        active.insert(role, capture);
        Ok(())
    }

    /// Stop the loop for `role`. Returns false if it was not running.
    pub async fn deactivate(&self, role: StreamRole) -> bool {
        let capture = self.active.lock().await.remove(&role);
        match capture {
            Some(capture) => {
                capture.stop().await;
                tracing::info!(camera = %role, "camera deactivated");
                true
            }
            None => false,
        }
    }

    pub async fn active_roles(&self) -> Vec<StreamRole> {
        let mut roles: Vec<_> = self.active.lock().await.keys().copied().collect();
        roles.sort_by_key(|r| r.as_str());
        roles
    }

    pub async fn shutdown(&self) {
        for role in [StreamRole::Face, StreamRole::Plate] {
            self.deactivate(role).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use portaria_core::orchestrator::{Enrollment, NewVehicle};
    use portaria_core::{
        AccessOrchestrator, ManualClock, MemoryStore, OcrLine, OrchestratorConfig, RecordFilter,
    };
    use portaria_hw::Frame;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        started: AtomicBool,
        stopped: AtomicBool,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    struct FakeSource {
        counters: Arc<Counters>,
        fail_start: Option<StreamError>,
        dark: bool,
    }

    impl FrameSource for FakeSource {
        fn label(&self) -> &str {
            "fake"
        }

        fn start_stream(&mut self) -> Result<StreamHandle, StreamError> {
            if let Some(e) = self.fail_start.clone() {
                return Err(e);
            }
            self.counters.started.store(true, Ordering::SeqCst);
            Ok(StreamHandle::new(7))
        }

        fn capture_frame(&mut self, _handle: &StreamHandle) -> Result<Frame, StreamError> {
            let level = if self.dark { 0 } else { 128 };
            Frame::from_rgb(vec![level; 12], 2, 2, 0).map_err(|e| StreamError::CaptureFailed(e.to_string()))
        }

        fn stop_stream(&mut self, handle: StreamHandle) {
            assert_eq!(handle.id(), 7);
            self.counters.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct FakeOcr {
        counters: Arc<Counters>,
        text: &'static str,
        delay: Duration,
    }

    impl TextExtractor for FakeOcr {
        fn recognize(&mut self, _frame: &Frame) -> Result<OcrResult, ExtractError> {
            let now = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_running.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.counters.running.fetch_sub(1, Ordering::SeqCst);
            Ok(OcrResult {
                text: self.text.into(),
                lines: vec![OcrLine { text: self.text.into(), bbox: None }],
                confidence: Some(0.9),
            })
        }
    }

    async fn cameras() -> (Cameras, EngineHandle) {
        cameras_polling_every(Duration::from_millis(10)).await
    }

    async fn cameras_polling_every(period: Duration) -> (Cameras, EngineHandle) {
        let orch = AccessOrchestrator::new(
            MemoryStore::new(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            OrchestratorConfig::default(),
        );
        let engine = spawn_engine(orch).unwrap();
        engine
            .enroll(Enrollment {
                name: "Lia".into(),
                vehicles: vec![NewVehicle {
                    plate: "QWE4R56".into(),
                    model: "HB20".into(),
                    color: None,
                    parking_spot: None,
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        let settings = CaptureSettings {
            face_device: "/dev/null-face".into(),
            plate_device: "/dev/null-plate".into(),
            face_period: period,
            plate_period: period,
        };
        (Cameras::new(engine.clone(), settings, None), engine)
    }

    fn plate_station(counters: &Arc<Counters>, delay: Duration, dark: bool) -> (Box<dyn FrameSource>, Extractor) {
        (
            Box::new(FakeSource {
                counters: counters.clone(),
                fail_start: None,
                dark,
            }),
            Extractor::Plate(Box::new(FakeOcr {
                counters: counters.clone(),
                text: "QWE-4R56",
                delay,
            })),
        )
    }

    #[tokio::test]
    async fn test_plate_loop_registers_and_releases_camera() {
        let (cameras, engine) = cameras().await;
        let counters = Arc::new(Counters::default());
        let (source, extractor) = plate_station(&counters, Duration::ZERO, false);
        cameras.activate_with(source, extractor).await.unwrap();
        assert!(counters.started.load(Ordering::SeqCst));
        assert_eq!(cameras.active_roles().await, vec![StreamRole::Plate]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Many ticks, one registration: the rest fall inside the cooldown.
        assert_eq!(engine.records(RecordFilter::default(), 1, 10).await.unwrap().total, 1);

        assert!(cameras.deactivate(StreamRole::Plate).await);
        assert!(counters.stopped.load(Ordering::SeqCst));
        assert!(cameras.active_roles().await.is_empty());
        assert!(!cameras.deactivate(StreamRole::Plate).await);
    }

    #[tokio::test]
    async fn test_zero_period_loop_still_polls() {
        let (cameras, engine) = cameras_polling_every(Duration::ZERO).await;
        let counters = Arc::new(Counters::default());
        let (source, extractor) = plate_station(&counters, Duration::ZERO, false);
        cameras.activate_with(source, extractor).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cameras.shutdown().await;
        assert!(counters.stopped.load(Ordering::SeqCst));
        assert_eq!(engine.records(RecordFilter::default(), 1, 10).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_slow_tick_blocks_next_tick() {
        let (cameras, _engine) = cameras().await;
        let counters = Arc::new(Counters::default());
        let (source, extractor) = plate_station(&counters, Duration::from_millis(40), false);
        cameras.activate_with(source, extractor).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        cameras.shutdown().await;
        assert_eq!(counters.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dark_frames_are_not_processed() {
        let (cameras, engine) = cameras().await;
        let counters = Arc::new(Counters::default());
        let (source, extractor) = plate_station(&counters, Duration::ZERO, true);
        cameras.activate_with(source, extractor).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        cameras.shutdown().await;
        assert_eq!(counters.max_running.load(Ordering::SeqCst), 0);
        assert_eq!(engine.records(RecordFilter::default(), 1, 10).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_second_activation_rejected() {
        let (cameras, _engine) = cameras().await;
        let counters = Arc::new(Counters::default());
        let (source, extractor) = plate_station(&counters, Duration::ZERO, false);
        cameras.activate_with(source, extractor).await.unwrap();
        let (source, extractor) = plate_station(&counters, Duration::ZERO, false);
        let err = cameras.activate_with(source, extractor).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyActive("plate")));
        cameras.shutdown().await;
    }

    #[tokio::test]
    async fn test_permission_denied_is_surfaced() {
        let (cameras, _engine) = cameras().await;
        let counters = Arc::new(Counters::default());
        let source = Box::new(FakeSource {
            counters: counters.clone(),
            fail_start: Some(StreamError::PermissionDenied("/dev/video1".into())),
            dark: false,
        });
        let extractor = Extractor::Plate(Box::new(FakeOcr {
            counters: counters.clone(),
            text: "",
            delay: Duration::ZERO,
        }));
        let err = cameras.activate_with(source, extractor).await.unwrap_err();
        assert!(matches!(err, EngineError::Camera(StreamError::PermissionDenied(_))));
        assert!(cameras.active_roles().await.is_empty());
    }

    #[tokio::test]
    async fn test_activation_without_models() {
        let (cameras, _engine) = cameras().await;
        assert!(!cameras.models_available());
        let err = cameras.activate(StreamRole::Face).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelUnavailable(_)));
    }

    #[test]
    fn test_stream_role_parse() {
        assert_eq!(StreamRole::parse("Face"), Some(StreamRole::Face));
        assert_eq!(StreamRole::parse("vehicle"), Some(StreamRole::Plate));
        assert_eq!(StreamRole::parse("lobby"), None);
    }
}
