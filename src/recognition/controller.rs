//! Recognition controller: owns the engine session and runs captures through it.
//!
//! The engine is created lazily on the first request and reused while it stays healthy.
//! `cancel` can arrive at any point: it bumps the session generation, publishes the
//! `Cancelled` status immediately and terminates the engine. In-flight requests notice the
//! generation change, never touch the state of a newer session, and resolve to
//! `ControllerError::Cancelled`.
//!
//! Every request claims the session before its first await, so a second request arriving while
//! one is capturing, preparing or recognizing is rejected with `ControllerError::Busy`. Image
//! decoding and resizing run on the blocking pool.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::result::RecognitionResult;
use super::session::SessionState;
use super::status::{ClipboardOutcome, Status};
use crate::config::Settings;
use crate::geometry::clamp_rect_to_bounds;
use crate::handoff::{
    current_timestamp_ms, take_pending, CaptureHandoff, HandoffError, HandoffStore, StoreError,
    DEFAULT_HANDOFF_TTL,
};
use crate::raster::{
    compute_downscale, crop_region, decode_image_dimensions, render_scaled, scaled_dimensions,
    ImageError, RasterPayload, ScalePolicy,
};
use crate::system::{
    ensure_injectable, CaptureError, ClipboardSink, EngineError, EngineFactory, EngineProgress,
    EngineResources, InjectionError, ProgressCallback, RecognitionEngine, SelectorInjector,
    SurfaceCapture, SurfaceTarget,
};

const STAGE_RECOGNIZING: &str = "recognizing text";

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Cancelled")]
    Cancelled,
    #[error("Recognition already in progress")]
    Busy,
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("Screenshot failed: {0}")]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Injection(#[from] InjectionError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Failed to read region data: {0}")]
    Store(#[from] StoreError),
}

/// Host collaborators the controller talks to.
#[derive(Clone)]
pub struct HostServices {
    pub capture: Arc<dyn SurfaceCapture>,
    pub injector: Arc<dyn SelectorInjector>,
    pub store: Arc<dyn HandoffStore>,
    pub clipboard: Arc<dyn ClipboardSink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    pub resources: EngineResources,
    pub scale_policy: ScalePolicy,
    pub handoff_ttl: Duration,
    pub copy_to_clipboard: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            resources: EngineResources::default(),
            scale_policy: ScalePolicy::default(),
            handoff_ttl: DEFAULT_HANDOFF_TTL,
            copy_to_clipboard: true,
        }
    }
}

impl From<&Settings> for ControllerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            resources: settings.engine.clone(),
            scale_policy: settings.scale_policy,
            handoff_ttl: settings.handoff_ttl,
            copy_to_clipboard: settings.copy_to_clipboard,
        }
    }
}

struct Session {
    state: SessionState,
    engine: Option<Arc<dyn RecognitionEngine>>,
    /// Bumped by every cancellation; requests from an older generation are stale.
    generation: u64,
    /// Id of the request currently running a pipeline, if any.
    active_job: Option<u64>,
    next_job: u64,
}

/// A claimed pipeline run. Dropping it frees the session for the next request.
struct Job {
    id: u64,
    generation: u64,
    cancel_rx: watch::Receiver<u64>,
    session: Arc<Mutex<Session>>,
}

impl Job {
    fn is_current(&self) -> bool {
        lock_session(&self.session).generation == self.generation
    }

    /// Resolves once a cancellation newer than this job is published.
    async fn cancelled(&mut self) {
        if self.cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        let mut session = lock_session(&self.session);
        if session.active_job == Some(self.id) {
            session.active_job = None;
        }
    }
}

fn lock_session(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RecognitionController {
    factory: Arc<dyn EngineFactory>,
    host: HostServices,
    options: ControllerOptions,
    session: Arc<Mutex<Session>>,
    cancel_tx: watch::Sender<u64>,
    status_tx: Arc<watch::Sender<Status>>,
}

impl RecognitionController {
    pub fn new(factory: Arc<dyn EngineFactory>, host: HostServices, options: ControllerOptions) -> Self {
        let (cancel_tx, _) = watch::channel(0);
        let (status_tx, _) = watch::channel(Status::Idle);
        Self {
            factory,
            host,
            options,
            session: Arc::new(Mutex::new(Session {
                state: SessionState::Uninitialized,
                engine: None,
                generation: 0,
                active_job: None,
                next_job: 0,
            })),
            cancel_tx,
            status_tx: Arc::new(status_tx),
        }
    }

    pub fn status(&self) -> Status {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    pub fn session_state(&self) -> SessionState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        lock_session(&self.session)
    }

    fn set_status(&self, status: Status) {
        debug!(status = %status, "Status changed");
        self.status_tx.send_replace(status);
    }

    fn transition(session: &mut Session, next: SessionState) {
        if !session.state.can_transition_to(next) {
            warn!(from = %session.state, to = %next, "Unexpected session transition");
        }
        trace!(from = %session.state, to = %next, "Session transition");
        session.state = next;
    }

    fn fail<E: Into<ControllerError>>(&self, err: E) -> ControllerError {
        let err = err.into();
        error!(error = %err, "Recognition pipeline failed");
        self.set_status(Status::Error(err.to_string()));
        err
    }

    /// Claims the session for one pipeline run, before anything is awaited.
    fn begin_job(&self) -> Result<Job, ControllerError> {
        let mut session = self.lock();
        if session.state.is_busy() || session.active_job.is_some() {
            warn!(state = %session.state, "Request ignored, recognition already running");
            return Err(ControllerError::Busy);
        }
        session.next_job += 1;
        let id = session.next_job;
        session.active_job = Some(id);
        Ok(Job {
            id,
            generation: session.generation,
            cancel_rx: self.cancel_tx.subscribe(),
            session: Arc::clone(&self.session),
        })
    }

    /// Awaits `work` unless the job is cancelled first.
    async fn guarded<T>(
        &self,
        job: &mut Job,
        work: impl Future<Output = T>,
    ) -> Result<T, ControllerError> {
        let outcome = tokio::select! {
            output = work => Some(output),
            _ = job.cancelled() => None,
        };
        match outcome {
            Some(output) if job.is_current() => Ok(output),
            _ => {
                info!(generation = job.generation, "Pipeline cancelled");
                Err(ControllerError::Cancelled)
            }
        }
    }

    /// Starts the region selector in `target`.
    pub async fn begin_region_selection(&self, target: &SurfaceTarget) -> Result<(), ControllerError> {
        ensure_injectable(&target.url).map_err(|e| self.fail(e))?;
        self.set_status(Status::SelectingRegion);
        self.host
            .injector
            .inject(target)
            .await
            .map_err(|e| self.fail(e))?;
        debug!(tab_id = target.tab_id, "Region selector injected");
        Ok(())
    }

    /// Captures the whole visible surface of `window_id`, downscales it if needed and recognizes it.
    pub async fn run_full_capture(&self, window_id: u32) -> Result<RecognitionResult, ControllerError> {
        let mut job = self.begin_job()?;
        self.set_status(Status::Capturing);
        let raster = self
            .guarded(&mut job, self.host.capture.capture_visible_surface(window_id))
            .await?
            .map_err(|e| self.fail(e))?;

        self.set_status(Status::Preparing);
        let policy = self.options.scale_policy;
        let prepared = self
            .guarded(&mut job, off_runtime(move || fit_to_policy(raster, policy)))
            .await?
            .map_err(|e| self.fail(e))?;
        self.recognize_job(job, prepared).await
    }

    /// Crops a handed-off capture to its selection and recognizes it. No downscaling: selections
    /// are small.
    pub async fn run_region_capture(
        &self,
        handoff: CaptureHandoff,
    ) -> Result<RecognitionResult, ControllerError> {
        let job = self.begin_job()?;
        self.region_job(job, handoff).await
    }

    async fn region_job(
        &self,
        mut job: Job,
        handoff: CaptureHandoff,
    ) -> Result<RecognitionResult, ControllerError> {
        self.set_status(Status::Preparing);
        let cropped = self
            .guarded(&mut job, off_runtime(move || crop_handoff(&handoff)))
            .await?
            .map_err(|e| self.fail(e))?;
        self.recognize_job(job, cropped).await
    }

    /// Picks up a handoff left by the capture relay, if any.
    pub async fn resume_pending(&self) -> Result<Option<RecognitionResult>, ControllerError> {
        self.resume_pending_at(current_timestamp_ms()).await
    }

    /// `resume_pending` against an explicit clock. Expired data is dropped with a neutral status.
    pub async fn resume_pending_at(
        &self,
        now_ms: u64,
    ) -> Result<Option<RecognitionResult>, ControllerError> {
        let mut job = self.begin_job()?;
        let taken = self
            .guarded(
                &mut job,
                take_pending(self.host.store.as_ref(), now_ms, self.options.handoff_ttl),
            )
            .await?;
        match taken {
            Ok(None) => {
                self.set_status(Status::Idle);
                Ok(None)
            }
            Ok(Some(handoff)) => self.region_job(job, handoff).await.map(Some),
            Err(HandoffError::Expired { age_ms }) => {
                info!(age_ms, "Region data expired");
                self.set_status(Status::Expired);
                Ok(None)
            }
            Err(HandoffError::Store(e)) => Err(self.fail(e)),
        }
    }

    /// Runs `payload` through the engine, starting a session first when none is live.
    pub async fn recognize(&self, payload: RasterPayload) -> Result<RecognitionResult, ControllerError> {
        let job = self.begin_job()?;
        self.recognize_job(job, payload).await
    }

    async fn recognize_job(
        &self,
        mut job: Job,
        payload: RasterPayload,
    ) -> Result<RecognitionResult, ControllerError> {
        let generation = job.generation;
        let live = {
            let mut session = self.lock();
            if session.generation != generation {
                Err(ControllerError::Cancelled)
            } else {
                match session.engine.as_ref() {
                    Some(engine) if !session.state.needs_engine() => Ok(Some(Arc::clone(engine))),
                    _ => {
                        Self::transition(&mut session, SessionState::Initializing);
                        Ok(None)
                    }
                }
            }
        };

        let engine = match live? {
            Some(engine) => engine,
            None => self.start_engine(&mut job).await?,
        };

        let current = {
            let mut session = self.lock();
            let current = session.generation == generation;
            if current {
                Self::transition(&mut session, SessionState::Recognizing);
            }
            current
        };
        if !current {
            return Err(ControllerError::Cancelled);
        }
        self.set_status(Status::Progress {
            stage: STAGE_RECOGNIZING.to_string(),
            percent: 0,
        });
        debug!(bytes = payload.len(), generation, "Recognizing");

        let outcome = tokio::select! {
            result = engine.recognize(&payload) => Some(result),
            _ = job.cancelled() => None,
        };

        let current = {
            let mut session = self.lock();
            let current = session.generation == generation;
            if current {
                Self::transition(&mut session, SessionState::Ready);
            }
            current
        };

        match outcome {
            Some(Ok(output)) if current => self.deliver(output.text, generation).await,
            Some(Err(e)) if current => Err(self.fail(e)),
            _ => {
                info!(generation, "Recognition cancelled");
                Err(ControllerError::Cancelled)
            }
        }
    }

    async fn start_engine(&self, job: &mut Job) -> Result<Arc<dyn RecognitionEngine>, ControllerError> {
        let generation = job.generation;
        info!(language = %self.options.resources.language, "Starting OCR engine");
        let engine = self.factory.create();
        let progress = self.progress_callback(generation);

        let init = tokio::select! {
            result = engine.initialize(&self.options.resources, progress) => Some(result),
            _ = job.cancelled() => None,
        };

        let cancelled = {
            let mut session = self.lock();
            let cancelled = init.is_none() || session.generation != generation;
            if !cancelled {
                match &init {
                    Some(Ok(())) => {
                        session.engine = Some(Arc::clone(&engine));
                        Self::transition(&mut session, SessionState::Ready);
                    }
                    _ => Self::transition(&mut session, SessionState::Uninitialized),
                }
            }
            cancelled
        };

        if cancelled {
            info!("Cancelled during engine start, tearing the new engine down");
            if let Err(e) = engine.terminate().await {
                warn!(error = %e, "Failed to terminate engine");
            }
            return Err(ControllerError::Cancelled);
        }

        match init {
            Some(Ok(())) => {
                info!("OCR engine ready");
                Ok(engine)
            }
            Some(Err(e)) => {
                if let Err(term) = engine.terminate().await {
                    warn!(error = %term, "Failed to terminate engine after failed start");
                }
                Err(self.fail(e))
            }
            None => Err(ControllerError::Cancelled),
        }
    }

    /// Maps engine progress into the status, ignoring reports from cancelled sessions.
    fn progress_callback(&self, generation: u64) -> ProgressCallback {
        let session = Arc::clone(&self.session);
        let status_tx = Arc::clone(&self.status_tx);
        Arc::new(move |progress: EngineProgress| {
            if lock_session(&session).generation == generation {
                trace!(stage = %progress.status, progress = progress.progress, "Engine progress");
                status_tx.send_replace(Status::from_progress(&progress));
            }
        })
    }

    async fn deliver(&self, text: String, generation: u64) -> Result<RecognitionResult, ControllerError> {
        let result = RecognitionResult::from_text(text.trim());
        if result.is_empty() {
            info!("No text recognized");
            self.set_status(Status::NoText);
            return Ok(result);
        }

        let clipboard = if self.options.copy_to_clipboard {
            match self.host.clipboard.write_text(&result.text).await {
                Ok(()) => ClipboardOutcome::Copied,
                Err(e) => {
                    warn!(error = %e, "Could not copy recognized text");
                    ClipboardOutcome::Failed
                }
            }
        } else {
            ClipboardOutcome::Skipped
        };

        info!(
            words = result.word_count,
            chars = result.character_count,
            ?clipboard,
            "Recognition finished"
        );
        if self.lock().generation == generation {
            self.set_status(Status::Done {
                word_count: result.word_count,
                character_count: result.character_count,
                clipboard,
            });
        }
        Ok(result)
    }

    /// Aborts whatever is running and tears the session down. The next request starts a new one.
    pub async fn cancel(&self) {
        self.teardown(Some(Status::Cancelled)).await;
        info!("Recognition cancelled by user");
    }

    /// Terminates the live session, if any, without touching the status.
    pub async fn shutdown(&self) {
        self.teardown(None).await;
    }

    async fn teardown(&self, status: Option<Status>) {
        let engine = {
            let mut session = self.lock();
            session.generation += 1;
            session.active_job = None;
            if session.state != SessionState::Uninitialized {
                Self::transition(&mut session, SessionState::Terminated);
            }
            self.cancel_tx.send_replace(session.generation);
            session.engine.take()
        };
        if let Some(status) = status {
            self.set_status(status);
        }

        if let Some(engine) = engine {
            if let Err(e) = engine.terminate().await {
                warn!(error = %e, "Failed to terminate engine");
            }
        }
    }
}

/// Runs CPU-heavy image work on the blocking pool.
async fn off_runtime<F>(work: F) -> Result<RasterPayload, ImageError>
where
    F: FnOnce() -> Result<RasterPayload, ImageError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ImageError::Render(format!("Image worker failed: {e}")))?
}

fn fit_to_policy(raster: RasterPayload, policy: ScalePolicy) -> Result<RasterPayload, ImageError> {
    let dimensions = decode_image_dimensions(&raster)?;
    let scale = compute_downscale(
        dimensions.width,
        dimensions.height,
        policy.max_pixels,
        policy.max_dimension,
    );
    if scale >= 1.0 {
        return Ok(raster);
    }

    let target = scaled_dimensions(dimensions, scale);
    info!(
        width = dimensions.width,
        height = dimensions.height,
        scaled_width = target.width,
        scaled_height = target.height,
        scale,
        "Downscaling capture"
    );
    render_scaled(&raster, target.width, target.height)
}

fn crop_handoff(handoff: &CaptureHandoff) -> Result<RasterPayload, ImageError> {
    let dimensions = decode_image_dimensions(&handoff.raster_payload)?;
    let rect = clamp_rect_to_bounds(handoff.rect, dimensions.width, dimensions.height);
    debug!(id = %handoff.id, requested = ?handoff.rect, clamped = ?rect, "Cropping region");
    crop_region(&handoff.raster_payload, rect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SelectionRect;
    use crate::handoff::{MemoryHandoffStore, PENDING_CAPTURE_KEY};
    use crate::raster::test_png;
    use crate::system::{ClipboardError, EngineOutput};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Calls {
        created: AtomicUsize,
        init_calls: AtomicUsize,
        recognize_calls: AtomicUsize,
        terminate_calls: AtomicUsize,
        init_started: Notify,
        recognize_started: Notify,
        last_size: Mutex<Option<(u32, u32)>>,
    }

    impl Calls {
        fn count(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    struct MockEngine {
        calls: Arc<Calls>,
        text: Result<String, String>,
        hold_init: bool,
        hold_recognize: bool,
    }

    #[async_trait]
    impl RecognitionEngine for MockEngine {
        async fn initialize(
            &self,
            _resources: &EngineResources,
            progress: ProgressCallback,
        ) -> Result<(), EngineError> {
            self.calls.init_calls.fetch_add(1, Ordering::SeqCst);
            progress(EngineProgress::new("loading language traineddata", 0.5));
            self.calls.init_started.notify_one();
            if self.hold_init {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn recognize(&self, image: &RasterPayload) -> Result<EngineOutput, EngineError> {
            self.calls.recognize_calls.fetch_add(1, Ordering::SeqCst);
            let dims = decode_image_dimensions(image).map_err(|e| EngineError::Recognition(e.to_string()))?;
            *self.calls.last_size.lock().unwrap() = Some((dims.width, dims.height));
            self.calls.recognize_started.notify_one();
            if self.hold_recognize {
                std::future::pending::<()>().await;
            }
            self.text
                .clone()
                .map(|text| EngineOutput { text })
                .map_err(EngineError::Recognition)
        }

        async fn terminate(&self) -> Result<(), EngineError> {
            self.calls.terminate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands out mock engines; the hold flags apply to the first engine only.
    struct MockFactory {
        calls: Arc<Calls>,
        text: Result<String, String>,
        hold_init_once: AtomicBool,
        hold_recognize_once: AtomicBool,
    }

    impl MockFactory {
        fn new(text: Result<&str, &str>) -> Self {
            Self {
                calls: Arc::new(Calls::default()),
                text: text.map(str::to_string).map_err(str::to_string),
                hold_init_once: AtomicBool::new(false),
                hold_recognize_once: AtomicBool::new(false),
            }
        }
    }

    impl EngineFactory for MockFactory {
        fn create(&self) -> Arc<dyn RecognitionEngine> {
            self.calls.created.fetch_add(1, Ordering::SeqCst);
            Arc::new(MockEngine {
                calls: Arc::clone(&self.calls),
                text: self.text.clone(),
                hold_init: self.hold_init_once.swap(false, Ordering::SeqCst),
                hold_recognize: self.hold_recognize_once.swap(false, Ordering::SeqCst),
            })
        }
    }

    struct MockSurface(Option<(u32, u32)>);

    #[async_trait]
    impl SurfaceCapture for MockSurface {
        async fn capture_visible_surface(&self, _window_id: u32) -> Result<RasterPayload, CaptureError> {
            match self.0 {
                Some((w, h)) => Ok(test_png(w, h)),
                None => Err(CaptureError::Denied("chrome://settings".into())),
            }
        }
    }

    #[derive(Default)]
    struct MockClipboard {
        fail: bool,
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClipboardSink for MockClipboard {
        async fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
            if self.fail {
                return Err(ClipboardError::Unavailable("no display".into()));
            }
            self.writes.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockInjector(AtomicUsize);

    #[async_trait]
    impl SelectorInjector for MockInjector {
        async fn inject(&self, _target: &SurfaceTarget) -> Result<(), InjectionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        controller: Arc<RecognitionController>,
        calls: Arc<Calls>,
        store: Arc<MemoryHandoffStore>,
        clipboard: Arc<MockClipboard>,
        injector: Arc<MockInjector>,
    }

    /// Surface that blocks inside the capture until released.
    #[derive(Default)]
    struct GatedSurface {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SurfaceCapture for GatedSurface {
        async fn capture_visible_surface(&self, _window_id: u32) -> Result<RasterPayload, CaptureError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(test_png(32, 32))
        }
    }

    /// Store whose reads block until released.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryHandoffStore,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl HandoffStore for GatedStore {
        async fn put(&self, key: &str, value: &CaptureHandoff) -> Result<(), StoreError> {
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> Result<Option<CaptureHandoff>, StoreError> {
            self.started.notify_one();
            self.release.notified().await;
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    fn fixture_with(
        factory: MockFactory,
        capture: Arc<dyn SurfaceCapture>,
        clipboard: MockClipboard,
        options: ControllerOptions,
    ) -> Fixture {
        let calls = Arc::clone(&factory.calls);
        let store = Arc::new(MemoryHandoffStore::new());
        let clipboard = Arc::new(clipboard);
        let injector = Arc::new(MockInjector::default());
        let host = HostServices {
            capture,
            injector: injector.clone(),
            store: store.clone(),
            clipboard: clipboard.clone(),
        };
        Fixture {
            controller: Arc::new(RecognitionController::new(Arc::new(factory), host, options)),
            calls,
            store,
            clipboard,
            injector,
        }
    }

    fn fixture(factory: MockFactory) -> Fixture {
        fixture_with(
            factory,
            Arc::new(MockSurface(Some((64, 48)))),
            MockClipboard::default(),
            ControllerOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_full_capture_within_limits_is_not_scaled() {
        let f = fixture(MockFactory::new(Ok("hello  brave\nworld\n")));

        let result = f.controller.run_full_capture(1).await.unwrap();
        assert_eq!(result.text, "hello  brave\nworld");
        assert_eq!(result.word_count, 3);
        assert_eq!(*f.calls.last_size.lock().unwrap(), Some((64, 48)));
        assert_eq!(*f.clipboard.writes.lock().unwrap(), vec![result.text.clone()]);
        assert_eq!(
            f.controller.status(),
            Status::Done {
                word_count: 3,
                character_count: 18,
                clipboard: ClipboardOutcome::Copied
            }
        );
        assert_eq!(f.controller.session_state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_full_capture_over_limits_is_downscaled() {
        let options = ControllerOptions {
            scale_policy: ScalePolicy {
                max_pixels: 5000,
                max_dimension: 100,
            },
            ..ControllerOptions::default()
        };
        let f = fixture_with(
            MockFactory::new(Ok("text")),
            Arc::new(MockSurface(Some((100, 80)))),
            MockClipboard::default(),
            options,
        );

        f.controller.run_full_capture(1).await.unwrap();
        assert_eq!(*f.calls.last_size.lock().unwrap(), Some((79, 63)));
    }

    #[tokio::test]
    async fn test_image_worker_panic_becomes_image_error() {
        let result = off_runtime(|| panic!("decoder blew up")).await;
        assert!(matches!(result, Err(ImageError::Render(msg)) if msg.starts_with("Image worker failed")));
    }

    #[tokio::test]
    async fn test_engine_is_started_once_and_reused() {
        let f = fixture(MockFactory::new(Ok("a b")));
        f.controller.recognize(test_png(8, 8)).await.unwrap();
        f.controller.recognize(test_png(8, 8)).await.unwrap();
        assert_eq!(Calls::count(&f.calls.created), 1);
        assert_eq!(Calls::count(&f.calls.init_calls), 1);
        assert_eq!(Calls::count(&f.calls.recognize_calls), 2);
    }

    #[tokio::test]
    async fn test_region_capture_crops_to_rect() {
        let f = fixture(MockFactory::new(Ok("region")));
        let handoff = CaptureHandoff::new(test_png(40, 40), SelectionRect::new(5, 5, 10, 20), 0);
        f.controller.run_region_capture(handoff).await.unwrap();
        assert_eq!(*f.calls.last_size.lock().unwrap(), Some((10, 20)));
    }

    #[tokio::test]
    async fn test_region_overflowing_image_is_clamped() {
        let f = fixture(MockFactory::new(Ok("region")));
        let handoff = CaptureHandoff::new(test_png(40, 40), SelectionRect::new(30, 30, 50, 50), 0);
        f.controller.run_region_capture(handoff).await.unwrap();
        assert_eq!(*f.calls.last_size.lock().unwrap(), Some((10, 10)));
    }

    #[tokio::test]
    async fn test_resume_processes_fresh_handoff() {
        let f = fixture(MockFactory::new(Ok("fresh text")));
        let handoff = CaptureHandoff::new(test_png(30, 30), SelectionRect::new(0, 0, 20, 20), 1_000);
        f.store.put(PENDING_CAPTURE_KEY, &handoff).await.unwrap();

        let result = f.controller.resume_pending_at(2_000).await.unwrap();
        assert_eq!(result.map(|r| r.word_count), Some(2));
        assert!(f.store.get(PENDING_CAPTURE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_handoff_never_starts_engine() {
        let f = fixture(MockFactory::new(Ok("stale")));
        let handoff = CaptureHandoff::new(test_png(30, 30), SelectionRect::new(0, 0, 20, 20), 0);
        f.store.put(PENDING_CAPTURE_KEY, &handoff).await.unwrap();

        let result = f.controller.resume_pending_at(60_001).await.unwrap();
        assert!(result.is_none());
        assert_eq!(f.controller.status(), Status::Expired);
        assert_eq!(
            f.controller.status().to_string(),
            "Region data expired, please try again"
        );
        assert_eq!(Calls::count(&f.calls.created), 0);
        assert!(f.store.get(PENDING_CAPTURE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_pending_handoff_is_idle() {
        let f = fixture(MockFactory::new(Ok("unused")));
        let result = f.controller.resume_pending_at(0).await.unwrap();
        assert!(result.is_none());
        assert_eq!(f.controller.status(), Status::Idle);
        assert_eq!(Calls::count(&f.calls.created), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_initialization_tears_engine_down() {
        let factory = MockFactory::new(Ok("later"));
        factory.hold_init_once.store(true, Ordering::SeqCst);
        let f = fixture(factory);

        let controller = Arc::clone(&f.controller);
        let task = tokio::spawn(async move { controller.recognize(test_png(8, 8)).await });
        f.calls.init_started.notified().await;
        assert_eq!(
            f.controller.status(),
            Status::Progress {
                stage: "loading language traineddata".into(),
                percent: 50
            }
        );
        assert_eq!(f.controller.session_state(), SessionState::Initializing);

        f.controller.cancel().await;
        assert_eq!(f.controller.status(), Status::Cancelled);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ControllerError::Cancelled)));
        assert_eq!(Calls::count(&f.calls.recognize_calls), 0);
        assert_eq!(Calls::count(&f.calls.terminate_calls), 1);
        assert_eq!(f.controller.status(), Status::Cancelled);

        // The next request builds a brand-new session.
        f.controller.recognize(test_png(8, 8)).await.unwrap();
        assert_eq!(Calls::count(&f.calls.created), 2);
        assert_eq!(Calls::count(&f.calls.recognize_calls), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_recognition_reports_cancelled() {
        let factory = MockFactory::new(Ok("never"));
        factory.hold_recognize_once.store(true, Ordering::SeqCst);
        let f = fixture(factory);

        let controller = Arc::clone(&f.controller);
        let task = tokio::spawn(async move { controller.recognize(test_png(8, 8)).await });
        f.calls.recognize_started.notified().await;
        assert_eq!(f.controller.session_state(), SessionState::Recognizing);

        f.controller.cancel().await;
        assert_eq!(f.controller.status(), Status::Cancelled);
        assert_eq!(f.controller.session_state(), SessionState::Terminated);
        assert_eq!(Calls::count(&f.calls.terminate_calls), 1);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ControllerError::Cancelled)));
        assert!(!f.controller.status().is_error());
        assert_eq!(f.controller.status(), Status::Cancelled);

        f.controller.recognize(test_png(8, 8)).await.unwrap();
        assert_eq!(Calls::count(&f.calls.created), 2);
        assert_eq!(Calls::count(&f.calls.init_calls), 2);
        assert_eq!(f.controller.session_state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_second_request_while_recognizing_is_busy() {
        let factory = MockFactory::new(Ok("slow"));
        factory.hold_recognize_once.store(true, Ordering::SeqCst);
        let f = fixture(factory);

        let controller = Arc::clone(&f.controller);
        let task = tokio::spawn(async move { controller.recognize(test_png(8, 8)).await });
        f.calls.recognize_started.notified().await;

        let second = f.controller.recognize(test_png(8, 8)).await;
        assert!(matches!(second, Err(ControllerError::Busy)));
        let third = f.controller.run_full_capture(1).await;
        assert!(matches!(third, Err(ControllerError::Busy)));
        assert_eq!(Calls::count(&f.calls.recognize_calls), 1);

        f.controller.cancel().await;
        assert!(matches!(task.await.unwrap(), Err(ControllerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_during_capture_stops_the_pipeline() {
        let surface = Arc::new(GatedSurface::default());
        let f = fixture_with(
            MockFactory::new(Ok("should not appear")),
            surface.clone(),
            MockClipboard::default(),
            ControllerOptions::default(),
        );

        let controller = Arc::clone(&f.controller);
        let task = tokio::spawn(async move { controller.run_full_capture(1).await });
        surface.started.notified().await;
        assert_eq!(f.controller.status(), Status::Capturing);

        f.controller.cancel().await;

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ControllerError::Cancelled)));
        assert_eq!(f.controller.status(), Status::Cancelled);
        assert_eq!(Calls::count(&f.calls.created), 0);
        assert!(f.clipboard.writes.lock().unwrap().is_empty());

        // A fresh request is accepted once the cancelled one is gone.
        surface.release.notify_one();
        f.controller.run_full_capture(1).await.unwrap();
        assert_eq!(Calls::count(&f.calls.created), 1);
    }

    #[tokio::test]
    async fn test_second_capture_while_capturing_is_busy() {
        let surface = Arc::new(GatedSurface::default());
        let f = fixture_with(
            MockFactory::new(Ok("once")),
            surface.clone(),
            MockClipboard::default(),
            ControllerOptions::default(),
        );

        let controller = Arc::clone(&f.controller);
        let task = tokio::spawn(async move { controller.run_full_capture(1).await });
        surface.started.notified().await;

        let second = f.controller.run_full_capture(1).await;
        assert!(matches!(second, Err(ControllerError::Busy)));
        let third = f.controller.resume_pending_at(0).await;
        assert!(matches!(third, Err(ControllerError::Busy)));
        assert_eq!(f.controller.status(), Status::Capturing);

        surface.release.notify_one();
        let first = task.await.unwrap().unwrap();
        assert_eq!(first.text, "once");
        assert_eq!(Calls::count(&f.calls.recognize_calls), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_store_read_skips_recognition() {
        let store = Arc::new(GatedStore::default());
        let factory = MockFactory::new(Ok("late"));
        let calls = Arc::clone(&factory.calls);
        let host = HostServices {
            capture: Arc::new(MockSurface(Some((8, 8)))),
            injector: Arc::new(MockInjector::default()),
            store: store.clone(),
            clipboard: Arc::new(MockClipboard::default()),
        };
        let controller = Arc::new(RecognitionController::new(
            Arc::new(factory),
            host,
            ControllerOptions::default(),
        ));
        let handoff = CaptureHandoff::new(test_png(30, 30), SelectionRect::new(0, 0, 20, 20), 0);
        store.put(PENDING_CAPTURE_KEY, &handoff).await.unwrap();

        let running = Arc::clone(&controller);
        let task = tokio::spawn(async move { running.resume_pending_at(1_000).await });
        store.started.notified().await;
        controller.cancel().await;
        store.release.notify_one();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ControllerError::Cancelled)));
        assert_eq!(controller.status(), Status::Cancelled);
        assert_eq!(Calls::count(&calls.created), 0);
    }

    #[tokio::test]
    async fn test_engine_failure_leaves_session_ready() {
        let f = fixture(MockFactory::new(Err("worker crashed")));

        let result = f.controller.recognize(test_png(8, 8)).await;
        assert!(matches!(result, Err(ControllerError::Engine(_))));
        assert!(f.controller.status().is_error());
        assert!(f.controller.status().to_string().contains("worker crashed"));
        assert_eq!(f.controller.session_state(), SessionState::Ready);

        let _ = f.controller.recognize(test_png(8, 8)).await;
        assert_eq!(Calls::count(&f.calls.created), 1);
        assert_eq!(Calls::count(&f.calls.recognize_calls), 2);
    }

    #[tokio::test]
    async fn test_blank_text_skips_clipboard() {
        let f = fixture(MockFactory::new(Ok(" \n\x0c")));
        let result = f.controller.recognize(test_png(8, 8)).await.unwrap();
        assert_eq!(result.word_count, 0);
        assert_eq!(f.controller.status(), Status::NoText);
        assert!(f.clipboard.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clipboard_failure_is_not_fatal() {
        let f = fixture_with(
            MockFactory::new(Ok("copy me")),
            Arc::new(MockSurface(Some((16, 16)))),
            MockClipboard {
                fail: true,
                ..MockClipboard::default()
            },
            ControllerOptions::default(),
        );
        let result = f.controller.run_full_capture(1).await.unwrap();
        assert_eq!(result.text, "copy me");
        assert!(matches!(
            f.controller.status(),
            Status::Done {
                clipboard: ClipboardOutcome::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_capture_failure_is_reported_without_engine() {
        let f = fixture_with(
            MockFactory::new(Ok("unused")),
            Arc::new(MockSurface(None)),
            MockClipboard::default(),
            ControllerOptions::default(),
        );
        let result = f.controller.run_full_capture(1).await;
        assert!(matches!(result, Err(ControllerError::Capture(_))));
        assert!(f.controller.status().is_error());
        assert_eq!(Calls::count(&f.calls.created), 0);
        assert_eq!(f.controller.session_state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_region_selection_checks_url_first() {
        let f = fixture(MockFactory::new(Ok("unused")));
        let restricted = SurfaceTarget {
            tab_id: 1,
            window_id: 1,
            url: "chrome://extensions".into(),
        };
        let result = f.controller.begin_region_selection(&restricted).await;
        assert!(matches!(result, Err(ControllerError::Injection(_))));
        assert_eq!(f.injector.0.load(Ordering::SeqCst), 0);
        assert!(f.controller.status().is_error());

        let page = SurfaceTarget {
            url: "https://example.com/article".into(),
            ..restricted
        };
        f.controller.begin_region_selection(&page).await.unwrap();
        assert_eq!(f.injector.0.load(Ordering::SeqCst), 1);
        assert_eq!(f.controller.status(), Status::SelectingRegion);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_live_engine() {
        let f = fixture(MockFactory::new(Ok("x")));
        f.controller.recognize(test_png(8, 8)).await.unwrap();
        f.controller.shutdown().await;
        assert_eq!(Calls::count(&f.calls.terminate_calls), 1);
        assert_eq!(f.controller.session_state(), SessionState::Terminated);
    }
}
