//! Sequential generation runs: fixed-count batches and scene queue drains.
//!
//! Only one run is active per [`Scheduler`] at a time. Every attempt inside a
//! run is compile -> send -> decode, strictly one after another, so results
//! arrive in dispatch order.

use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compiler::{compile, resolve_seed};
use crate::config::SchedulerConfig;
use crate::error::{AttemptError, NaiError, ProtocolError, SchedulerError};
use crate::payload::CompiledRequest;
use crate::stream::{progress_percent, StreamDecoder};
use crate::transport::GenerationTransport;
use crate::types::*;

/// Receives per-attempt progress and results during a run.
///
/// `on_result` is called exactly once for every dispatched attempt.
pub trait GenerationObserver: Send {
    /// A diffusion step finished. `preview` is set when a new preview image
    /// was surfaced for this step.
    fn on_progress(&mut self, attempt: &AttemptInfo, percent: u8, preview: Option<&[u8]>) {
        let _ = (attempt, percent, preview);
    }

    fn on_result(&mut self, attempt: &AttemptInfo, result: &AttemptResult);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl GenerationObserver for NoopObserver {
    fn on_result(&mut self, _attempt: &AttemptInfo, _result: &AttemptResult) {}
}

/// Build a batch factory applying the seed policy.
///
/// A locked seed is resolved once and reused for every image. Unlocked, the
/// first image keeps the base seed and every later one gets a fresh random seed.
pub fn seeded_factory(
    base: GenerationParameters,
    seed_locked: bool,
) -> impl FnMut(u32) -> GenerationParameters + Send {
    let base_seed = resolve_seed(base.seed);
    move |index| {
        let seed = if seed_locked || index == 0 {
            base_seed
        } else {
            resolve_seed(-1)
        };
        base.clone().seed(seed)
    }
}

struct Inner<T> {
    transport: T,
    config: SchedulerConfig,
    state: watch::Sender<RunSnapshot>,
    cancel: Mutex<CancellationToken>,
}

/// Runs generation work against a transport, one attempt at a time.
///
/// Cloning is cheap and every clone drives the same run, so one clone can
/// [`cancel()`](Self::cancel) while another is awaiting a run.
///
/// # Example
/// ```no_run
/// use novelai_rs::{seeded_factory, GenerationParameters, NoopObserver, NovelAiClient, Scheduler};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = Scheduler::new(NovelAiClient::new("pst-xxxx"));
/// let params = GenerationParameters::new("1girl, sunset", "nai-diffusion-4-5-full");
///
/// let report = scheduler
///     .run_batch(seeded_factory(params, false), 4, &mut NoopObserver)
///     .await?;
/// println!("{} of {} done", report.completed, report.total);
/// # Ok(())
/// # }
/// ```
pub struct Scheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

/// Bookkeeping for the run in progress.
struct ActiveRun {
    id: String,
    mode: RunMode,
    token: CancellationToken,
    attempts: Vec<AttemptRecord>,
    completed: u32,
    consecutive_failures: u32,
    failure: Option<AttemptError>,
    cancelled: bool,
}

impl<T> Scheduler<T>
where
    T: GenerationTransport,
{
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SchedulerConfig::default())
    }

    pub fn with_config(transport: T, config: SchedulerConfig) -> Self {
        let (state, _) = watch::channel(RunSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state,
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Current run state.
    pub fn snapshot(&self) -> RunSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Watch run state changes (status, counters, current scene).
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.borrow().is_running()
    }

    /// Request cancellation of the active run.
    ///
    /// No new attempt starts afterwards and the in-flight network call is
    /// abandoned; its result is discarded. Returns `false` when nothing is running.
    pub fn cancel(&self) -> bool {
        self.cancel_if(|_| true)
    }

    /// Like [`cancel()`](Self::cancel), but only if `run_id` is still the
    /// active run. A stale id never cancels a run started after it.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        self.cancel_if(|state| state.run_id.as_deref() == Some(run_id))
    }

    fn cancel_if(&self, matches: impl FnOnce(&RunSnapshot) -> bool) -> bool {
        // begin() swaps the token under the state write lock, so holding the
        // read side pins the token to the run we are looking at.
        let state = self.inner.state.borrow();
        if !state.is_running() || !matches(&*state) {
            return false;
        }
        match self.inner.cancel.lock() {
            Ok(token) => token.cancel(),
            Err(e) => {
                warn!("cancellation token lock poisoned: {}", e);
                return false;
            }
        }
        info!(run_id = ?state.run_id, "cancellation requested");
        true
    }

    /// Generate `count` images, one after another.
    ///
    /// `factory(i)` provides the parameters for image `i`; see
    /// [`seeded_factory`] for the usual seed policy.
    ///
    /// # Errors
    ///
    /// Only start-up rejections are errors. Attempt failures end the run and
    /// are reported in [`RunReport::outcome`] alongside the finished work.
    pub async fn run_batch<F, O>(
        &self,
        mut factory: F,
        count: u32,
        observer: &mut O,
    ) -> Result<RunReport, SchedulerError>
    where
        F: FnMut(u32) -> GenerationParameters + Send,
        O: GenerationObserver,
    {
        let mut run = self.begin(RunMode::Batch, count)?;
        info!(run_id = %run.id, count, "starting batch generation");

        for index in 0..count {
            if run.token.is_cancelled() {
                run.cancelled = true;
                break;
            }
            if index > 0 && !self.cool_down(&run.token).await {
                run.cancelled = true;
                break;
            }

            let params = factory(index);
            let info = AttemptInfo {
                run_id: run.id.clone(),
                run_mode: run.mode,
                index,
                scene_id: None,
                mode: None,
                seed: None,
            };
            if !self.dispatch(&mut run, info, params, observer).await {
                break;
            }
        }

        Ok(self.finish(run, count))
    }

    /// Drain the scene queue in collection order.
    ///
    /// Each pass picks the first scene with `pending_count > 0`, decrements it
    /// and runs one attempt built by `factory(scene)`. Stops when no scene has
    /// pending work, on cancellation, or when the failure tolerance is hit.
    ///
    /// `total` starts as the sum of pending counts and grows when the caller
    /// adds work to `items` mid-run, so `completed` never exceeds it.
    /// `completed` counts every attempt that produced a result, successful or not.
    pub async fn run_queue_drain<F, O>(
        &self,
        items: &Mutex<Vec<QueueableItem>>,
        mut factory: F,
        observer: &mut O,
    ) -> Result<RunReport, SchedulerError>
    where
        F: FnMut(&QueueableItem) -> GenerationParameters + Send,
        O: GenerationObserver,
    {
        let mut total = {
            let guard = items
                .lock()
                .map_err(|e| SchedulerError::Poisoned(e.to_string()))?;
            guard
                .iter()
                .fold(0u32, |acc, item| acc.saturating_add(item.pending_count))
        };

        let mut run = self.begin(RunMode::QueueDrain, total)?;
        info!(run_id = %run.id, total, "starting queue drain");

        let mut index = 0u32;
        loop {
            if run.token.is_cancelled() {
                run.cancelled = true;
                break;
            }
            if index > 0 && !self.cool_down(&run.token).await {
                run.cancelled = true;
                break;
            }

            let item = match next_pending(items) {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    run.failure = Some(AttemptError {
                        run_mode: run.mode,
                        mode: None,
                        attempt: index,
                        source: e.into(),
                    });
                    break;
                }
            };

            total = total.max(index + 1);
            self.inner.state.send_modify(|s| {
                s.current_scene = Some(item.id.clone());
                s.total = total;
            });
            debug!(run_id = %run.id, scene = %item.id, remaining = item.pending_count, "dispatching scene");

            let params = factory(&item);
            let info = AttemptInfo {
                run_id: run.id.clone(),
                run_mode: run.mode,
                index,
                scene_id: Some(item.id.clone()),
                mode: None,
                seed: None,
            };
            index += 1;
            if !self.dispatch(&mut run, info, params, observer).await {
                break;
            }
        }

        Ok(self.finish(run, total))
    }

    /// Flip to `Running` if nothing else is. Rejections leave state untouched.
    fn begin(&self, mode: RunMode, total: u32) -> Result<ActiveRun, SchedulerError> {
        let id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let mut rejection = None;

        self.inner.state.send_if_modified(|state| {
            if state.is_running() {
                rejection = Some(match state.mode {
                    Some(active) if active != mode => SchedulerError::ConflictingModeActive {
                        active,
                        requested: mode,
                    },
                    _ => SchedulerError::AlreadyRunning(mode),
                });
                return false;
            }
            match self.inner.cancel.lock() {
                Ok(mut current) => *current = token.clone(),
                Err(e) => {
                    rejection = Some(SchedulerError::Poisoned(e.to_string()));
                    return false;
                }
            }
            *state = RunSnapshot {
                run_id: Some(id.clone()),
                mode: Some(mode),
                status: RunStatus::Running,
                completed: 0,
                total,
                current_scene: None,
            };
            true
        });

        if let Some(err) = rejection {
            warn!(requested = %mode, "rejected run start: {}", err);
            return Err(err);
        }

        Ok(ActiveRun {
            id,
            mode,
            token,
            attempts: Vec::new(),
            completed: 0,
            consecutive_failures: 0,
            failure: None,
            cancelled: false,
        })
    }

    /// Run one attempt and fold its outcome into the run. Returns whether the
    /// run should continue.
    async fn dispatch<O>(
        &self,
        run: &mut ActiveRun,
        mut info: AttemptInfo,
        params: GenerationParameters,
        observer: &mut O,
    ) -> bool
    where
        O: GenerationObserver,
    {
        let started = Instant::now();
        let executed = self
            .execute(&params, &mut info, &run.token, observer)
            .await;

        // The network call may have finished after cancel() was requested.
        let executed = if run.token.is_cancelled() {
            Err(NaiError::Cancelled)
        } else {
            executed
        };

        let mut record = AttemptRecord {
            index: info.index,
            scene_id: info.scene_id.clone(),
            mode: info.mode,
            seed: info.seed,
            elapsed: started.elapsed(),
            success: false,
            filename_hint: None,
        };

        match executed {
            Err(NaiError::Cancelled) => {
                info!(run_id = %run.id, attempt = info.index, "attempt cancelled, result discarded");
                run.cancelled = true;
                observer.on_result(&info, &AttemptResult::failure(NaiError::Cancelled.to_string()));
                false
            }
            Ok((request, image)) => {
                let hint = request.filename_hint(&chrono::Local::now());
                record.success = true;
                record.filename_hint = Some(hint.clone());
                run.consecutive_failures = 0;
                self.record(run, record);
                debug!(run_id = %run.id, attempt = info.index, seed = request.seed, "attempt finished");
                observer.on_result(&info, &AttemptResult::success(image, hint));
                true
            }
            Err(error) => {
                warn!(run_id = %run.id, attempt = info.index, mode = %run.mode, "attempt failed: {}", error);
                run.consecutive_failures += 1;
                self.record(run, record);
                observer.on_result(&info, &AttemptResult::failure(error.to_string()));

                if run.consecutive_failures >= self.inner.config.failure_tolerance {
                    run.failure = Some(AttemptError {
                        run_mode: run.mode,
                        mode: info.mode,
                        attempt: info.index,
                        source: error,
                    });
                    false
                } else {
                    true
                }
            }
        }
    }

    fn record(&self, run: &mut ActiveRun, record: AttemptRecord) {
        run.attempts.push(record);
        run.completed += 1;
        let completed = run.completed;
        self.inner.state.send_modify(|s| s.completed = completed);
    }

    /// compile -> send -> decode for one attempt.
    async fn execute<O>(
        &self,
        params: &GenerationParameters,
        info: &mut AttemptInfo,
        token: &CancellationToken,
        observer: &mut O,
    ) -> Result<(CompiledRequest, Vec<u8>), NaiError>
    where
        O: GenerationObserver,
    {
        let transport = &self.inner.transport;

        let request = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(NaiError::Cancelled),
            compiled = compile(params, transport) => compiled?,
        };
        info.mode = Some(request.mode);
        info.seed = Some(request.seed);

        let mut chunks = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(NaiError::Cancelled),
            opened = transport.open_stream(&request) => opened?,
        };

        let total_steps = request.steps();
        let mut decoder = StreamDecoder::new(total_steps);
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(NaiError::Cancelled),
                next = chunks.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            for event in decoder.feed(&chunk) {
                match event? {
                    StreamEvent::Intermediate { step, image } => {
                        observer.on_progress(
                            info,
                            progress_percent(step, total_steps),
                            image.as_deref(),
                        );
                    }
                    StreamEvent::Final {
                        image: Some(image), ..
                    } => return Ok((request, image)),
                    StreamEvent::Final { image: None, .. } => {
                        return Err(ProtocolError::IncompleteStream.into())
                    }
                    StreamEvent::Error { message } => {
                        return Err(ProtocolError::Service(message).into())
                    }
                }
            }
        }

        decoder.finish()?;
        Err(ProtocolError::IncompleteStream.into())
    }

    /// Sleep for the configured cooldown. Returns `false` if cancelled meanwhile.
    async fn cool_down(&self, token: &CancellationToken) -> bool {
        let cooldown = self.inner.config.cooldown;
        if cooldown.is_zero() {
            return true;
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(cooldown) => true,
        }
    }

    fn finish(&self, run: ActiveRun, total: u32) -> RunReport {
        let outcome = match (run.cancelled, run.failure) {
            (true, _) => RunOutcome::Cancelled,
            (false, Some(error)) => RunOutcome::Failed(error),
            (false, None) => RunOutcome::Completed,
        };
        let report = RunReport {
            run_id: run.id,
            mode: run.mode,
            outcome,
            completed: run.completed,
            total,
            attempts: run.attempts,
        };

        let status = report.status();
        self.inner.state.send_modify(|s| {
            s.status = status;
            s.current_scene = None;
        });
        info!(
            run_id = %report.run_id,
            mode = %report.mode,
            ?status,
            completed = report.completed,
            total = report.total,
            "run finished"
        );
        report
    }
}

/// Claim one unit of work from the first scene that still has some.
fn next_pending(
    items: &Mutex<Vec<QueueableItem>>,
) -> Result<Option<QueueableItem>, SchedulerError> {
    let mut guard = items
        .lock()
        .map_err(|e| SchedulerError::Poisoned(e.to_string()))?;
    Ok(guard
        .iter_mut()
        .find(|item| item.pending_count > 0)
        .map(|item| {
            item.pending_count -= 1;
            item.clone()
        }))
}
