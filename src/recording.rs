// SPDX-License-Identifier: GPL-3.0-only

//! Timed video recording
//!
//! A [`RecordingTask`] copies frames out of a provider (normally the
//! manager's frame buffer) into a [`VideoSink`] at a fixed rate for a
//! bounded duration. It never touches the device itself, so recordings
//! coexist with streaming and stills without extra locking.
//!
//! The sink is finalized exactly once on every exit path: normal
//! completion, gap abort, sink write failure and external stop.

use crate::constants::{recording, shutdown};
use crate::frame::{Frame, FrameBuffer};
use crate::sink::{VideoCodec, VideoSink};
use crate::worker::{LoopAction, LoopController, sleep_interruptible};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Source of frames for a recording
pub trait FrameProvider: Send + Sync {
    fn latest_frame(&self) -> Option<Frame>;
}

impl FrameProvider for FrameBuffer {
    fn latest_frame(&self) -> Option<Frame> {
        self.latest()
    }
}

/// Builds the sink on the recording thread, after the task has started
pub type SinkFactory =
    Box<dyn FnOnce() -> crate::errors::CameraResult<Box<dyn VideoSink + Send>> + Send>;

/// Everything fixed at recording start
#[derive(Debug, Clone)]
pub struct RecordingParams {
    pub filepath: PathBuf,
    pub duration: Duration,
    pub fps: u32,
    pub resolution: (u32, u32),
    pub codec: VideoCodec,
    /// Abort when no fresh frame has been seen for this long
    pub gap_grace: Duration,
}

impl RecordingParams {
    pub fn new(filepath: PathBuf, duration: Duration) -> Self {
        Self {
            filepath,
            duration,
            fps: 20,
            resolution: (1280, 720),
            codec: VideoCodec::default(),
            gap_grace: recording::FRAME_GAP_GRACE,
        }
    }
}

/// How a recording ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingOutcome {
    /// Ran for the full duration
    Completed,
    /// No frames arrived within the gap grace window
    AbortedFrameGap,
    /// Sink setup or a write failed
    Failed(String),
    /// Stopped from outside before the duration elapsed
    Stopped,
}

/// One in-flight (or finished) recording
pub struct RecordingTask {
    params: RecordingParams,
    controller: Mutex<Option<LoopController>>,
    frames_written: Arc<AtomicU64>,
    outcome: Arc<Mutex<Option<RecordingOutcome>>>,
}

impl RecordingTask {
    /// Spawn the recording thread. Sink setup happens on that thread; a
    /// factory failure is reported through [`outcome`](Self::outcome).
    pub fn start(
        params: RecordingParams,
        provider: Arc<dyn FrameProvider>,
        sink_factory: SinkFactory,
    ) -> Self {
        let frames_written = Arc::new(AtomicU64::new(0));
        let outcome = Arc::new(Mutex::new(None));

        info!(
            path = %params.filepath.display(),
            duration_s = params.duration.as_secs_f64(),
            fps = params.fps,
            "recording starting"
        );

        let init_outcome = Arc::clone(&outcome);
        let loop_params = params.clone();
        let loop_frames = Arc::clone(&frames_written);

        let controller = LoopController::start_with_init(
            "recording",
            move |_stop| match sink_factory() {
                Ok(sink) => Ok(RecState {
                    sink,
                    started: Instant::now(),
                    last_fresh: Instant::now(),
                    finished: false,
                    outcome: init_outcome,
                }),
                Err(e) => {
                    *init_outcome.lock().unwrap() = Some(RecordingOutcome::Failed(e.to_string()));
                    Err(e.to_string())
                }
            },
            move |state, stop| {
                record_tick(state, stop, &loop_params, provider.as_ref(), &loop_frames)
            },
        );

        Self {
            params,
            controller: Mutex::new(Some(controller)),
            frames_written,
            outcome,
        }
    }

    pub fn params(&self) -> &RecordingParams {
        &self.params
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.controller
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.is_running())
            .unwrap_or(false)
    }

    /// Final outcome, `None` while still recording
    pub fn outcome(&self) -> Option<RecordingOutcome> {
        self.outcome.lock().unwrap().clone()
    }

    /// Stop early and wait for the file to be finalized.
    /// Returns the number of frames written.
    pub fn stop(&self) -> u64 {
        if let Some(mut controller) = self.controller.lock().unwrap().take() {
            controller.stop(shutdown::JOIN_TIMEOUT);
        }
        self.frames_written.load(Ordering::SeqCst)
    }

    /// Block until the recording ends on its own
    pub fn wait(&self) -> u64 {
        if let Some(mut controller) = self.controller.lock().unwrap().take() {
            // Full duration plus the shutdown budget
            controller.join_timeout(self.params.duration + shutdown::JOIN_TIMEOUT * 2);
        }
        self.frames_written.load(Ordering::SeqCst)
    }
}

impl Drop for RecordingTask {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RecState {
    sink: Box<dyn VideoSink + Send>,
    started: Instant,
    last_fresh: Instant,
    finished: bool,
    outcome: Arc<Mutex<Option<RecordingOutcome>>>,
}

impl RecState {
    fn finalize(&mut self, outcome: RecordingOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.sink.finish() {
            error!(error = %e, "finalizing recording failed");
        }
        info!(?outcome, "recording ended");
        *self.outcome.lock().unwrap() = Some(outcome);
    }
}

impl Drop for RecState {
    fn drop(&mut self) {
        // Covers the external-stop path, where the loop never gets another
        // tick to finalize
        self.finalize(RecordingOutcome::Stopped);
    }
}

fn record_tick(
    state: &mut RecState,
    stop: &std::sync::atomic::AtomicBool,
    params: &RecordingParams,
    provider: &dyn FrameProvider,
    frames_written: &AtomicU64,
) -> LoopAction {
    if state.started.elapsed() >= params.duration {
        state.finalize(RecordingOutcome::Completed);
        return LoopAction::Stop;
    }

    let fresh = provider
        .latest_frame()
        .filter(|f| f.age() <= params.gap_grace);

    let Some(frame) = fresh else {
        if state.last_fresh.elapsed() > params.gap_grace {
            warn!(
                gap_s = state.last_fresh.elapsed().as_secs_f64(),
                "no frames arriving, aborting recording"
            );
            state.finalize(RecordingOutcome::AbortedFrameGap);
            return LoopAction::Stop;
        }
        sleep_interruptible(stop, recording::EMPTY_POLL_PAUSE);
        return LoopAction::Continue;
    };

    state.last_fresh = Instant::now();
    let frame = frame.resized(params.resolution.0, params.resolution.1);
    if let Err(e) = state.sink.write_frame(&frame) {
        error!(error = %e, "frame write failed, aborting recording");
        state.finalize(RecordingOutcome::Failed(e.to_string()));
        return LoopAction::Stop;
    }

    let written = frames_written.fetch_add(1, Ordering::SeqCst) + 1;
    if written % recording::PROGRESS_LOG_INTERVAL == 0 {
        info!(
            frames = written,
            elapsed_s = state.started.elapsed().as_secs_f64(),
            "recording progress"
        );
    }

    sleep_interruptible(stop, Duration::from_secs(1) / params.fps.max(1));
    LoopAction::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CameraError;
    use std::sync::atomic::AtomicU32;

    struct CountingSink {
        frames: Arc<AtomicU32>,
        finishes: Arc<AtomicU32>,
        fail_writes: bool,
    }

    impl VideoSink for CountingSink {
        fn write_frame(&mut self, _frame: &Frame) -> crate::errors::CameraResult<()> {
            if self.fail_writes {
                return Err(CameraError::EncodingFailure("disk full".into()));
            }
            self.frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn finish(&mut self) -> crate::errors::CameraResult<()> {
            self.finishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_factory(
        frames: Arc<AtomicU32>,
        finishes: Arc<AtomicU32>,
        fail_writes: bool,
    ) -> SinkFactory {
        Box::new(move || {
            Ok(Box::new(CountingSink {
                frames,
                finishes,
                fail_writes,
            }) as Box<dyn VideoSink + Send>)
        })
    }

    fn warm_buffer() -> Arc<FrameBuffer> {
        let buffer = Arc::new(FrameBuffer::new());
        buffer.store(Frame::new(16, 8, vec![50; 16 * 8 * 3]));
        buffer
    }

    fn short_params() -> RecordingParams {
        RecordingParams {
            filepath: PathBuf::from("/tmp/test.avi"),
            duration: Duration::from_millis(200),
            fps: 50,
            resolution: (16, 8),
            codec: VideoCodec::Mjpeg,
            gap_grace: Duration::from_millis(300),
        }
    }

    #[test]
    fn completes_after_the_duration_and_finishes_once() {
        let frames = Arc::new(AtomicU32::new(0));
        let finishes = Arc::new(AtomicU32::new(0));
        let task = RecordingTask::start(
            short_params(),
            warm_buffer(),
            counting_factory(Arc::clone(&frames), Arc::clone(&finishes), false),
        );

        let written = task.wait();
        assert_eq!(task.outcome(), Some(RecordingOutcome::Completed));
        assert!(written >= 2, "expected several frames, got {}", written);
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn aborts_when_no_frames_arrive() {
        let frames = Arc::new(AtomicU32::new(0));
        let finishes = Arc::new(AtomicU32::new(0));
        let params = RecordingParams {
            duration: Duration::from_secs(30),
            gap_grace: Duration::from_millis(100),
            ..short_params()
        };
        let task = RecordingTask::start(
            params,
            Arc::new(FrameBuffer::new()),
            counting_factory(Arc::clone(&frames), Arc::clone(&finishes), false),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while task.is_running() {
            assert!(Instant::now() < deadline, "abort never happened");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(task.outcome(), Some(RecordingOutcome::AbortedFrameGap));
        assert_eq!(frames.load(Ordering::SeqCst), 0);
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn external_stop_still_finalizes_the_sink() {
        let frames = Arc::new(AtomicU32::new(0));
        let finishes = Arc::new(AtomicU32::new(0));
        let params = RecordingParams {
            duration: Duration::from_secs(30),
            ..short_params()
        };
        let task = RecordingTask::start(
            params,
            warm_buffer(),
            counting_factory(Arc::clone(&frames), Arc::clone(&finishes), false),
        );

        std::thread::sleep(Duration::from_millis(100));
        task.stop();
        assert_eq!(task.outcome(), Some(RecordingOutcome::Stopped));
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_failure_aborts_with_failed_outcome() {
        let frames = Arc::new(AtomicU32::new(0));
        let finishes = Arc::new(AtomicU32::new(0));
        let task = RecordingTask::start(
            short_params(),
            warm_buffer(),
            counting_factory(Arc::clone(&frames), Arc::clone(&finishes), true),
        );

        task.wait();
        assert!(matches!(task.outcome(), Some(RecordingOutcome::Failed(_))));
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn factory_failure_reports_without_spawning_work() {
        let task = RecordingTask::start(
            short_params(),
            warm_buffer(),
            Box::new(|| Err(CameraError::EncodingFailure("no codec".into()))),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while task.is_running() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(task.outcome(), Some(RecordingOutcome::Failed(_))));
        assert_eq!(task.frames_written(), 0);
    }
}
