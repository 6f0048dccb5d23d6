//! The per-camera capture and rotation loop.

use std::path::PathBuf;

use chrono::{DateTime, Local, TimeDelta};
use strum::Display;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    annotate,
    capture::{CaptureError, Frame, FrameSource},
    encoder::{EncoderError, EncoderFactory, SegmentEncoder},
    preview,
    segment::{day_directory, unique_segment_name},
    settings::RuntimeParams,
    stop::StopSignal,
    transfer::{TransferJob, TransferLauncher, TransferPool, TransferStats},
};

pub const EXIT_SETUP_FAILED: i32 = 1;
pub const EXIT_OPEN_FAILED: i32 = 2;

pub trait Clock {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WorkerExit {
    #[strum(serialize = "stopped on request")]
    Stopped,
    #[strum(serialize = "camera went offline")]
    CameraOffline,
}

impl WorkerExit {
    /// Process exit status reported to the supervisor.
    #[inline]
    pub const fn code(self) -> i32 {
        match self {
            Self::Stopped => 0,
            Self::CameraOffline => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub file_name: String,
    pub opened_at: DateTime<Local>,
    pub frames:    u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub exit:            WorkerExit,
    pub frames_captured: u64,
    /// Frames read while no segment could be opened.
    pub frames_dropped:  u64,
    pub previews:        u64,
    pub segments:        Vec<SegmentRecord>,
    pub transfers:       TransferStats,
}

/// The segment currently being written.
struct WriterState {
    encoder:     Box<dyn SegmentEncoder>,
    temp_path:   PathBuf,
    destination: PathBuf,
    file_name:   String,
    opened_at:   DateTime<Local>,
    frames:      u64,
}

#[derive(Debug, Error)]
enum SegmentError {
    #[error("cannot create {path}: {source}")]
    Directory {
        path:   PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

/// Creates the directories a worker needs before it opens its camera.
#[inline]
pub fn prepare_directories(params: &RuntimeParams) -> std::io::Result<()> {
    std::fs::create_dir_all(&params.temp_dir)?;
    if let Some(stills) = params.preview_path.parent() {
        std::fs::create_dir_all(stills)?;
    }
    Ok(())
}

/// Owns one opened camera and everything derived from it for the worker's lifetime.
pub struct CameraWorker<S, E, L, C> {
    params:    RuntimeParams,
    slice:     TimeDelta,
    source:    S,
    encoders:  E,
    transfers: TransferPool<L>,
    clock:     C,
    stop:      StopSignal,

    writer:           Option<WriterState>,
    rotation_failing: bool,

    frames_captured: u64,
    frames_dropped:  u64,
    previews:        u64,
    segments:        Vec<SegmentRecord>,
}

impl<S, E, L, C> CameraWorker<S, E, L, C>
where
    S: FrameSource,
    E: EncoderFactory,
    L: TransferLauncher,
    C: Clock,
{
    #[inline]
    pub fn new(
        params: RuntimeParams,
        source: S,
        encoders: E,
        launcher: L,
        clock: C,
        stop: StopSignal,
    ) -> Self {
        let slice = TimeDelta::from_std(params.slice).unwrap_or(TimeDelta::MAX);
        Self {
            params,
            slice,
            source,
            encoders,
            transfers: TransferPool::new(launcher),
            clock,
            stop,
            writer: None,
            rotation_failing: false,
            frames_captured: 0,
            frames_dropped: 0,
            previews: 0,
            segments: Vec::new(),
        }
    }

    /// Captures until a stop is requested or the camera stops delivering frames, then
    /// drains, hands off the last segment and waits for every transfer it started.
    #[tracing::instrument(skip_all, fields(camera = %self.params.label))]
    #[inline]
    pub fn run(mut self) -> WorkerReport {
        info!(
            "recording {}x{} at {} fps in {}s segments",
            self.params.width,
            self.params.height,
            self.params.fps,
            self.params.slice.as_secs()
        );

        let exit = loop {
            if self.stop.is_set() {
                info!("stop requested");
                break WorkerExit::Stopped;
            }

            let now = self.clock.now();
            if self.rotation_due(now) {
                self.rotate(now);
            }

            match self.read_frame() {
                Ok(frame) => self.record(frame),
                Err(err) => {
                    warn!("camera went offline: {err}");
                    break WorkerExit::CameraOffline;
                },
            }
        };

        self.drain();

        WorkerReport {
            exit,
            frames_captured: self.frames_captured,
            frames_dropped: self.frames_dropped,
            previews: self.previews,
            segments: self.segments,
            transfers: self.transfers.stats(),
        }
    }

    fn rotation_due(&self, now: DateTime<Local>) -> bool {
        self.writer
            .as_ref()
            .is_none_or(|writer| now.signed_duration_since(writer.opened_at) > self.slice)
    }

    fn rotate(&mut self, now: DateTime<Local>) {
        if self.writer.is_some() {
            self.transfers.note_rotation();
        }
        self.close_segment();

        match self.open_segment(now) {
            Ok(writer) => {
                if self.rotation_failing {
                    info!("segment output recovered");
                    self.rotation_failing = false;
                }
                info!("opened segment {}", writer.file_name);
                self.writer = Some(writer);
            },
            Err(err) if self.rotation_failing => debug!("still cannot open a segment: {err}"),
            Err(err) => {
                error!("cannot open a new segment, frames are dropped until it succeeds: {err}");
                self.rotation_failing = true;
            },
        }
    }

    fn open_segment(&self, now: DateTime<Local>) -> Result<WriterState, SegmentError> {
        let opened = now.naive_local();
        let save_dir = day_directory(&self.params.save_root, &self.params.label, opened.date());
        std::fs::create_dir_all(&save_dir).map_err(|source| SegmentError::Directory {
            path: save_dir.clone(),
            source,
        })?;

        let temp_dir = &self.params.temp_dir;
        let file_name = unique_segment_name(&self.params.label, opened, &self.params.extension, |name| {
            temp_dir.join(name).exists() || save_dir.join(name).exists()
        });
        let temp_path = temp_dir.join(&file_name);
        let encoder = self.encoders.open(&temp_path, &self.params)?;

        Ok(WriterState {
            encoder,
            temp_path,
            destination: save_dir.join(&file_name),
            file_name,
            opened_at: now,
            frames: 0,
        })
    }

    /// Finishes the open segment, if any, and hands it to a transfer.
    fn close_segment(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        let WriterState {
            encoder,
            temp_path,
            destination,
            file_name,
            opened_at,
            frames,
        } = writer;

        if let Err(err) = encoder.finish() {
            error!("segment {file_name} did not close cleanly: {err}");
        }
        debug!("closed segment {file_name} with {frames} frames");
        self.segments.push(SegmentRecord {
            file_name: file_name.clone(),
            opened_at,
            frames,
        });

        if temp_path.is_file() {
            self.transfers.submit(TransferJob {
                source: temp_path,
                destination,
            });
        } else {
            warn!("segment {file_name} left no file to transfer");
        }
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let mut attempt = 1;
        loop {
            match self.source.read_frame() {
                Ok(frame) => return Ok(frame),
                Err(err) if attempt < self.params.read_attempts => {
                    debug!("read attempt {attempt} failed: {err}");
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }

    fn record(&mut self, mut frame: Frame) {
        let captured_at = self.clock.now();
        annotate::stamp(&mut frame, &self.params.label, &captured_at);

        if self.frames_captured % self.params.preview_every == 0 {
            match preview::write_preview(&frame, &self.params.preview_path) {
                Ok(()) => self.previews += 1,
                Err(err) => warn!("preview not updated: {err}"),
            }
        }
        self.frames_captured += 1;
        self.write(&frame);
    }

    fn write(&mut self, frame: &Frame) {
        let Some(writer) = self.writer.as_mut() else {
            self.frames_dropped += 1;
            return;
        };
        match writer.encoder.write_frame(frame) {
            Ok(()) => writer.frames += 1,
            Err(err) => {
                error!("encoder rejected frame, closing segment {}: {err}", writer.file_name);
                self.close_segment();
            },
        }
    }

    fn drain(&mut self) {
        let mut drained = 0u64;
        while self.writer.is_some() {
            let Some(mut frame) = self.source.read_buffered() else {
                break;
            };
            let captured_at = self.clock.now();
            annotate::stamp(&mut frame, &self.params.label, &captured_at);
            self.frames_captured += 1;
            self.write(&frame);
            drained += 1;
        }
        if drained > 0 {
            debug!("drained {drained} buffered frames");
        }

        self.close_segment();
        let joined = self.transfers.join_all();
        info!(
            "closed after {} frames in {} segments, {joined} transfers joined at exit",
            self.frames_captured,
            self.segments.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        path::Path,
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Arc,
            Mutex,
        },
    };

    use chrono::TimeZone;

    use super::*;
    use crate::{
        settings::{RecorderConfig, TransferMode, TransferSettings},
        transfer::{ThreadTransferLauncher, TransferError, TransferHandle, Transferer},
    };

    type Hook = Box<dyn FnMut(u64)>;

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<DateTime<Local>>>);

    impl ManualClock {
        fn starting_at(start: DateTime<Local>) -> Self {
            Self(Arc::new(Mutex::new(start)))
        }

        fn advance(&self, step: TimeDelta) {
            let mut now = self.0.lock().unwrap();
            *now += step;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Local> {
            *self.0.lock().unwrap()
        }
    }

    /// Advances the clock by one frame interval per read.
    struct FakeCamera {
        clock:    ManualClock,
        step:     TimeDelta,
        reads:    Arc<AtomicU64>,
        fail:     Box<dyn Fn(u64) -> bool>,
        on_read:  Option<Hook>,
        buffered: VecDeque<Frame>,
    }

    impl FakeCamera {
        fn new(clock: &ManualClock, fps: u32) -> Self {
            Self {
                clock:    clock.clone(),
                step:     TimeDelta::milliseconds(1000 / i64::from(fps)),
                reads:    Arc::new(AtomicU64::new(0)),
                fail:     Box::new(|_| false),
                on_read:  None,
                buffered: VecDeque::new(),
            }
        }
    }

    impl FrameSource for FakeCamera {
        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            self.clock.advance(self.step);
            if let Some(hook) = self.on_read.as_mut() {
                hook(read);
            }
            if (self.fail)(read) {
                return Err(CaptureError::Read(std::io::Error::other("unplugged")));
            }
            Ok(Frame::filled(64, 48, [30, 30, 30]))
        }

        fn read_buffered(&mut self) -> Option<Frame> {
            self.buffered.pop_front()
        }
    }

    #[derive(Default)]
    struct OpenCounter {
        open: AtomicUsize,
        peak: AtomicUsize,
    }

    struct FakeEncoders(Arc<OpenCounter>);

    struct FakeSegment {
        path:    PathBuf,
        frames:  u64,
        counter: Arc<OpenCounter>,
    }

    impl EncoderFactory for FakeEncoders {
        fn open(
            &self,
            output: &Path,
            _params: &RuntimeParams,
        ) -> Result<Box<dyn SegmentEncoder>, EncoderError> {
            std::fs::write(output, b"").map_err(EncoderError::Write)?;
            let open = self.0.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(open, Ordering::SeqCst);
            Ok(Box::new(FakeSegment {
                path:    output.to_path_buf(),
                frames:  0,
                counter: Arc::clone(&self.0),
            }))
        }
    }

    impl SegmentEncoder for FakeSegment {
        fn write_frame(&mut self, _frame: &Frame) -> Result<(), EncoderError> {
            self.frames += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<u64, EncoderError> {
            self.counter.open.fetch_sub(1, Ordering::SeqCst);
            std::fs::write(&self.path, self.frames.to_string()).map_err(EncoderError::Write)?;
            Ok(self.frames)
        }
    }

    /// Records jobs and counts joins without touching the files.
    #[derive(Clone, Default)]
    struct RecordingLauncher {
        jobs:   Arc<Mutex<Vec<TransferJob>>>,
        joined: Arc<AtomicUsize>,
    }

    struct RecordedTransfer {
        job:    TransferJob,
        joined: Arc<AtomicUsize>,
    }

    impl TransferLauncher for RecordingLauncher {
        fn launch(&self, job: TransferJob) -> Result<Box<dyn TransferHandle>, TransferError> {
            self.jobs.lock().unwrap().push(job.clone());
            Ok(Box::new(RecordedTransfer {
                job,
                joined: Arc::clone(&self.joined),
            }))
        }
    }

    impl TransferHandle for RecordedTransfer {
        fn job(&self) -> &TransferJob {
            &self.job
        }

        fn is_finished(&mut self) -> bool {
            false
        }

        fn wait(self: Box<Self>) -> bool {
            self.joined.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct Rig {
        _dir:    tempfile::TempDir,
        params:  RuntimeParams,
        clock:   ManualClock,
        stop:    StopSignal,
        counter: Arc<OpenCounter>,
    }

    fn rig(slice_seconds: u64, fps: u32, preview_seconds: u32, read_attempts: u32) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RecorderConfig::with_cameras("rack", 1, dir.path());
        config.study_label = "mice".to_owned();
        config.slice_seconds = slice_seconds;
        config.preview_interval_seconds = preview_seconds;
        config.defaults.fps = fps;
        config.defaults.width = 64;
        config.defaults.height = 48;
        config.defaults.read_attempts = read_attempts;
        let params = RuntimeParams::resolve(&config, 0).unwrap();
        prepare_directories(&params).unwrap();
        let start = Local.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).single().unwrap();

        Rig {
            _dir: dir,
            params,
            clock: ManualClock::starting_at(start),
            stop: StopSignal::local(),
            counter: Arc::default(),
        }
    }

    fn stop_after(stop: &StopSignal, reads: u64) -> Option<Hook> {
        let stop = stop.clone();
        Some(Box::new(move |read| {
            if read == reads {
                stop.set();
            }
        }))
    }

    #[test]
    fn rotation_and_preview_follow_configured_cadence() {
        let rig = rig(60, 10, 5, 1);
        let mut camera = FakeCamera::new(&rig.clock, 10);
        camera.on_read = stop_after(&rig.stop, 1250);
        let launcher = RecordingLauncher::default();

        let report = CameraWorker::new(
            rig.params.clone(),
            camera,
            FakeEncoders(Arc::clone(&rig.counter)),
            launcher.clone(),
            rig.clock.clone(),
            rig.stop.clone(),
        )
        .run();

        assert_eq!(report.exit, WorkerExit::Stopped);
        assert_eq!(report.frames_captured, 1250);
        assert_eq!(report.previews, 25);
        assert!(rig.params.preview_path.is_file());

        let frames: Vec<_> = report.segments.iter().map(|s| s.frames).collect();
        assert_eq!(frames, vec![601, 601, 48]);
        for pair in report.segments.windows(2) {
            let gap = pair[1].opened_at - pair[0].opened_at;
            assert!((gap - TimeDelta::seconds(60)).abs() <= TimeDelta::milliseconds(100));
        }
        let names: Vec<_> = report.segments.iter().map(|s| s.file_name.as_str()).collect();
        assert_eq!(names, vec![
            "mice_cam01_20240306_12-00-00.mp4",
            "mice_cam01_20240306_12-01-00.mp4",
            "mice_cam01_20240306_12-02-00.mp4",
        ]);

        let jobs = launcher.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(
            jobs[0].destination,
            rig.params.save_root.join("mice_cam01_20240306").join(names[0])
        );
        assert_eq!(jobs[2].source, rig.params.temp_dir.join(names[2]));
        assert_eq!(launcher.joined.load(Ordering::SeqCst), 3);
        assert_eq!(report.transfers.backlog_rotations, 2);
        assert_eq!(rig.counter.peak.load(Ordering::SeqCst), 1);
        assert_eq!(rig.counter.open.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn read_failure_hands_off_partial_segment_and_exits() {
        let rig = rig(2, 10, 5, 1);
        let mut camera = FakeCamera::new(&rig.clock, 10);
        // 21 + 21 frames fill the first two segments; the 37th frame of the third fails
        camera.fail = Box::new(|read| read >= 79);
        let reads = Arc::clone(&camera.reads);
        let launcher = RecordingLauncher::default();

        let report = CameraWorker::new(
            rig.params.clone(),
            camera,
            FakeEncoders(Arc::clone(&rig.counter)),
            launcher.clone(),
            rig.clock.clone(),
            rig.stop.clone(),
        )
        .run();

        assert_eq!(report.exit, WorkerExit::CameraOffline);
        assert_eq!(report.exit.code(), 3);
        let frames: Vec<_> = report.segments.iter().map(|s| s.frames).collect();
        assert_eq!(frames, vec![21, 21, 36]);
        assert_eq!(reads.load(Ordering::SeqCst), 79);
        assert_eq!(launcher.jobs.lock().unwrap().len(), 3);
        assert_eq!(launcher.joined.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn transient_read_errors_are_retried() {
        let rig = rig(60, 10, 5, 3);
        let mut camera = FakeCamera::new(&rig.clock, 10);
        camera.fail = Box::new(|read| read == 5 || read == 6);
        camera.on_read = stop_after(&rig.stop, 20);

        let report = CameraWorker::new(
            rig.params.clone(),
            camera,
            FakeEncoders(Arc::clone(&rig.counter)),
            RecordingLauncher::default(),
            rig.clock.clone(),
            rig.stop.clone(),
        )
        .run();

        assert_eq!(report.exit, WorkerExit::Stopped);
        assert_eq!(report.frames_captured, 18);
    }

    #[test]
    fn drain_writes_buffered_frames_into_last_segment() {
        let rig = rig(60, 10, 5, 1);
        let mut camera = FakeCamera::new(&rig.clock, 10);
        camera.on_read = stop_after(&rig.stop, 10);
        camera.buffered = std::iter::repeat_with(|| Frame::filled(64, 48, [0, 0, 0])).take(3).collect();

        let report = CameraWorker::new(
            rig.params.clone(),
            camera,
            FakeEncoders(Arc::clone(&rig.counter)),
            RecordingLauncher::default(),
            rig.clock.clone(),
            rig.stop.clone(),
        )
        .run();

        assert_eq!(report.segments.len(), 1);
        assert_eq!(report.segments[0].frames, 13);
    }

    #[test]
    fn unwritable_destination_drops_frames_until_it_recovers() {
        let rig = rig(60, 10, 5, 1);
        std::fs::create_dir_all(rig.params.save_root.parent().unwrap()).unwrap();
        std::fs::write(&rig.params.save_root, b"not a directory").unwrap();
        let blocker = rig.params.save_root.clone();
        let stop = rig.stop.clone();
        let mut camera = FakeCamera::new(&rig.clock, 10);
        camera.on_read = Some(Box::new(move |read| {
            if read == 4 {
                std::fs::remove_file(&blocker).unwrap();
            }
            if read == 10 {
                stop.set();
            }
        }));

        let report = CameraWorker::new(
            rig.params.clone(),
            camera,
            FakeEncoders(Arc::clone(&rig.counter)),
            RecordingLauncher::default(),
            rig.clock.clone(),
            rig.stop.clone(),
        )
        .run();

        assert_eq!(report.exit, WorkerExit::Stopped);
        assert_eq!(report.frames_dropped, 4);
        assert_eq!(report.segments.len(), 1);
        assert_eq!(report.segments[0].frames, 6);
    }

    #[test]
    fn finished_segments_reach_permanent_storage() {
        let rig = rig(1, 10, 5, 1);
        let mut camera = FakeCamera::new(&rig.clock, 10);
        camera.on_read = stop_after(&rig.stop, 25);
        let transferer = Transferer::new(
            &TransferSettings {
                mode:                TransferMode::Copy,
                retry_delay_seconds: 0,
                max_attempts:        Some(1),
            },
            Path::new("ffmpeg"),
        );

        let report = CameraWorker::new(
            rig.params.clone(),
            camera,
            FakeEncoders(Arc::clone(&rig.counter)),
            ThreadTransferLauncher::new(transferer),
            rig.clock.clone(),
            rig.stop.clone(),
        )
        .run();

        assert_eq!(report.segments.len(), 3);
        assert_eq!(report.transfers.failed, 0);
        assert_eq!(std::fs::read_dir(&rig.params.temp_dir).unwrap().count(), 0);
        let day = rig.params.save_root.join("mice_cam01_20240306");
        for segment in &report.segments {
            let stored = std::fs::read_to_string(day.join(&segment.file_name)).unwrap();
            assert_eq!(stored, segment.frames.to_string());
        }
    }
}
