//! Relocation of finished segments from temporary to permanent storage.
//!
//! Each segment is handled by its own transfer (normally a separate `ratrix transfer`
//! process). A transfer guarantees that on success the file exists at the destination and
//! no longer exists at the source; failed attempts are retried after a fixed delay.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    process::die_with_parent,
    settings::{RecorderConfig, TransferMode, TransferSettings},
};

const JOIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub source:      PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Moved { attempts: u32 },
    /// The source was already gone and the destination holds the file.
    AlreadyPresent,
}

/// Performs transfers in the calling thread.
#[derive(Debug, Clone)]
pub struct Transferer {
    mode:         TransferMode,
    ffmpeg:       PathBuf,
    retry_delay:  Duration,
    max_attempts: Option<u32>,
}

impl Transferer {
    #[inline]
    pub fn new(settings: &TransferSettings, ffmpeg: &Path) -> Self {
        Self {
            mode:         settings.mode.clone(),
            ffmpeg:       ffmpeg.to_path_buf(),
            retry_delay:  settings.retry_delay(),
            max_attempts: settings.max_attempts,
        }
    }

    #[inline]
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self::new(&config.transfer, &config.video.ffmpeg)
    }

    /// Retries failed attempts until one succeeds, or until `max_attempts` is reached when
    /// a bound is configured. A missing source is never retried.
    #[tracing::instrument(skip_all, fields(source = %job.source.display()))]
    #[inline]
    pub fn run(&self, job: &TransferJob) -> Result<TransferOutcome, TransferError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(job) {
                Ok(Attempt::Moved) => {
                    info!("moved to {} after {attempts} attempt(s)", job.destination.display());
                    return Ok(TransferOutcome::Moved {
                        attempts,
                    });
                },
                Ok(Attempt::AlreadyPresent) => {
                    info!("already present at {}", job.destination.display());
                    return Ok(TransferOutcome::AlreadyPresent);
                },
                Err(err @ TransferError::SourceMissing(_)) => return Err(err),
                Err(err) => {
                    if self.max_attempts.is_some_and(|max| attempts >= max) {
                        error!("giving up after {attempts} attempts: {err}");
                        return Err(TransferError::GaveUp {
                            attempts,
                            last: Box::new(err),
                        });
                    }
                    warn!(
                        "attempt {attempts} failed: {err}; retrying in {}s",
                        self.retry_delay.as_secs_f32()
                    );
                    thread::sleep(self.retry_delay);
                },
            }
        }
    }

    fn attempt(&self, job: &TransferJob) -> Result<Attempt, TransferError> {
        let TransferJob {
            source,
            destination,
        } = job;

        if !source.exists() {
            if destination.is_file() {
                return Ok(Attempt::AlreadyPresent);
            }
            return Err(TransferError::SourceMissing(source.clone()));
        }

        // a destination only ever appears through a rename of a complete file, so an
        // earlier attempt that failed after the rename only needs the source removed
        if !destination.is_file() {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent).map_err(|err| TransferError::Io {
                    path:   parent.to_path_buf(),
                    source: err,
                })?;
            }
            let partial = partial_path(destination);
            match &self.mode {
                TransferMode::Copy => {
                    std::fs::copy(source, &partial).map_err(|err| TransferError::Io {
                        path:   partial.clone(),
                        source: err,
                    })?;
                },
                TransferMode::Transcode {
                    encoder,
                    preset,
                    crf,
                } => self.transcode(source, &partial, encoder, preset, *crf)?,
            }
            std::fs::rename(&partial, destination).map_err(|err| TransferError::Io {
                path:   destination.clone(),
                source: err,
            })?;
        }

        if !destination.is_file() {
            return Err(TransferError::DestinationMissing(destination.clone()));
        }
        std::fs::remove_file(source).map_err(|err| TransferError::Io {
            path:   source.clone(),
            source: err,
        })?;
        Ok(Attempt::Moved)
    }

    fn transcode(
        &self,
        source: &Path,
        output: &Path,
        encoder: &str,
        preset: &str,
        crf: u8,
    ) -> Result<(), TransferError> {
        let args = compose_transcode(source, output, encoder, preset, crf);
        debug!("{} {:?}", self.ffmpeg.display(), args);
        let result = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| TransferError::Spawn {
                program: self.ffmpeg.clone(),
                source:  err,
            })?;
        if !result.status.success() {
            let _ = std::fs::remove_file(output);
            return Err(TransferError::Transcode {
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

enum Attempt {
    Moved,
    AlreadyPresent,
}

#[inline]
pub fn compose_transcode(
    source: &Path,
    output: &Path,
    encoder: &str,
    preset: &str,
    crf: u8,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-y", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(source.as_os_str().to_owned());
    args.extend(["-c:v", encoder, "-preset", preset, "-pix_fmt", "yuv420p", "-crf"].map(OsString::from));
    args.push(crf.to_string().into());
    args.push(output.as_os_str().to_owned());
    args
}

/// `{stem}.part{.ext}` beside the destination, keeping the container extension.
fn partial_path(destination: &Path) -> PathBuf {
    let stem = destination.file_stem().map(|stem| stem.to_string_lossy()).unwrap_or_default();
    let name = match destination.extension() {
        Some(ext) => format!("{stem}.part.{}", ext.to_string_lossy()),
        None => format!("{stem}.part"),
    };
    destination.with_file_name(name)
}

/// A transfer that has been started and may still be running.
pub trait TransferHandle: Send {
    fn job(&self) -> &TransferJob;

    fn is_finished(&mut self) -> bool;

    /// Blocks until the transfer ends. Returns whether it succeeded.
    fn wait(self: Box<Self>) -> bool;
}

pub trait TransferLauncher {
    fn launch(&self, job: TransferJob) -> Result<Box<dyn TransferHandle>, TransferError>;
}

/// Starts every transfer as a separate process of `program`.
#[derive(Debug, Clone)]
pub struct ProcessTransferLauncher {
    program:      PathBuf,
    leading_args: Vec<OsString>,
}

impl ProcessTransferLauncher {
    /// `leading_args` go before the `transfer` subcommand, e.g. global `--config`.
    #[inline]
    pub fn new(program: impl Into<PathBuf>, leading_args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }
}

impl TransferLauncher for ProcessTransferLauncher {
    #[inline]
    fn launch(&self, job: TransferJob) -> Result<Box<dyn TransferHandle>, TransferError> {
        let child = die_with_parent(&mut Command::new(&self.program))
            .args(&self.leading_args)
            .arg("transfer")
            .arg("--source")
            .arg(&job.source)
            .arg("--destination")
            .arg(&job.destination)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| TransferError::Spawn {
                program: self.program.clone(),
                source:  err,
            })?;
        debug!("transfer process {} started for {}", child.id(), job.source.display());
        Ok(Box::new(ProcessTransfer {
            job,
            child,
        }))
    }
}

struct ProcessTransfer {
    job:   TransferJob,
    child: Child,
}

impl TransferHandle for ProcessTransfer {
    fn job(&self) -> &TransferJob {
        &self.job
    }

    fn is_finished(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn wait(mut self: Box<Self>) -> bool {
        match self.child.wait() {
            Ok(status) => report_exit(&self.job, status),
            Err(err) => {
                error!("lost track of transfer for {}: {err}", self.job.source.display());
                false
            },
        }
    }
}

fn report_exit(job: &TransferJob, status: ExitStatus) -> bool {
    if !status.success() {
        error!("transfer of {} ended with {status}", job.source.display());
    }
    status.success()
}

/// Runs each transfer on its own thread of the current process.
#[derive(Debug, Clone)]
pub struct ThreadTransferLauncher {
    transferer: Arc<Transferer>,
}

impl ThreadTransferLauncher {
    #[inline]
    pub fn new(transferer: Transferer) -> Self {
        Self {
            transferer: Arc::new(transferer),
        }
    }
}

impl TransferLauncher for ThreadTransferLauncher {
    #[inline]
    fn launch(&self, job: TransferJob) -> Result<Box<dyn TransferHandle>, TransferError> {
        let transferer = Arc::clone(&self.transferer);
        let thread_job = job.clone();
        let handle = thread::Builder::new()
            .name("transfer".to_owned())
            .spawn(move || transferer.run(&thread_job))
            .map_err(|err| TransferError::Spawn {
                program: PathBuf::from("transfer thread"),
                source:  err,
            })?;
        Ok(Box::new(ThreadTransfer {
            job,
            handle,
        }))
    }
}

struct ThreadTransfer {
    job:    TransferJob,
    handle: JoinHandle<Result<TransferOutcome, TransferError>>,
}

impl TransferHandle for ThreadTransfer {
    fn job(&self) -> &TransferJob {
        &self.job
    }

    fn is_finished(&mut self) -> bool {
        self.handle.is_finished()
    }

    fn wait(self: Box<Self>) -> bool {
        match self.handle.join() {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                error!("transfer of {} failed: {err}", self.job.source.display());
                false
            },
            Err(_) => {
                error!("transfer thread for {} panicked", self.job.source.display());
                false
            },
        }
    }
}

/// Counters describing how transfers kept up with rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub launched:          u64,
    pub launch_failures:   u64,
    pub failed:            u64,
    /// Rotations that found earlier transfers still running.
    pub backlog_rotations: u64,
    pub peak_backlog:      usize,
}

/// Transfers started by one owner, tracked until they are joined.
pub struct TransferPool<L> {
    launcher:    L,
    outstanding: Vec<Box<dyn TransferHandle>>,
    stats:       TransferStats,
}

impl<L: TransferLauncher> TransferPool<L> {
    #[inline]
    pub fn new(launcher: L) -> Self {
        Self {
            launcher,
            outstanding: Vec::new(),
            stats: TransferStats::default(),
        }
    }

    /// Starts a transfer. A launch failure is logged and counted; the segment stays in the
    /// temporary directory, where startup recovery picks it up.
    #[inline]
    pub fn submit(&mut self, job: TransferJob) -> bool {
        let source = job.source.clone();
        match self.launcher.launch(job) {
            Ok(handle) => {
                self.outstanding.push(handle);
                self.stats.launched += 1;
                self.stats.peak_backlog = self.stats.peak_backlog.max(self.outstanding.len());
                true
            },
            Err(err) => {
                error!("could not start transfer of {}: {err}", source.display());
                self.stats.launch_failures += 1;
                false
            },
        }
    }

    /// Drops finished transfers and returns how many are still running.
    #[inline]
    pub fn prune(&mut self) -> usize {
        let mut pending = Vec::with_capacity(self.outstanding.len());
        for mut handle in std::mem::take(&mut self.outstanding) {
            if handle.is_finished() {
                self.reap(handle);
            } else {
                pending.push(handle);
            }
        }
        self.outstanding = pending;
        self.outstanding.len()
    }

    /// Called at each rotation, before the new transfer is submitted.
    #[inline]
    pub fn note_rotation(&mut self) -> usize {
        let backlog = self.prune();
        if backlog > 0 {
            self.stats.backlog_rotations += 1;
            let oldest = self.outstanding.first().map(|handle| handle.job().source.display().to_string());
            warn!(
                "{backlog} transfer(s) still running at rotation, oldest {}",
                oldest.unwrap_or_default()
            );
        }
        backlog
    }

    /// Waits for every outstanding transfer. Returns how many were joined.
    #[inline]
    pub fn join_all(&mut self) -> usize {
        let handles = std::mem::take(&mut self.outstanding);
        let joined = handles.len();
        if joined > 0 {
            info!("waiting for {joined} transfer(s)");
        }
        for handle in handles {
            self.reap(handle);
        }
        joined
    }

    /// Like [`Self::join_all`] but gives up at `deadline`. Returns how many remain.
    #[inline]
    pub fn join_until(&mut self, deadline: Instant) -> usize {
        loop {
            let remaining = self.prune();
            if remaining == 0 || Instant::now() >= deadline {
                return remaining;
            }
            thread::sleep(JOIN_POLL);
        }
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    #[inline]
    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    fn reap(&mut self, handle: Box<dyn TransferHandle>) {
        if !handle.wait() {
            self.stats.failed += 1;
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Segment {0} does not exist and was never transferred")]
    SourceMissing(PathBuf),
    #[error("Destination {0} is not a regular file after transfer")]
    DestinationMissing(PathBuf),
    #[error("I/O on {path} failed: {source}")]
    Io {
        path:   PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        source:  std::io::Error,
    },
    #[error("Transcoder exited with {status}:\n{stderr}")]
    Transcode { status: ExitStatus, stderr: String },
    #[error("Transfer abandoned after {attempts} attempts: {last}")]
    GaveUp {
        attempts: u32,
        last:     Box<TransferError>,
    },
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    fn copier() -> Transferer {
        Transferer {
            mode:         TransferMode::Copy,
            ffmpeg:       PathBuf::from("ffmpeg"),
            retry_delay:  Duration::from_millis(10),
            max_attempts: None,
        }
    }

    fn job(dir: &Path, name: &str) -> TransferJob {
        TransferJob {
            source:      dir.join("temp").join(name),
            destination: dir.join("save").join("day").join(name),
        }
    }

    #[test]
    fn copy_moves_file_and_creates_destination_directory() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), "a.mp4");
        std::fs::create_dir_all(job.source.parent().unwrap()).unwrap();
        std::fs::write(&job.source, b"segment bytes").unwrap();

        let outcome = copier().run(&job).unwrap();

        assert_eq!(outcome, TransferOutcome::Moved {
            attempts: 1,
        });
        assert!(!job.source.exists());
        assert_eq!(std::fs::read(&job.destination).unwrap(), b"segment bytes");
        let leftovers: Vec<_> = std::fs::read_dir(job.destination.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "partial file left behind");
    }

    #[test]
    fn missing_source_with_destination_counts_as_done() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), "b.mp4");
        std::fs::create_dir_all(job.destination.parent().unwrap()).unwrap();
        std::fs::write(&job.destination, b"done").unwrap();

        assert_eq!(copier().run(&job).unwrap(), TransferOutcome::AlreadyPresent);
    }

    #[test]
    fn missing_source_without_destination_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), "c.mp4");
        let mut transferer = copier();
        transferer.retry_delay = Duration::from_secs(3600);

        assert!(matches!(transferer.run(&job), Err(TransferError::SourceMissing(_))));
    }

    #[test]
    fn failed_attempts_are_retried_until_the_copy_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), "d.mp4");
        std::fs::create_dir_all(job.source.parent().unwrap()).unwrap();
        std::fs::write(&job.source, b"payload").unwrap();
        // a regular file where the day directory should be blocks the first attempts
        let blocker = job.destination.parent().unwrap().to_path_buf();
        std::fs::create_dir_all(blocker.parent().unwrap()).unwrap();
        std::fs::write(&blocker, b"in the way").unwrap();

        let unblock = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            std::fs::remove_file(&blocker).unwrap();
        });
        let outcome = copier().run(&job).unwrap();
        unblock.join().unwrap();

        assert!(matches!(outcome, TransferOutcome::Moved { attempts } if attempts > 1));
        assert!(!job.source.exists());
        assert!(job.destination.is_file());
    }

    #[test]
    fn bounded_retry_gives_up_and_keeps_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), "e.mp4");
        std::fs::create_dir_all(job.source.parent().unwrap()).unwrap();
        std::fs::write(&job.source, b"payload").unwrap();
        std::fs::create_dir_all(dir.path().join("save")).unwrap();
        std::fs::write(dir.path().join("save").join("day"), b"in the way").unwrap();
        let mut transferer = copier();
        transferer.max_attempts = Some(3);

        let result = transferer.run(&job);

        assert!(matches!(result, Err(TransferError::GaveUp {
            attempts: 3,
            ..
        })));
        assert!(job.source.is_file());
    }

    #[test]
    fn transcode_command_matches_archive_settings() {
        let args = compose_transcode(Path::new("in.mp4"), Path::new("out.part.mp4"), "libx264", "slow", 28);
        let args: Vec<_> = args.iter().map(|arg| arg.to_string_lossy().into_owned()).collect();
        assert_eq!(args.join(" "), "-hide_banner -loglevel error -nostdin -y -i in.mp4 -c:v libx264 -preset slow -pix_fmt yuv420p -crf 28 out.part.mp4");
        assert_eq!(partial_path(Path::new("/v/a.mp4")), PathBuf::from("/v/a.part.mp4"));
    }

    struct Scripted {
        finished: Arc<AtomicUsize>,
        job:      TransferJob,
        id:       usize,
    }

    impl TransferHandle for Scripted {
        fn job(&self) -> &TransferJob {
            &self.job
        }

        fn is_finished(&mut self) -> bool {
            self.finished.load(Ordering::SeqCst) > self.id
        }

        fn wait(self: Box<Self>) -> bool {
            true
        }
    }

    struct ScriptedLauncher {
        finished: Arc<AtomicUsize>,
        launched: Mutex<usize>,
    }

    impl TransferLauncher for ScriptedLauncher {
        fn launch(&self, job: TransferJob) -> Result<Box<dyn TransferHandle>, TransferError> {
            let mut launched = self.launched.lock().unwrap();
            let id = *launched;
            *launched += 1;
            Ok(Box::new(Scripted {
                finished: Arc::clone(&self.finished),
                job,
                id,
            }))
        }
    }

    #[test]
    fn pool_records_backlog_at_rotation() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut pool = TransferPool::new(ScriptedLauncher {
            finished: Arc::clone(&finished),
            launched: Mutex::new(0),
        });
        let dir = Path::new("/tmp");

        assert_eq!(pool.note_rotation(), 0);
        pool.submit(job(dir, "1.mp4"));
        assert_eq!(pool.note_rotation(), 1);
        pool.submit(job(dir, "2.mp4"));
        finished.store(1, Ordering::SeqCst);
        assert_eq!(pool.note_rotation(), 1);
        pool.submit(job(dir, "3.mp4"));

        let stats = pool.stats();
        assert_eq!(stats.launched, 3);
        assert_eq!(stats.backlog_rotations, 2);
        assert_eq!(stats.peak_backlog, 2);
        assert_eq!(pool.join_all(), 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn thread_launcher_runs_real_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = TransferPool::new(ThreadTransferLauncher::new(copier()));
        let jobs: Vec<_> = ["x.mp4", "y.mp4"].iter().map(|name| job(dir.path(), name)).collect();
        for job in &jobs {
            std::fs::create_dir_all(job.source.parent().unwrap()).unwrap();
            std::fs::write(&job.source, job.source.to_string_lossy().as_bytes()).unwrap();
            pool.submit(job.clone());
        }

        assert_eq!(pool.join_until(Instant::now() + Duration::from_secs(30)), 0);
        for job in &jobs {
            assert!(!job.source.exists());
            assert!(job.destination.is_file());
        }
        assert_eq!(pool.stats().failed, 0);
    }
}
