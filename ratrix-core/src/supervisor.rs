//! Launches one worker process per camera, restarts the ones that die and coordinates
//! shutdown of the whole rack.

use std::{
    collections::{HashMap, HashSet},
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

use crate::{
    capture::DeviceProbe,
    preview,
    process::die_with_parent,
    settings::{CameraConfig, RecorderConfig},
    stop::StopSignal,
};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Exited(i32),
    /// Ended without an exit code, e.g. by a signal.
    Terminated,
    /// The exit status could not be collected.
    Lost,
}

impl fmt::Display for WorkerStatus {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Terminated => f.write_str("termination by signal"),
            Self::Lost => f.write_str("unknown status"),
        }
    }
}

/// A running camera worker as seen by the supervisor.
pub trait WorkerProcess {
    fn id(&self) -> u32;

    /// `Some` once the worker has exited. Never blocks.
    fn poll_exit(&mut self) -> Option<WorkerStatus>;

    /// Terminates the worker forcibly and reaps it.
    fn kill(&mut self) -> std::io::Result<()>;
}

pub trait WorkerLauncher {
    type Process: WorkerProcess;

    fn spawn(&self, slot: usize, camera: &CameraConfig) -> std::io::Result<Self::Process>;
}

/// Follows the processes started by camera workers (transfers and their transcoders) so
/// shutdown can wait for them and kill what is left.
pub trait DescendantTracker {
    /// Adds live descendants of `roots` to the tracked set, forgets processes that ended,
    /// and returns how many tracked processes are still alive.
    fn observe(&mut self, roots: &[u32]) -> usize;

    /// Kills every tracked process that is still alive. Returns how many were signalled.
    fn kill_remaining(&mut self) -> usize;
}

/// Starts workers by re-running `program` with the `camera` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessWorkerLauncher {
    program:      PathBuf,
    leading_args: Vec<OsString>,
    stop_marker:  PathBuf,
}

impl ProcessWorkerLauncher {
    #[inline]
    pub fn new(
        program: impl Into<PathBuf>,
        leading_args: Vec<OsString>,
        stop_marker: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            leading_args,
            stop_marker: stop_marker.into(),
        }
    }
}

impl WorkerLauncher for ProcessWorkerLauncher {
    type Process = ChildWorker;

    #[inline]
    fn spawn(&self, slot: usize, camera: &CameraConfig) -> std::io::Result<ChildWorker> {
        debug!("launching worker for {} on /dev/video{}", camera.name, camera.device);
        let child = die_with_parent(&mut Command::new(&self.program))
            .args(&self.leading_args)
            .arg("camera")
            .arg("--index")
            .arg(slot.to_string())
            .arg("--stop-file")
            .arg(&self.stop_marker)
            .stdin(Stdio::null())
            .spawn()?;
        Ok(ChildWorker(child))
    }
}

#[derive(Debug)]
pub struct ChildWorker(Child);

impl WorkerProcess for ChildWorker {
    #[inline]
    fn id(&self) -> u32 {
        self.0.id()
    }

    #[inline]
    fn poll_exit(&mut self) -> Option<WorkerStatus> {
        match self.0.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => Some(status.code().map_or(WorkerStatus::Terminated, WorkerStatus::Exited)),
            Err(err) => {
                warn!("cannot query worker {}: {err}", self.0.id());
                Some(WorkerStatus::Lost)
            },
        }
    }

    #[inline]
    fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill()?;
        self.0.wait().map(|_| ())
    }
}

/// Descendant tracking through the host process table.
pub struct SysinfoTracker {
    system:  System,
    /// pid -> start time, so a recycled pid is never mistaken for a tracked process
    tracked: HashMap<Pid, u64>,
}

impl Default for SysinfoTracker {
    #[inline]
    fn default() -> Self {
        Self {
            system:  System::new(),
            tracked: HashMap::new(),
        }
    }
}

impl SysinfoTracker {
    fn is_tracked_alive(&self, pid: Pid, started: u64) -> bool {
        self.system.process(pid).is_some_and(|process| {
            process.start_time() == started && !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
        })
    }
}

impl DescendantTracker for SysinfoTracker {
    #[inline]
    fn observe(&mut self, roots: &[u32]) -> usize {
        self.system.refresh_processes(ProcessesToUpdate::All, true);

        let mut parents: HashSet<Pid> = roots.iter().copied().map(Pid::from_u32).collect();
        parents.extend(self.tracked.keys().copied());
        loop {
            let found: Vec<(Pid, u64)> = self
                .system
                .processes()
                .iter()
                .filter(|&(pid, process)| {
                    !parents.contains(pid) && process.parent().is_some_and(|parent| parents.contains(&parent))
                })
                .map(|(pid, process)| (*pid, process.start_time()))
                .collect();
            if found.is_empty() {
                break;
            }
            for (pid, started) in found {
                parents.insert(pid);
                self.tracked.entry(pid).or_insert(started);
            }
        }

        let tracked = std::mem::take(&mut self.tracked);
        self.tracked = tracked
            .into_iter()
            .filter(|&(pid, started)| self.is_tracked_alive(pid, started))
            .collect();
        self.tracked.len()
    }

    #[inline]
    fn kill_remaining(&mut self) -> usize {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let mut killed = 0;
        for (&pid, &started) in &self.tracked {
            if !self.is_tracked_alive(pid, started) {
                continue;
            }
            if self.system.process(pid).is_some_and(|process| process.kill()) {
                warn!("killed leftover process {pid}");
                killed += 1;
            }
        }
        self.tracked.clear();
        killed
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub poll_interval:       Duration,
    pub spawn_stagger:       Duration,
    pub require_all_devices: bool,
    pub placeholder:         PathBuf,
}

impl SupervisorOptions {
    #[inline]
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            poll_interval:       config.supervisor.poll_interval(),
            spawn_stagger:       config.supervisor.spawn_stagger(),
            require_all_devices: config.supervisor.require_all_devices,
            placeholder:         config.paths.offline_image.clone(),
        }
    }
}

/// What one poll tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub live:         usize,
    pub went_offline: usize,
    pub spawned:      usize,
    pub spawn_failed: usize,
    /// Spawns postponed because too few capture devices were attached.
    pub deferred:     usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub workers_exited:     usize,
    pub workers_killed:     usize,
    pub descendants_killed: usize,
}

impl ShutdownReport {
    #[inline]
    pub const fn is_clean(&self) -> bool {
        self.workers_killed == 0 && self.descendants_killed == 0
    }
}

struct CameraSlot<P> {
    camera:  CameraConfig,
    preview: PathBuf,
    process: Option<P>,
    /// Liveness as of the previous poll.
    live:    bool,
    spawns:  u32,
}

pub struct Supervisor<L: WorkerLauncher, D, T> {
    slots:    Vec<CameraSlot<L::Process>>,
    launcher: L,
    probe:    D,
    tracker:  T,
    stop:     StopSignal,
    options:  SupervisorOptions,

    /// Device count behind the last gating message, so it is logged once per change.
    reported_devices: Option<usize>,
    probe_failed:     bool,
}

impl<L, D, T> Supervisor<L, D, T>
where
    L: WorkerLauncher,
    D: DeviceProbe,
    T: DescendantTracker,
{
    #[inline]
    pub fn new(
        config: &RecorderConfig,
        launcher: L,
        probe: D,
        tracker: T,
        stop: StopSignal,
    ) -> Self {
        let slots = config
            .cameras
            .iter()
            .map(|camera| CameraSlot {
                camera:  camera.clone(),
                preview: preview::preview_path(&config.paths.stills_root, &camera.name),
                process: None,
                live:    false,
                spawns:  0,
            })
            .collect();

        Self {
            slots,
            launcher,
            probe,
            tracker,
            stop,
            options: SupervisorOptions::from_config(config),
            reported_devices: None,
            probe_failed: false,
        }
    }

    #[inline]
    pub fn with_options(mut self, options: SupervisorOptions) -> Self {
        self.options = options;
        self
    }

    #[inline]
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Sets the shared stop flag. Safe to call any number of times.
    #[inline]
    pub fn request_stop(&self) {
        if self.stop.set() {
            info!("stop requested for all cameras");
        }
    }

    /// Liveness of every slot as of the last poll, in configuration order.
    #[inline]
    pub fn liveness(&self) -> Vec<bool> {
        self.slots.iter().map(|slot| slot.live).collect()
    }

    #[inline]
    pub fn restarts(&self, slot: usize) -> u32 {
        self.slots.get(slot).map_or(0, |slot| slot.spawns.saturating_sub(1))
    }

    /// Shows every camera as offline and polls until a stop is requested.
    #[inline]
    pub fn run(&mut self) {
        info!("supervising {} camera(s)", self.slots.len());
        for slot in &self.slots {
            self.show_offline(slot);
        }
        while !self.stop.is_set() {
            self.poll();
            if self.stop.wait_timeout(self.options.poll_interval) {
                break;
            }
        }
        info!("leaving supervision loop");
    }

    /// One liveness sample followed by restart attempts for every dead worker.
    #[inline]
    pub fn poll(&mut self) -> PollSummary {
        let mut summary = PollSummary::default();

        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            let alive = match slot.process.as_mut() {
                None => false,
                Some(process) => match process.poll_exit() {
                    None => true,
                    Some(status) => {
                        warn!("{} worker {} ended with {status}", slot.camera.name, process.id());
                        slot.process = None;
                        false
                    },
                },
            };
            let was_live = std::mem::replace(&mut slot.live, alive);
            if was_live && !alive {
                summary.went_offline += 1;
                self.show_offline(&self.slots[index]);
            }
            if alive {
                summary.live += 1;
            }
        }

        let roots = self.worker_ids();
        self.tracker.observe(&roots);

        let dead: Vec<usize> = (0..self.slots.len()).filter(|&i| self.slots[i].process.is_none()).collect();
        if dead.is_empty() || self.stop.is_set() {
            return summary;
        }
        if !self.enough_devices() {
            summary.deferred = dead.len();
            return summary;
        }

        for (attempt, index) in dead.into_iter().enumerate() {
            if attempt > 0 && self.stop.wait_timeout(self.options.spawn_stagger) {
                break;
            }
            if self.stop.is_set() {
                break;
            }
            let slot = &self.slots[index];
            match self.launcher.spawn(index, &slot.camera) {
                Ok(process) => {
                    let slot = &mut self.slots[index];
                    info!("{} worker started as process {}", slot.camera.name, process.id());
                    slot.process = Some(process);
                    slot.spawns += 1;
                    // a worker that dies before the next poll still gets the placeholder
                    slot.live = true;
                    summary.spawned += 1;
                },
                Err(err) => {
                    error!("{} worker could not be started: {err}", slot.camera.name);
                    self.show_offline(slot);
                    summary.spawn_failed += 1;
                },
            }
        }

        summary
    }

    fn enough_devices(&mut self) -> bool {
        if !self.options.require_all_devices {
            return true;
        }
        let wanted = self.slots.len();
        let attached = match self.probe.count_devices() {
            Ok(attached) => attached,
            Err(err) => {
                if !self.probe_failed {
                    warn!("device count unavailable, not holding restarts: {err}");
                    self.probe_failed = true;
                }
                return true;
            },
        };
        self.probe_failed = false;

        if self.reported_devices != Some(attached) {
            if attached < wanted {
                warn!("{attached} of {wanted} capture devices attached, holding restarts");
            } else if self.reported_devices.is_some() {
                info!("{attached} capture devices attached, resuming restarts");
            }
            self.reported_devices = Some(attached);
        }
        attached >= wanted
    }

    /// Requests a stop, waits up to `timeout` for every worker and the processes they
    /// started to end, then kills whatever is left.
    #[inline]
    pub fn shutdown(&mut self, timeout: Duration) -> ShutdownReport {
        self.request_stop();
        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        loop {
            for slot in &mut self.slots {
                let Some(process) = slot.process.as_mut() else {
                    continue;
                };
                if let Some(status) = process.poll_exit() {
                    info!("{} worker {} ended with {status}", slot.camera.name, process.id());
                    slot.process = None;
                    report.workers_exited += 1;
                }
            }

            let roots = self.worker_ids();
            let descendants = self.tracker.observe(&roots);
            if roots.is_empty() && descendants == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} worker(s) and {descendants} helper process(es) still running after {}s",
                    roots.len(),
                    timeout.as_secs()
                );
                break;
            }
            thread::sleep(SHUTDOWN_POLL);
        }

        for slot in &mut self.slots {
            if let Some(mut process) = slot.process.take() {
                warn!("killing {} worker {}", slot.camera.name, process.id());
                if let Err(err) = process.kill() {
                    error!("could not kill {} worker: {err}", slot.camera.name);
                }
                report.workers_killed += 1;
            }
        }
        report.descendants_killed = self.tracker.kill_remaining();

        for slot in &mut self.slots {
            slot.live = false;
        }
        for slot in &self.slots {
            self.show_offline(slot);
        }
        report
    }

    fn worker_ids(&self) -> Vec<u32> {
        self.slots.iter().filter_map(|slot| slot.process.as_ref().map(WorkerProcess::id)).collect()
    }

    fn show_offline(&self, slot: &CameraSlot<L::Process>) {
        if let Err(err) = preview::show_offline(&self.options.placeholder, &slot.preview) {
            warn!("{}: offline placeholder not shown: {err}", slot.camera.name);
        }
    }
}

/// Path of the cross-process stop marker inside the temporary root.
#[inline]
pub fn stop_marker_path(temp_root: &Path) -> PathBuf {
    temp_root.join(".ratrix-stop")
}
