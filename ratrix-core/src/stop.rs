//! Cooperative stop requests shared between the supervisor and its camera workers.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

const WAIT_STEP: Duration = Duration::from_millis(50);

/// Set-once "stop requested" flag shared by the supervisor and every camera worker.
///
/// Inside one process the flag is an atomic latch. Only the owning side, made with
/// [`StopSignal::create`], writes the marker file when set; worker processes holding the
/// same path through [`StopSignal::attach`] observe it on their next check. Setting an
/// attached handle stops that process alone.
#[derive(Debug, Clone)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    flag:   AtomicBool,
    marker: Option<PathBuf>,
    /// Writes the marker instead of reading it.
    owner:  bool,
}

impl StopSignal {
    /// A flag visible to this process only.
    #[inline]
    pub fn local() -> Self {
        Self::with_marker(None, false)
    }

    /// Joins a signal owned by another process through its marker file.
    #[inline]
    pub fn attach(marker: impl Into<PathBuf>) -> Self {
        Self::with_marker(Some(marker.into()), false)
    }

    /// Creates the owning side of a cross-process signal in the "not set" state,
    /// removing a marker left behind by an earlier run.
    #[inline]
    pub fn create(marker: impl Into<PathBuf>) -> std::io::Result<Self> {
        let marker = marker.into();
        match std::fs::remove_file(&marker) {
            Ok(()) => debug!("removed stale stop marker {}", marker.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => return Err(err),
        }
        Ok(Self::with_marker(Some(marker), true))
    }

    fn with_marker(marker: Option<PathBuf>, owner: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                marker,
                owner,
            }),
        }
    }

    /// Requests a stop. Returns `true` only for the call that actually set the flag.
    #[inline]
    pub fn set(&self) -> bool {
        if self.inner.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(marker) = self.inner.marker.as_ref().filter(|_| self.inner.owner) {
            if let Err(err) = std::fs::write(marker, std::process::id().to_string()) {
                warn!("failed to write stop marker {}: {err}", marker.display());
            }
        }
        true
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        if self.inner.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.marker {
            Some(marker) if !self.inner.owner && marker.exists() => {
                self.inner.flag.store(true, Ordering::SeqCst);
                true
            },
            _ => false,
        }
    }

    /// Sleeps for up to `timeout`, returning early with `true` once the flag is set.
    #[inline]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(WAIT_STEP.min(deadline - now));
        }
    }

    #[inline]
    pub fn marker(&self) -> Option<&Path> {
        self.inner.marker.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent_and_shared_between_clones() {
        let stop = StopSignal::local();
        let other = stop.clone();
        assert!(!other.is_set());

        assert!(stop.set());
        assert!(!stop.set());
        assert!(other.is_set());
    }

    #[test]
    fn marker_file_carries_the_request_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stop");
        std::fs::write(&marker, "old").unwrap();

        let owner = StopSignal::create(&marker).unwrap();
        assert!(!marker.exists());
        let worker = StopSignal::attach(&marker);
        assert!(!worker.is_set());

        assert!(owner.set());
        assert!(marker.exists());
        assert!(worker.is_set());

        // latched even if the marker disappears afterwards
        std::fs::remove_file(&marker).unwrap();
        assert!(worker.is_set());
    }

    #[test]
    fn attached_handle_stops_only_its_own_process() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stop");
        let owner = StopSignal::create(&marker).unwrap();
        let worker = StopSignal::attach(&marker);
        let sibling = StopSignal::attach(&marker);

        assert!(worker.set());
        assert!(worker.is_set());
        assert!(!marker.exists());
        assert!(!owner.is_set());
        assert!(!sibling.is_set());
    }

    #[test]
    fn wait_timeout_returns_early_once_set() {
        let stop = StopSignal::local();
        assert!(!stop.wait_timeout(Duration::from_millis(20)));

        let setter = stop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            setter.set();
        });
        let started = Instant::now();
        assert!(stop.wait_timeout(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
