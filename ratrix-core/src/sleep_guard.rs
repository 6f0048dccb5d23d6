//! Keeps the host from suspending while cameras are recording.

use cfg_if::cfg_if;

/// Holds a platform sleep inhibition until dropped.
#[must_use = "dropping the inhibitor lets the host suspend again"]
pub struct SleepInhibitor {
    _hold: platform::Hold,
}

impl SleepInhibitor {
    /// `who` and `why` are shown by the platform's power tooling (e.g. `systemd-inhibit
    /// --list`).
    #[inline]
    pub fn acquire(who: &str, why: &str) -> anyhow::Result<Self> {
        Ok(Self {
            _hold: platform::Hold::new(who, why)?,
        })
    }
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod platform {
            use std::{fs::File, os::unix::io::FromRawFd, time::Duration};

            use dbus::{arg::OwnedFd, blocking::Connection};

            /// logind keeps the inhibition while this descriptor stays open.
            pub struct Hold {
                _fd: File,
            }

            impl Hold {
                pub fn new(who: &str, why: &str) -> anyhow::Result<Self> {
                    let connection = Connection::new_system()?;
                    let login = connection.with_proxy(
                        "org.freedesktop.login1",
                        "/org/freedesktop/login1",
                        Duration::from_secs(5),
                    );
                    let (fd,): (OwnedFd,) = login.method_call(
                        "org.freedesktop.login1.Manager",
                        "Inhibit",
                        ("sleep:idle", who, why, "block"),
                    )?;
                    let raw = fd.into_fd();
                    // SAFETY: `into_fd` released ownership of `raw` to us and it is not used
                    // again outside the `File`.
                    let fd = unsafe { File::from_raw_fd(raw) };
                    Ok(Self {
                        _fd: fd,
                    })
                }
            }
        }
    } else if #[cfg(target_os = "windows")] {
        mod platform {
            use windows_sys::Win32::System::Power::{
                SetThreadExecutionState,
                ES_CONTINUOUS,
                ES_SYSTEM_REQUIRED,
            };

            pub struct Hold;

            impl Hold {
                pub fn new(_who: &str, _why: &str) -> anyhow::Result<Self> {
                    // SAFETY: only changes the execution state of the calling thread.
                    let previous = unsafe { SetThreadExecutionState(ES_CONTINUOUS | ES_SYSTEM_REQUIRED) };
                    if previous == 0 {
                        anyhow::bail!("SetThreadExecutionState failed");
                    }
                    Ok(Self)
                }
            }

            impl Drop for Hold {
                fn drop(&mut self) {
                    // SAFETY: as above.
                    unsafe {
                        SetThreadExecutionState(ES_CONTINUOUS);
                    }
                }
            }
        }
    } else if #[cfg(target_os = "macos")] {
        mod platform {
            use std::ffi::c_void;

            use core_foundation::{base::TCFType, string::CFString};
            use libc::{c_int, c_uint};

            type AssertionId = c_uint;

            const ASSERTION_LEVEL_ON: c_uint = 255;

            #[link(name = "IOKit", kind = "framework")]
            extern "C" {
                fn IOPMAssertionCreateWithName(
                    assertion_type: *const c_void,
                    level: c_uint,
                    assertion_name: *const c_void,
                    assertion_id: *mut AssertionId,
                ) -> c_int;

                fn IOPMAssertionRelease(assertion_id: AssertionId) -> c_int;
            }

            pub struct Hold {
                id: AssertionId,
            }

            impl Hold {
                pub fn new(who: &str, why: &str) -> anyhow::Result<Self> {
                    let kind = CFString::from_static_string("PreventUserIdleSystemSleep");
                    let name = CFString::new(&format!("{who}: {why}"));
                    let mut id: AssertionId = 0;
                    // SAFETY: both strings outlive the call and `id` is a valid out pointer.
                    let status = unsafe {
                        IOPMAssertionCreateWithName(
                            kind.as_concrete_TypeRef().cast(),
                            ASSERTION_LEVEL_ON,
                            name.as_concrete_TypeRef().cast(),
                            &mut id,
                        )
                    };
                    if status != 0 {
                        anyhow::bail!("IOPMAssertionCreateWithName failed with {status}");
                    }
                    Ok(Self {
                        id,
                    })
                }
            }

            impl Drop for Hold {
                fn drop(&mut self) {
                    // SAFETY: `id` came from a successful IOPMAssertionCreateWithName.
                    unsafe {
                        IOPMAssertionRelease(self.id);
                    }
                }
            }
        }
    } else {
        mod platform {
            pub struct Hold;

            impl Hold {
                pub fn new(_who: &str, _why: &str) -> anyhow::Result<Self> {
                    anyhow::bail!("sleep inhibition is not supported on this platform")
                }
            }
        }
    }
}
