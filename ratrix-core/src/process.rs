//! Helpers shared by the launchers of worker and transfer processes.

use std::process::Command;

/// Arranges for the child started by `command` to be killed when its parent goes away.
///
/// On Linux this is `PR_SET_PDEATHSIG(SIGKILL)`, delivered when the thread that spawned the
/// child exits, so spawn from a thread that lives as long as the process. Other platforms
/// leave `command` unchanged.
#[inline]
pub fn die_with_parent(command: &mut Command) -> &mut Command {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::process::CommandExt;

        // SAFETY: the hook only calls `prctl` and reads `errno`, both async-signal-safe, and
        // touches no memory shared with the parent.
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    command
}
