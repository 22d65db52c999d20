//! Process-existence probe.
//!
//! Answers "is PID n alive right now?" using the cheapest OS primitive
//! available. Ambiguous answers (permission denied, access denied) count
//! as alive: a false "alive" only delays cleanup by one sweep, a false
//! "dead" would truncate a real session.

/// Capability to check whether a process is alive.
pub trait ProcessProbe: Send + Sync + 'static {
    fn is_alive(&self, pid: u32) -> bool;
}

impl<F> ProcessProbe for F
where
    F: Fn(u32) -> bool + Send + Sync + 'static,
{
    fn is_alive(&self, pid: u32) -> bool {
        self(pid)
    }
}

/// Probe backed by the host OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        probe_pid(pid)
    }
}

#[cfg(unix)]
fn probe_pid(pid: u32) -> bool {
    // kill(2) would read it as a negative process group
    let Ok(raw) = i32::try_from(pid) else {
        return true;
    };

    // SAFETY: kill(pid, 0) probes process existence without sending a signal.
    if unsafe { libc::kill(raw, 0) } == 0 {
        return true;
    }

    // Only ESRCH proves the process is gone
    !matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(code) if code == libc::ESRCH
    )
}

#[cfg(windows)]
fn probe_pid(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_INVALID_PARAMETER,
    };
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    const STILL_ACTIVE: u32 = 259;

    // SAFETY: handle is checked for null before use and closed exactly once.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            // No such PID; anything else (access denied) is ambiguous
            return GetLastError() != ERROR_INVALID_PARAMETER;
        }

        let mut exit_code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);

        if ok == 0 {
            return true;
        }
        exit_code == STILL_ACTIVE
    }
}

#[cfg(not(any(unix, windows)))]
fn probe_pid(_pid: u32) -> bool {
    true
}
