//! Process signalling helpers.

use std::io;

/// Send `signal` to `pid`.
///
/// Returns `Ok(true)` if the signal was delivered and `Ok(false)` if the
/// process no longer exists (ESRCH). Any other failure, such as EPERM, is an
/// error: the process is there but we are not allowed to touch it.
pub fn signal_process(pid: u32, signal: libc::c_int) -> io::Result<bool> {
    // 0 and values that wrap to negative pids address process groups.
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        ));
    }

    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if ret == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Liveness probe using the null signal.
pub fn is_process_alive(pid: u32) -> bool {
    match signal_process(pid, 0) {
        Ok(alive) => alive,
        // EPERM: it exists, it just isn't ours.
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}
