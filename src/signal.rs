//! Platform specific process signalling.

/// Requests a graceful shutdown of `child`, the equivalent of pressing `Ctrl+C` in its terminal.
///
/// Backing services trap this, flush their state and exit. A child that is gone already is not
/// an error.
///
/// Uses `SIGINT` on unix and `CTRL_C_EVENT` on windows. Panics on other platforms.
pub(crate) fn send_interrupt(child: &tokio::process::Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(std::io::Error::from(errno)),
        }
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::CTRL_C_EVENT;
        use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;

        let success = unsafe { GenerateConsoleCtrlEvent(CTRL_C_EVENT, pid) };
        if success == 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(all(not(windows), not(unix)))]
    {
        panic!("Cannot send interrupt signal to process. Platform is unsupported.")
    }
}

/// Kills `child` (`SIGKILL` / `TerminateProcess`) without waiting for it.
pub(crate) fn send_kill(child: &mut tokio::process::Child) -> std::io::Result<()> {
    match child.start_kill() {
        Ok(()) => Ok(()),
        // Already reaped, nothing left to kill.
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err),
    }
}
