use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

/// Shutdown flag shared with long-running commands. Set on the first
/// SIGINT/SIGTERM; commands finish their current domain and save progress.
pub(crate) static SHUTDOWN: LazyLock<Arc<AtomicBool>> =
    LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Handle passed to core commands.
pub(crate) fn shutdown_flag() -> Arc<AtomicBool> {
    Arc::clone(&SHUTDOWN)
}

/// Install signal handlers for cooperative shutdown.
///
/// First signal sets [`SHUTDOWN`] and restores the default handler so a
/// second signal terminates immediately.
pub(crate) fn install_signal_handlers() {
    // The handler must never run the initializer.
    LazyLock::force(&SHUTDOWN);

    #[cfg(unix)]
    {
        // Safety: signal handler only sets an atomic bool and restores default handler.
        unsafe {
            libc::signal(
                libc::SIGTERM,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGINT,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
        }
    }

    #[cfg(windows)]
    {
        unsafe {
            windows_sys::Win32::System::Console::SetConsoleCtrlHandler(
                Some(windows_console_handler),
                1,
            );
        }
    }
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

#[cfg(windows)]
unsafe extern "system" fn windows_console_handler(ctrl_type: u32) -> i32 {
    // CTRL_C_EVENT, CTRL_BREAK_EVENT, CTRL_CLOSE_EVENT
    if ctrl_type <= 2 {
        SHUTDOWN.store(true, Ordering::SeqCst);
        windows_sys::Win32::System::Console::SetConsoleCtrlHandler(
            Some(windows_console_handler),
            0,
        );
        return 1;
    }
    0
}

pub(crate) fn interrupted() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
