use crate::Address;

/// What the tracer needs from the instrumentation facility it runs under
pub trait Host: Send + Sync {
    /// Process id of the traced target
    fn pid(&self) -> u32;

    /// The host's own image lookup, consulted when no image recorded through
    /// `on_image_loaded` owns `address`
    fn module_name_at(&self, _address: Address) -> Option<String> {
        None
    }

    /// Kill the traced target. Called once, after the logs are closed.
    fn terminate(&self, exit_code: i32);
}

/// The tracer is loaded into the target itself, so the target is simply the
/// current process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessHost;

impl Host for ProcessHost {
    fn pid(&self) -> u32 {
        // SAFETY: getpid() has no preconditions and cannot fail
        unsafe { libc::getpid() as u32 }
    }

    fn terminate(&self, exit_code: i32) {
        log::error!("terminating traced process with exit code {exit_code:#x}");
        // SAFETY: the logs are closed by now and atexit handlers must not run
        // in a faulted target
        unsafe { libc::_exit(exit_code) }
    }
}
