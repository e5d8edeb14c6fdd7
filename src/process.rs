//! Process identity and liveness
//!
//! The spinlock and the shared-memory header record owners by process id.
//! Whether such an owner still exists is answered by a [`Liveness`]
//! implementation so tests can declare arbitrary pids dead.

use rustix::io::Errno;
use rustix::process::{getpid, test_kill_process, Pid};

/// Answers whether a process id still refers to a running process
pub trait Liveness: Send + Sync {
    fn is_process_alive(&self, pid: u64) -> bool;
}

/// Liveness backed by `kill(pid, 0)`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLiveness;

impl Liveness for SystemLiveness {
    fn is_process_alive(&self, pid: u64) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        let Some(pid) = Pid::from_raw(raw) else {
            return false;
        };

        match test_kill_process(pid) {
            Ok(()) => true,
            // Exists, but belongs to someone we cannot signal
            Err(Errno::PERM) => true,
            Err(_) => false,
        }
    }
}

impl<L: Liveness + ?Sized> Liveness for &L {
    fn is_process_alive(&self, pid: u64) -> bool {
        (**self).is_process_alive(pid)
    }
}

/// Id of the calling process
#[inline]
pub fn current_process_id() -> u64 {
    getpid().as_raw_nonzero().get() as u64
}

/// Kernel thread id of the calling thread
#[cfg(any(target_os = "linux", target_os = "android"))]
#[inline]
pub fn current_thread_id() -> u64 {
    rustix::thread::gettid().as_raw_nonzero().get() as u64
}

/// Kernel thread id of the calling thread
#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[inline]
pub fn current_thread_id() -> u64 {
    // pthread_t is the only portable per-thread id outside Linux
    unsafe { libc::pthread_self() as u64 }
}

/// Node name of this host, used in registrations
pub fn hostname() -> String {
    rustix::system::uname()
        .nodename()
        .to_string_lossy()
        .into_owned()
}
