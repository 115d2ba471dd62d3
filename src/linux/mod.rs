//! Signal based thread suspension for Linux.
//!
//! Linux has no API to suspend another thread, so the target is "suspended"
//! by delivering a signal to it. The handler publishes the interrupted
//! register context and spins until the profiler releases it, which keeps the
//! target frozen for the duration of the copy.

use crate::registers::RegisterContext;
use crate::thread::{StackBounds, ThreadDelegate, Window};
use crate::{Error, Result};
use lazy_static::lazy_static;
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

const IDLE: u8 = 0;
const SIGNALED: u8 = 1;
const ENTERED: u8 = 2;
const CAPTURED: u8 = 3;
const RELEASED: u8 = 4;

/// Handshake state between the profiler and the signal handler.
static STATE: AtomicU8 = AtomicU8::new(IDLE);
/// Set while a capture is in flight. Only one per process.
static BUSY: AtomicBool = AtomicBool::new(false);
/// Kernel thread id of the thread being captured.
static TARGET: AtomicI32 = AtomicI32::new(0);
static CONTEXT: ContextSlot = ContextSlot(UnsafeCell::new(None));

struct ContextSlot(UnsafeCell<Option<RegisterContext>>);

// Accesses are ordered by `STATE`: the handler writes before publishing
// CAPTURED, the profiler reads after observing it.
unsafe impl Sync for ContextSlot {}

lazy_static! {
    static ref INSTALLED: Mutex<SmallVec<[libc::c_int; 4]>> = Mutex::new(SmallVec::new());
}

/// Options for [SignalThreadDelegate].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SuspendConfig {
    /// Signal used to interrupt the target thread.
    pub signal: libc::c_int,
    /// How long to wait for the target to enter the signal handler before
    /// giving up on the suspension.
    pub timeout: Duration,
}

impl Default for SuspendConfig {
    fn default() -> Self {
        Self {
            signal: libc::SIGPROF,
            timeout: Duration::from_millis(100),
        }
    }
}

/// [ThreadDelegate] suspending a thread of the current process with a
/// signal.
///
/// The target is addressed by its kernel thread id and signalled with
/// `tgkill`, so sampling a thread that has exited fails with
/// [Error::SuspendFailed]. A delegate cannot suspend the thread it is called
/// from.
#[derive(Debug)]
pub struct SignalThreadDelegate {
    tid: libc::pid_t,
    bounds: StackBounds,
    config: SuspendConfig,
}

impl SignalThreadDelegate {
    /// Creates a delegate for the calling thread with the default config.
    pub fn current() -> Result<Self> {
        Self::current_with_config(SuspendConfig::default())
    }

    /// Creates a delegate for the calling thread. Installs the signal handler
    /// if needed and reads the stack bounds of the thread.
    ///
    /// Call it on the thread to be sampled, then hand the delegate to the
    /// sampling thread.
    pub fn current_with_config(config: SuspendConfig) -> Result<Self> {
        install_signal_handler(config.signal)?;
        let bounds = query_stack_bounds(unsafe { libc::pthread_self() })?;
        let tid = gettid();
        log::debug!("stack of thread {}: [{:#x}, {:#x})", tid, bounds.limit, bounds.base);
        Ok(Self { tid, bounds, config })
    }

    /// Kernel thread id of the target.
    #[inline]
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    #[inline]
    pub fn config(&self) -> &SuspendConfig {
        &self.config
    }

    fn release(&self) {
        BUSY.store(false, Ordering::Release);
    }
}

impl ThreadDelegate for SignalThreadDelegate {
    fn stack_bounds(&self) -> StackBounds {
        self.bounds
    }

    fn suspend(&mut self, _: &Window) -> Result<()> {
        if self.tid == gettid() {
            return Err(Error::SuspendFailed);
        }
        if BUSY
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }
        TARGET.store(self.tid, Ordering::Release);
        unsafe {
            *CONTEXT.0.get() = None;
        }
        STATE.store(SIGNALED, Ordering::Release);
        if tgkill(self.tid, self.config.signal) != 0 {
            // ESRCH once the target has exited.
            STATE.store(IDLE, Ordering::Release);
            self.release();
            return Err(Error::SuspendFailed);
        }
        let deadline = Instant::now() + self.config.timeout;
        loop {
            if STATE.load(Ordering::Acquire) == CAPTURED {
                return Ok(());
            }
            if Instant::now() >= deadline
                && STATE
                    .compare_exchange(SIGNALED, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                // The handler never started; a late signal will see IDLE and
                // return immediately.
                self.release();
                return Err(Error::SuspendFailed);
            }
            thread::yield_now();
        }
    }

    fn thread_context(&mut self, _: &Window, context: &mut RegisterContext) -> bool {
        match unsafe { *CONTEXT.0.get() } {
            Some(captured) => {
                *context = captured;
                true
            }
            None => false,
        }
    }

    fn resume(&mut self, _: &Window) {
        STATE.store(RELEASED, Ordering::Release);
        while STATE.load(Ordering::Acquire) != IDLE {
            thread::yield_now();
        }
        self.release();
    }
}

extern "C" fn signal_handler(_: libc::c_int, _: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
    if gettid() != TARGET.load(Ordering::Acquire) {
        return;
    }
    if STATE
        .compare_exchange(SIGNALED, ENTERED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    let saved_errno = errno();
    unsafe {
        *CONTEXT.0.get() = RegisterContext::from_ucontext(ucontext);
    }
    STATE.store(CAPTURED, Ordering::Release);
    while STATE.load(Ordering::Acquire) != RELEASED {
        thread::yield_now();
    }
    STATE.store(IDLE, Ordering::Release);
    set_errno(saved_errno);
}

fn install_signal_handler(signal: libc::c_int) -> Result<()> {
    let mut installed = INSTALLED.lock().unwrap_or_else(|e| e.into_inner());
    if installed.contains(&signal) {
        return Ok(());
    }
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = signal_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
            return Err(Error::SignalHandler(errno()));
        }
    }
    log::debug!("installed stack copy handler for signal {}", signal);
    installed.push(signal);
    Ok(())
}

fn query_stack_bounds(thread: libc::pthread_t) -> Result<StackBounds> {
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        let res = libc::pthread_getattr_np(thread, &mut attr);
        if res != 0 {
            return Err(Error::StackQuery(res));
        }
        let mut addr: *mut libc::c_void = ptr::null_mut();
        let mut size: libc::size_t = 0;
        let res = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if res != 0 {
            return Err(Error::StackQuery(res));
        }
        Ok(StackBounds {
            limit: addr as usize,
            base: addr as usize + size,
        })
    }
}

// Both are raw syscalls, safe to call from the signal handler.
#[inline]
fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

#[inline]
fn tgkill(tid: libc::pid_t, signal: libc::c_int) -> libc::c_long {
    unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signal) }
}

#[inline]
fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(v: libc::c_int) {
    unsafe { *libc::__errno_location() = v }
}
