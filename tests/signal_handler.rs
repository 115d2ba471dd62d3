#![cfg(all(target_os = "linux", feature = "signal-suspend"))]

mod common;

use common::RecordingBuilder;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use stackcopy::linux::{SignalThreadDelegate, SuspendConfig};
use stackcopy::{Error, ModuleCache, RegisterContext, StackBuffer, StackCopier, StackCopierSuspend};

// Only one capture may be in flight per process.
static SERIAL: Mutex<()> = Mutex::new(());

static COUNTER: AtomicU64 = AtomicU64::new(0);

struct Target {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Target {
    /// Spawns a busy thread and returns a delegate created on it.
    fn spawn(config: SuspendConfig, block_signal: bool) -> (Self, SignalThreadDelegate) {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn({
            let stop = stop.clone();
            move || {
                if block_signal {
                    let mut set = SigSet::empty();
                    set.add(Signal::SIGPROF);
                    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None).unwrap();
                }
                let delegate = SignalThreadDelegate::current_with_config(config).unwrap();
                assert_eq!(delegate.tid(), nix::unistd::gettid().as_raw());
                tx.send(delegate).unwrap();
                while !stop.load(Ordering::Relaxed) {
                    busy_work();
                }
            }
        });
        let delegate = rx.recv().unwrap();
        (
            Self {
                stop,
                handle: Some(handle),
            },
            delegate,
        )
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

#[inline(never)]
fn busy_work() {
    for _ in 0..1000 {
        COUNTER.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_copy_stack_of_running_thread() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let (target, delegate) = Target::spawn(SuspendConfig::default(), false);
    let mut copier = StackCopierSuspend::new(delegate, ModuleCache::new());
    let mut buffer = StackBuffer::default();
    let mut builder = RecordingBuilder::default();

    for _ in 0..20 {
        let mut context = RegisterContext::default();
        let copied = copier.copy_stack(&mut buffer, &mut builder, &mut context).unwrap();
        assert!(!copied.is_empty());
        assert!(!copied.truncated);
        assert_eq!(context.sp() as usize, copied.stack_bottom);
        assert_ne!(context.pc(), 0);
        let bounds = stackcopy::ThreadDelegate::stack_bounds(copier.thread_delegate());
        assert!(bounds.contains_stack_pointer(copied.original_stack_pointer));
        assert_eq!(copied.original_stack_base, bounds.base);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(builder.captured.len(), 20);
    assert_eq!(builder.thread_resumes, 20);
    assert!(builder.captured.iter().all(|(_, module)| module.is_valid()));

    // The target keeps running after being sampled.
    let before = COUNTER.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(10));
    assert!(COUNTER.load(Ordering::Relaxed) > before);
    drop(target);
}

#[test]
fn test_unresponsive_thread_times_out() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let config = SuspendConfig {
        timeout: Duration::from_millis(20),
        ..SuspendConfig::default()
    };
    let (target, delegate) = Target::spawn(config, true);
    let mut copier = StackCopierSuspend::new(delegate, ModuleCache::new());
    let mut buffer = StackBuffer::new(4096);
    buffer.as_mut_bytes().fill(0xaa);
    let mut builder = RecordingBuilder::default();

    let res = copier.copy_stack(&mut buffer, &mut builder, &mut RegisterContext::default());

    assert_eq!(res, Err(Error::SuspendFailed));
    assert_eq!(builder.thread_resumes, 0);
    assert!(buffer.as_bytes().iter().all(|b| *b == 0xaa));
    drop(target);
}

#[test]
fn test_suspend_current_thread_fails() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let delegate = SignalThreadDelegate::current().unwrap();
    let mut copier = StackCopierSuspend::new(delegate, ModuleCache::new());
    let res = copier.copy_stack(
        &mut StackBuffer::new(1024),
        &mut RecordingBuilder::default(),
        &mut RegisterContext::default(),
    );
    assert_eq!(res, Err(Error::SuspendFailed));
}

#[test]
fn test_copy_stack_of_exited_thread_fails() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let config = SuspendConfig {
        timeout: Duration::from_millis(20),
        ..SuspendConfig::default()
    };
    let delegate = thread::spawn(move || SignalThreadDelegate::current_with_config(config).unwrap())
        .join()
        .unwrap();
    let mut copier = StackCopierSuspend::new(delegate, ModuleCache::new());
    let mut buffer = StackBuffer::new(4096);
    buffer.as_mut_bytes().fill(0xaa);
    let mut builder = RecordingBuilder::default();

    for _ in 0..3 {
        let res = copier.copy_stack(&mut buffer, &mut builder, &mut RegisterContext::default());
        assert_eq!(res, Err(Error::SuspendFailed));
    }
    assert_eq!(builder.stack_copies, 0);
    assert_eq!(builder.thread_resumes, 0);
    assert!(buffer.as_bytes().iter().all(|b| *b == 0xaa));

    // A failed attempt leaves the process free for the next capture.
    let (target, delegate) = Target::spawn(SuspendConfig::default(), false);
    let mut copier = StackCopierSuspend::new(delegate, ModuleCache::new());
    assert!(copier
        .copy_stack(&mut buffer, &mut builder, &mut RegisterContext::default())
        .is_ok());
    drop(target);
}
