use stackcopy::linux::SignalThreadDelegate;
use stackcopy::{CopiedStack, Module, ModuleCache, ProfileBuilder, RegisterContext};
use stackcopy::{StackBuffer, StackCopier, StackCopierSuspend};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const SAMPLES: usize = 200;

#[derive(Default)]
struct Histogram {
    modules: BTreeMap<PathBuf, usize>,
    bytes: usize,
}

impl ProfileBuilder for Histogram {
    fn on_stack_captured(&mut self, copied: &CopiedStack, module: &Module) {
        let name = if module.is_valid() {
            module.filename().to_path_buf()
        } else {
            PathBuf::from("<unknown>")
        };
        *self.modules.entry(name).or_default() += 1;
        self.bytes += copied.len();
    }
}

fn main() {
    env_logger::init();

    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn({
        let stop = stop.clone();
        move || {
            tx.send(SignalThreadDelegate::current().unwrap()).unwrap();
            let mut v: Vec<u64> = vec![];
            while !stop.load(Ordering::Relaxed) {
                v.push(v.len() as u64 * 7919 % 1013);
                if v.len() > 100_000 {
                    v.sort();
                    v.clear();
                }
            }
        }
    });

    let mut copier = StackCopierSuspend::new(rx.recv().unwrap(), ModuleCache::new());
    let mut buffer = StackBuffer::default();
    let mut histogram = Histogram::default();
    let mut failed = 0;
    for _ in 0..SAMPLES {
        let mut context = RegisterContext::default();
        if copier.copy_stack(&mut buffer, &mut histogram, &mut context).is_err() {
            failed += 1;
        }
        thread::sleep(Duration::from_millis(1));
    }
    stop.store(true, Ordering::Relaxed);
    worker.join().unwrap();

    println!("{} samples, {} failed", SAMPLES, failed);
    println!("average stack size: {} bytes", histogram.bytes / (SAMPLES - failed).max(1));
    for (module, count) in &histogram.modules {
        println!("{:>6} {}", count, module.display());
    }
    println!("modules seen:");
    for module in copier.module_cache().modules() {
        if module.is_valid() {
            println!("    {:#x} {:#x} {} {}", module.base_address(), module.size(), module.id(), module.filename().display());
        }
    }
}
