//! This crate provides the stack acquisition layer of a sampling profiler:
//! it copies the stack of another thread without cooperation from that
//! thread, and attributes code addresses to the loaded modules that own them.
//!
//! The target thread is suspended, its register context is read and its live
//! stack is copied into a pre-allocated [StackBuffer] before it is resumed.
//! While the target is suspended nothing allocates, takes a lock or logs, as
//! the target may be frozen holding any of those resources.
//!
//! Simple usage (Linux):
//! ```no_run
//! use stackcopy::linux::SignalThreadDelegate;
//! use stackcopy::{CopiedStack, Module, ModuleCache, ProfileBuilder, RegisterContext};
//! use stackcopy::{StackBuffer, StackCopier, StackCopierSuspend};
//!
//! struct Printer;
//!
//! impl ProfileBuilder for Printer {
//!     fn on_stack_captured(&mut self, copied: &CopiedStack, module: &Module) {
//!         println!("{} bytes, pc in {:?}", copied.len(), module.filename());
//!     }
//! }
//!
//! fn main() {
//!     // Created on the thread to be sampled, then sent to the profiler thread.
//!     let delegate = SignalThreadDelegate::current().unwrap();
//!
//!     let mut copier = StackCopierSuspend::new(delegate, ModuleCache::new());
//!     let mut buffer = StackBuffer::default();
//!     let mut context = RegisterContext::default();
//!     let _ = copier.copy_stack(&mut buffer, &mut Printer, &mut context);
//! }
//! ```
//!
//! For more examples, please refer to ../demos/.

mod copier;
#[cfg(target_os = "linux")]
mod dyld;
#[cfg(all(target_os = "linux", feature = "signal-suspend"))]
pub mod linux;
mod module_cache;
mod registers;
mod thread;
mod utils;

pub use copier::{CopiedStack, CopierConfig, ProfileBuilder, StackBuffer, StackCopier, StackCopierSuspend};
#[cfg(target_os = "linux")]
pub use dyld::DynamicLoaderLocator;
pub use module_cache::{Module, ModuleCache, ModuleLocator};
pub use registers::RegisterContext;
pub use thread::{StackBounds, ThreadDelegate, Window};
pub use utils::AddressRange;

/// A result type that wraps [Error].
pub type Result<T> = std::result::Result<T, Error>;

/// Error definition.
///
/// Errors are plain values so that they can be produced while the target
/// thread is suspended.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("failed to suspend the target thread")]
    SuspendFailed,

    #[error("another stack copy is in progress")]
    Busy,

    #[error("failed to read the register context of the target thread")]
    ContextUnavailable,

    #[error("stack pointer {sp:#x} is outside of the stack [{limit:#x}, {base:#x}]")]
    StackPointerOutOfBounds { sp: usize, limit: usize, base: usize },

    #[error("stack buffer of {capacity} bytes is too small")]
    BufferTooSmall { capacity: usize },

    #[error("failed to install the signal handler (errno {0})")]
    SignalHandler(i32),

    #[error("failed to query the thread stack (error {0})")]
    StackQuery(i32),
}
