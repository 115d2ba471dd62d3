use crate::module_cache::Module;
use crate::registers::RegisterContext;
use crate::utils::AddressRange;
use crate::Result;
use std::slice;

mod suspend;

pub use suspend::StackCopierSuspend;

/// Copies the live stack of a thread into a [StackBuffer].
pub trait StackCopier {
    /// Captures the register context of the thread into `thread_context` and
    /// copies its stack, starting at the stack pointer, into `stack_buffer`.
    ///
    /// If the live stack is larger than the buffer only its most recent part
    /// (the lowest addresses) is copied and [CopiedStack::truncated] is set.
    /// On error the contents of `stack_buffer` and `thread_context` are
    /// unspecified.
    fn copy_stack(
        &mut self,
        stack_buffer: &mut StackBuffer,
        profile_builder: &mut dyn ProfileBuilder,
        thread_context: &mut RegisterContext,
    ) -> Result<CopiedStack>;
}

/// Receives notifications while a stack is being copied.
pub trait ProfileBuilder {
    /// Called while the target thread is suspended, right before its stack is
    /// copied. Must not allocate, lock or log.
    fn on_stack_copy(&mut self) {}

    /// Called after the target thread has been resumed, whether or not the
    /// copy succeeded.
    fn on_thread_resume(&mut self) {}

    /// Called after a successful copy with the module that owns the captured
    /// instruction pointer (an invalid module if there is none).
    fn on_stack_captured(&mut self, copied: &CopiedStack, module: &Module);
}

#[repr(C, align(16))]
#[derive(Copy, Clone)]
struct Chunk([u8; StackBuffer::ALIGNMENT]);

/// Fixed-capacity, caller-owned scratch memory receiving stack copies.
///
/// The memory is allocated once up front so that nothing needs to be
/// allocated while a thread is suspended.
pub struct StackBuffer {
    chunks: Box<[Chunk]>,
    capacity: usize,
}

impl StackBuffer {
    pub const ALIGNMENT: usize = 16;
    pub const DEFAULT_CAPACITY: usize = 512 * 1024;

    pub fn new(capacity: usize) -> Self {
        let chunks = (capacity + Self::ALIGNMENT - 1) / Self::ALIGNMENT;
        Self {
            chunks: vec![Chunk([0; Self::ALIGNMENT]); chunks].into_boxed_slice(),
            capacity,
        }
    }

    /// Capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.chunks.as_ptr() as *const u8
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.as_ptr(), self.capacity) }
    }

    #[inline]
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.chunks.as_mut_ptr() as *mut u8, self.capacity) }
    }
}

impl Default for StackBuffer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for StackBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackBuffer").field("capacity", &self.capacity).finish()
    }
}

/// Describes a stack copied into a [StackBuffer].
///
/// `stack_bottom` and `stack_top` are addresses inside the buffer: the copy
/// occupies `[stack_bottom, stack_top)` and mirrors the original range
/// `[original_stack_pointer, original_stack_pointer + len)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CopiedStack {
    pub stack_bottom: usize,
    pub stack_top: usize,
    pub original_stack_pointer: usize,
    pub original_stack_base: usize,
    pub truncated: bool,
}

impl CopiedStack {
    /// Number of bytes copied.
    #[inline]
    pub fn len(&self) -> usize {
        self.stack_top - self.stack_bottom
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The part of the original stack that was copied.
    #[inline]
    pub fn original_range(&self) -> AddressRange {
        AddressRange::new(self.original_stack_pointer, self.len())
    }

    /// Translates an address of the original stack into the copy. Returns
    /// `None` for addresses outside the copied range.
    #[inline]
    pub fn relocate(&self, address: usize) -> Option<usize> {
        if self.original_range().contains(address) {
            Some(address - self.original_stack_pointer + self.stack_bottom)
        } else {
            None
        }
    }

    /// The copied bytes.
    #[inline]
    pub fn bytes<'a>(&self, buffer: &'a StackBuffer) -> &'a [u8] {
        &buffer.as_bytes()[..self.len()]
    }
}

/// Options for [StackCopierSuspend].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CopierConfig {
    /// Relocate stack addresses found in the copy and in the captured
    /// registers so that they point into the buffer.
    pub rewrite_pointers: bool,
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self { rewrite_pointers: true }
    }
}
