use crate::copier::{CopiedStack, CopierConfig, ProfileBuilder, StackBuffer, StackCopier};
use crate::module_cache::ModuleCache;
use crate::registers::RegisterContext;
use crate::thread::{StackBounds, ThreadDelegate, Window};
use crate::{Error, Result};
use std::mem;
use std::ptr;

const WORD: usize = mem::size_of::<usize>();

/// Copies the stack of a thread that is explicitly suspended from the
/// profiler thread.
///
/// Each call suspends the target, reads its register context, copies the live
/// stack into the caller's buffer and resumes it. Nothing between suspend and
/// resume allocates, takes a lock or logs: the target may be frozen while
/// holding the allocator or loader lock. Module attribution of the captured
/// instruction pointer happens after the target has been resumed.
pub struct StackCopierSuspend<D: ThreadDelegate> {
    thread_delegate: D,
    module_cache: ModuleCache,
    config: CopierConfig,
}

impl<D: ThreadDelegate> StackCopierSuspend<D> {
    pub fn new(thread_delegate: D, module_cache: ModuleCache) -> Self {
        Self::with_config(thread_delegate, module_cache, CopierConfig::default())
    }

    pub fn with_config(thread_delegate: D, module_cache: ModuleCache, config: CopierConfig) -> Self {
        Self {
            thread_delegate,
            module_cache,
            config,
        }
    }

    #[inline]
    pub fn thread_delegate(&self) -> &D {
        &self.thread_delegate
    }

    #[inline]
    pub fn module_cache(&self) -> &ModuleCache {
        &self.module_cache
    }

    #[inline]
    pub fn module_cache_mut(&mut self) -> &mut ModuleCache {
        &mut self.module_cache
    }

    #[inline]
    pub fn into_inner(self) -> (D, ModuleCache) {
        (self.thread_delegate, self.module_cache)
    }
}

impl<D: ThreadDelegate> StackCopier for StackCopierSuspend<D> {
    fn copy_stack(
        &mut self,
        stack_buffer: &mut StackBuffer,
        profile_builder: &mut dyn ProfileBuilder,
        thread_context: &mut RegisterContext,
    ) -> Result<CopiedStack> {
        let mut thread = match SuspendedThread::new(&mut self.thread_delegate) {
            Ok(thread) => thread,
            Err(err) => {
                log::debug!("failed to suspend target thread: {}", err);
                return Err(err);
            }
        };
        let result = copy_while_suspended(&mut thread, stack_buffer, profile_builder, thread_context);
        drop(thread);
        profile_builder.on_thread_resume();

        let copied = match result {
            Ok(copied) => copied,
            Err(err) => {
                log::debug!("discarding stack copy: {}", err);
                return Err(err);
            }
        };
        if self.config.rewrite_pointers {
            rewrite_stack_pointers(stack_buffer, &copied);
            rewrite_registers(thread_context, &copied);
        }
        let module = self.module_cache.module_for_address(thread_context.pc() as usize);
        log::trace!(
            "copied {} stack bytes from {:#x} (truncated: {}), pc {:#x} in {:?}",
            copied.len(),
            copied.original_stack_pointer,
            copied.truncated,
            thread_context.pc(),
            module.filename()
        );
        profile_builder.on_stack_captured(&copied, &module);
        Ok(copied)
    }
}

/// The suspend window. Creating it suspends the target; dropping it resumes
/// the target, so every exit path after a successful suspend resumes exactly
/// once.
struct SuspendedThread<'a, D: ThreadDelegate + ?Sized> {
    delegate: &'a mut D,
    window: Window,
}

impl<'a, D: ThreadDelegate + ?Sized> SuspendedThread<'a, D> {
    fn new(delegate: &'a mut D) -> Result<Self> {
        let window = Window::new();
        delegate.suspend(&window)?;
        Ok(Self { delegate, window })
    }

    #[inline]
    fn thread_context(&mut self, context: &mut RegisterContext) -> Result<()> {
        if self.delegate.thread_context(&self.window, context) {
            Ok(())
        } else {
            Err(Error::ContextUnavailable)
        }
    }

    #[inline]
    fn stack_bounds(&self) -> StackBounds {
        self.delegate.stack_bounds()
    }

    /// # Safety
    ///
    /// `[sp, sp + dst.len())` must be readable memory of the suspended stack.
    #[inline]
    unsafe fn copy_stack(&self, sp: usize, dst: &mut [u8]) {
        ptr::copy_nonoverlapping(sp as *const u8, dst.as_mut_ptr(), dst.len());
    }
}

impl<D: ThreadDelegate + ?Sized> Drop for SuspendedThread<'_, D> {
    fn drop(&mut self) {
        self.delegate.resume(&self.window);
    }
}

/// Runs inside the suspend window: no allocation, no locks, no logging.
fn copy_while_suspended<D: ThreadDelegate + ?Sized>(
    thread: &mut SuspendedThread<'_, D>,
    stack_buffer: &mut StackBuffer,
    profile_builder: &mut dyn ProfileBuilder,
    thread_context: &mut RegisterContext,
) -> Result<CopiedStack> {
    thread.thread_context(thread_context)?;
    let bounds = thread.stack_bounds();
    let sp = thread_context.sp() as usize;
    if !bounds.contains_stack_pointer(sp) {
        return Err(Error::StackPointerOutOfBounds {
            sp,
            limit: bounds.limit,
            base: bounds.base,
        });
    }
    let capacity = stack_buffer.capacity();
    if capacity < WORD {
        return Err(Error::BufferTooSmall { capacity });
    }
    let live = bounds.base - sp;
    let len = live.min(capacity);
    profile_builder.on_stack_copy();
    unsafe {
        thread.copy_stack(sp, &mut stack_buffer.as_mut_bytes()[..len]);
    }
    let stack_bottom = stack_buffer.as_ptr() as usize;
    Ok(CopiedStack {
        stack_bottom,
        stack_top: stack_bottom + len,
        original_stack_pointer: sp,
        original_stack_base: bounds.base,
        truncated: len < live,
    })
}

/// Relocates every word-aligned slot of the copy holding an address inside
/// the copied part of the original stack.
fn rewrite_stack_pointers(stack_buffer: &mut StackBuffer, copied: &CopiedStack) {
    let bytes = &mut stack_buffer.as_mut_bytes()[..copied.len()];
    // Alignment is relative to the original addresses.
    let mut offset = (WORD - copied.original_stack_pointer % WORD) % WORD;
    while offset + WORD <= bytes.len() {
        let slot = &mut bytes[offset..offset + WORD];
        let mut word = [0u8; WORD];
        word.copy_from_slice(slot);
        if let Some(v) = copied.relocate(usize::from_ne_bytes(word)) {
            slot.copy_from_slice(&v.to_ne_bytes());
        }
        offset += WORD;
    }
}

fn rewrite_registers(thread_context: &mut RegisterContext, copied: &CopiedStack) {
    for reg in thread_context.registers_to_rewrite() {
        if let Some(v) = copied.relocate(*reg as usize) {
            *reg = v as u64;
        }
    }
    // An empty copy still has a well defined stack pointer.
    thread_context.set_sp(copied.stack_bottom as u64);
}
