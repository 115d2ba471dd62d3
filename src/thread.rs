use crate::registers::RegisterContext;
use crate::Result;

/// Capability token for the suspend window.
///
/// Only [StackCopierSuspend] can create one, so the window-only operations of
/// a [ThreadDelegate] cannot be driven from anywhere else.
///
/// [StackCopierSuspend]: crate::StackCopierSuspend
#[derive(Debug)]
pub struct Window {
    _private: (),
}

impl Window {
    #[inline]
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// Bounds of a downward-growing thread stack: `limit` is the lowest usable
/// address and `base` the address one past the highest one.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct StackBounds {
    pub limit: usize,
    pub base: usize,
}

impl StackBounds {
    /// A stack pointer equal to `base` describes an empty stack.
    #[inline]
    pub fn contains_stack_pointer(&self, sp: usize) -> bool {
        self.limit <= sp && sp <= self.base
    }
}

/// A thread that can be suspended, inspected and resumed from another thread.
///
/// Implementations are platform specific. The stack copier calls
/// [suspend](ThreadDelegate::suspend) first and, only if it succeeded,
/// [thread_context](ThreadDelegate::thread_context),
/// [stack_bounds](ThreadDelegate::stack_bounds) and finally
/// [resume](ThreadDelegate::resume), exactly once.
///
/// Everything called while the target is suspended must be async-signal-safe:
/// no heap allocation, no locks the target might hold, no logging.
pub trait ThreadDelegate {
    /// Bounds of the target stack. Called inside the suspend window.
    fn stack_bounds(&self) -> StackBounds;

    /// Suspends the target thread. On error the target must be left running.
    fn suspend(&mut self, window: &Window) -> Result<()>;

    /// Reads the register context of the suspended target.
    fn thread_context(&mut self, window: &Window, context: &mut RegisterContext) -> bool;

    /// Resumes the target thread.
    fn resume(&mut self, window: &Window);
}

impl<D: ThreadDelegate + ?Sized> ThreadDelegate for Box<D> {
    fn stack_bounds(&self) -> StackBounds {
        (**self).stack_bounds()
    }

    fn suspend(&mut self, window: &Window) -> Result<()> {
        (**self).suspend(window)
    }

    fn thread_context(&mut self, window: &Window, context: &mut RegisterContext) -> bool {
        (**self).thread_context(window, context)
    }

    fn resume(&mut self, window: &Window) {
        (**self).resume(window)
    }
}
