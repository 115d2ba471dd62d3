#![allow(dead_code)]

use stackcopy::{CopiedStack, Module, ProfileBuilder, RegisterContext, Result, StackBounds, ThreadDelegate, Window};

pub const PC: u64 = 0x4000;

/// A thread whose "stack" is a byte buffer owned by the test.
pub struct FakeThread {
    pub stack: Vec<u8>,
    pub sp_offset: usize,
    pub suspend_error: Option<stackcopy::Error>,
    pub suspended: bool,
    pub suspends: usize,
    pub resumes: usize,
    pub on_suspend: Option<fn()>,
    pub on_resume: Option<fn()>,
}

impl FakeThread {
    pub fn new(stack: Vec<u8>, sp_offset: usize) -> Self {
        Self {
            stack,
            sp_offset,
            suspend_error: None,
            suspended: false,
            suspends: 0,
            resumes: 0,
            on_suspend: None,
            on_resume: None,
        }
    }

    /// A stack of `len` bytes filled with a recognizable pattern, with the
    /// stack pointer at its lowest address.
    pub fn with_live_stack(len: usize) -> Self {
        Self::new((0..len).map(|i| (i % 251) as u8).collect(), 0)
    }

    pub fn stack_pointer(&self) -> usize {
        self.stack.as_ptr() as usize + self.sp_offset
    }
}

impl ThreadDelegate for FakeThread {
    fn stack_bounds(&self) -> StackBounds {
        let start = self.stack.as_ptr() as usize;
        StackBounds {
            limit: start,
            base: start + self.stack.len(),
        }
    }

    fn suspend(&mut self, _: &Window) -> Result<()> {
        if let Some(err) = self.suspend_error {
            return Err(err);
        }
        assert!(!self.suspended, "suspended twice");
        self.suspended = true;
        self.suspends += 1;
        if let Some(f) = self.on_suspend {
            f();
        }
        Ok(())
    }

    fn thread_context(&mut self, _: &Window, context: &mut RegisterContext) -> bool {
        assert!(self.suspended);
        context.set_pc(PC);
        context.set_sp(self.stack_pointer() as u64);
        true
    }

    fn resume(&mut self, _: &Window) {
        if let Some(f) = self.on_resume {
            f();
        }
        assert!(self.suspended, "resumed without suspend");
        self.suspended = false;
        self.resumes += 1;
    }
}

#[derive(Default)]
pub struct RecordingBuilder {
    pub stack_copies: usize,
    pub thread_resumes: usize,
    pub captured: Vec<(CopiedStack, Module)>,
}

impl ProfileBuilder for RecordingBuilder {
    fn on_stack_copy(&mut self) {
        self.stack_copies += 1;
    }

    fn on_thread_resume(&mut self) {
        self.thread_resumes += 1;
    }

    fn on_stack_captured(&mut self, copied: &CopiedStack, module: &Module) {
        self.captured.push((*copied, module.clone()));
    }
}
