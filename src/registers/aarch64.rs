use smallvec::SmallVec;

/// `RegisterContext` holds the register state of a thread captured at the
/// moment it was interrupted, for aarch64.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RegisterContext {
    x: [u64; 29], // x0 ~ x28
    fp: u64,      // x29
    lr: u64,      // x30
    sp: u64,
    pc: u64,
}

impl RegisterContext {
    /// Initialize `RegisterContext` with value from `ucontext`.
    ///
    /// Async-signal-safe: only reads from `ucontext`.
    #[cfg(target_os = "linux")]
    pub fn from_ucontext(ucontext: *mut libc::c_void) -> Option<Self> {
        let ucontext = ucontext as *mut libc::ucontext_t;
        if ucontext.is_null() {
            return None;
        }
        let mcontext = unsafe { &(*ucontext).uc_mcontext };
        let mut context = Self::default();
        context.x.copy_from_slice(&mcontext.regs[..29]);
        context.fp = mcontext.regs[29];
        context.lr = mcontext.regs[30];
        context.sp = mcontext.sp;
        context.pc = mcontext.pc;
        Some(context)
    }

    /// Get the value of the PC (Program Counter) register.
    #[inline]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Get the value of the SP (Stack Pointer) register.
    #[inline]
    pub fn sp(&self) -> u64 {
        self.sp
    }

    /// Get the value of the frame pointer (`x29`).
    #[inline]
    pub fn fp(&self) -> u64 {
        self.fp
    }

    /// Get the value of the link register (`x30`).
    #[inline]
    pub fn lr(&self) -> u64 {
        self.lr
    }

    #[inline]
    pub fn set_pc(&mut self, v: u64) {
        self.pc = v;
    }

    #[inline]
    pub fn set_sp(&mut self, v: u64) {
        self.sp = v;
    }

    #[inline]
    pub fn set_fp(&mut self, v: u64) {
        self.fp = v;
    }

    /// Registers that may hold addresses inside the thread's stack: the
    /// callee-saved `x19`-`x28`, the frame pointer and the stack pointer.
    pub fn registers_to_rewrite(&mut self) -> SmallVec<[&mut u64; MAX_REWRITE_REGISTERS]> {
        let mut v = SmallVec::new();
        for reg in &mut self.x[19..] {
            v.push(reg);
        }
        v.push(&mut self.fp);
        v.push(&mut self.sp);
        v
    }
}

pub const MAX_REWRITE_REGISTERS: usize = 12;
