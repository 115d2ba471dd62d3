use smallvec::SmallVec;

/// `RegisterContext` holds the register state of a thread captured at the
/// moment it was interrupted, for x86_64.
///
/// On Linux it is usually filled from the `ucontext` the kernel hands to a
/// signal handler:
/// ```ignore
/// extern "C" fn handler(_: libc::c_int, _: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
///     let context = RegisterContext::from_ucontext(ucontext).unwrap();
///     assert_ne!(context.pc(), 0);
/// }
/// ```
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RegisterContext {
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rdi: u64,
    rsi: u64,
    rbp: u64,
    rsp: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
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
        let gregs = unsafe { (*ucontext).uc_mcontext.gregs };
        Some(Self {
            rax: gregs[libc::REG_RAX as usize] as _,
            rbx: gregs[libc::REG_RBX as usize] as _,
            rcx: gregs[libc::REG_RCX as usize] as _,
            rdx: gregs[libc::REG_RDX as usize] as _,
            rdi: gregs[libc::REG_RDI as usize] as _,
            rsi: gregs[libc::REG_RSI as usize] as _,
            rbp: gregs[libc::REG_RBP as usize] as _,
            rsp: gregs[libc::REG_RSP as usize] as _,
            r8: gregs[libc::REG_R8 as usize] as _,
            r9: gregs[libc::REG_R9 as usize] as _,
            r10: gregs[libc::REG_R10 as usize] as _,
            r11: gregs[libc::REG_R11 as usize] as _,
            r12: gregs[libc::REG_R12 as usize] as _,
            r13: gregs[libc::REG_R13 as usize] as _,
            r14: gregs[libc::REG_R14 as usize] as _,
            r15: gregs[libc::REG_R15 as usize] as _,
            rip: gregs[libc::REG_RIP as usize] as _,
        })
    }

    /// Get the value of the PC (Program Counter) register.
    #[inline]
    pub fn pc(&self) -> u64 {
        self.rip
    }

    /// Get the value of the SP (Stack Pointer) register.
    #[inline]
    pub fn sp(&self) -> u64 {
        self.rsp
    }

    /// Get the value of the frame pointer (`rbp`).
    #[inline]
    pub fn fp(&self) -> u64 {
        self.rbp
    }

    #[inline]
    pub fn set_pc(&mut self, v: u64) {
        self.rip = v;
    }

    #[inline]
    pub fn set_sp(&mut self, v: u64) {
        self.rsp = v;
    }

    #[inline]
    pub fn set_fp(&mut self, v: u64) {
        self.rbp = v;
    }

    /// Registers that may hold addresses inside the thread's stack: the stack
    /// and frame pointers plus the callee-saved registers.
    pub fn registers_to_rewrite(&mut self) -> SmallVec<[&mut u64; MAX_REWRITE_REGISTERS]> {
        let mut v = SmallVec::new();
        v.push(&mut self.rbx);
        v.push(&mut self.rbp);
        v.push(&mut self.rsp);
        v.push(&mut self.r12);
        v.push(&mut self.r13);
        v.push(&mut self.r14);
        v.push(&mut self.r15);
        v
    }
}

pub const MAX_REWRITE_REGISTERS: usize = 7;
