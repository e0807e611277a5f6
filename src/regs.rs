//! architecture-specific register frames for synthesized calls.
//!
//! the frame carries the full `NT_PRSTATUS` register set; `setup_call`
//! produces a new frame that will enter `func` with up to six integer
//! arguments and return to `return_addr`.

/// a snapshot of the tracee's general-purpose register file.
#[derive(Clone, Copy)]
pub struct RegisterFrame {
    regs: libc::user_regs_struct,
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
compile_error!("only aarch64 and x86_64 tracees are supported");

pub const MAX_CALL_ARGS: usize = 6;

impl RegisterFrame {
    pub fn from_raw(regs: libc::user_regs_struct) -> Self {
        RegisterFrame { regs }
    }

    pub fn raw(&self) -> &libc::user_regs_struct {
        &self.regs
    }

    pub fn raw_mut(&mut self) -> &mut libc::user_regs_struct {
        &mut self.regs
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                &self.regs as *const libc::user_regs_struct as *const u8,
                std::mem::size_of::<libc::user_regs_struct>(),
            )
        }
    }
}

impl PartialEq for RegisterFrame {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for RegisterFrame {}

impl std::fmt::Debug for RegisterFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RegisterFrame {{ pc: {:x}, sp: {:x} }}", self.pc(), self.sp())
    }
}

#[cfg(target_arch = "aarch64")]
impl RegisterFrame {
    /// arguments go in `x0..x5`, the entry point in `pc`, and the return
    /// address in the link register `x30`.
    pub fn setup_call(&self, func: u64, args: &[u64], return_addr: u64) -> Self {
        debug_assert!(args.len() <= MAX_CALL_ARGS);
        let mut new = *self;
        for k in 0..MAX_CALL_ARGS {
            new.regs.regs[k] = args.get(k).cloned().unwrap_or(0);
        }
        new.regs.pc = func;
        new.regs.regs[30] = return_addr;
        new
    }

    pub fn retval(&self) -> u64 {
        self.regs.regs[0]
    }

    pub fn pc(&self) -> u64 {
        self.regs.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.regs.pc = pc;
    }

    pub fn sp(&self) -> u64 {
        self.regs.sp
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterFrame {
    /// arguments go in `rdi, rsi, rdx, rcx, r8, r9` and the entry point in
    /// `rip`. `rax` must be zeroed: the SysV variadic ABI passes the count
    /// of vector registers there. the return address is NOT placed here;
    /// the caller reserves a stack slot with [`stack_reserve`] and pokes
    /// it into the tracee.
    ///
    /// [`stack_reserve`]: RegisterFrame::stack_reserve
    pub fn setup_call(&self, func: u64, args: &[u64], _return_addr: u64) -> Self {
        debug_assert!(args.len() <= MAX_CALL_ARGS);
        let mut new = *self;
        let a = |k: usize| args.get(k).cloned().unwrap_or(0);
        new.regs.rdi = a(0);
        new.regs.rsi = a(1);
        new.regs.rdx = a(2);
        new.regs.rcx = a(3);
        new.regs.r8 = a(4);
        new.regs.r9 = a(5);
        new.regs.rip = func;
        new.regs.rax = 0;
        new
    }

    /// claim `bytes` of stack below the current `rsp`; returns the new
    /// top-of-stack address (where the return slot lives).
    pub fn stack_reserve(&mut self, bytes: u64) -> u64 {
        self.regs.rsp -= bytes;
        self.regs.rsp
    }

    pub fn retval(&self) -> u64 {
        self.regs.rax
    }

    pub fn pc(&self) -> u64 {
        self.regs.rip
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.regs.rip = pc;
    }

    pub fn sp(&self) -> u64 {
        self.regs.rsp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed() -> RegisterFrame {
        RegisterFrame::from_raw(unsafe { std::mem::zeroed() })
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn call_frame_places_args_and_pc() {
        let frame = zeroed().setup_call(0xdead_b000, &[1, 2, 3, 4, 5, 6], 0);
        assert_eq!(frame.raw().rdi, 1);
        assert_eq!(frame.raw().rsi, 2);
        assert_eq!(frame.raw().rdx, 3);
        assert_eq!(frame.raw().rcx, 4);
        assert_eq!(frame.raw().r8, 5);
        assert_eq!(frame.raw().r9, 6);
        assert_eq!(frame.pc(), 0xdead_b000);
        assert_eq!(frame.raw().rax, 0);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn stack_reserve_moves_rsp_down() {
        let mut frame = zeroed();
        frame.raw_mut().rsp = 0x8000;
        let slot = frame.stack_reserve(8);
        assert_eq!(slot, 0x7ff8);
        assert_eq!(frame.sp(), 0x7ff8);
    }

    #[test]
    #[cfg(target_arch = "aarch64")]
    fn call_frame_places_args_pc_and_lr() {
        let frame = zeroed().setup_call(0xdead_b000, &[1, 2, 3], 0);
        assert_eq!(&frame.raw().regs[0..6], &[1, 2, 3, 0, 0, 0]);
        assert_eq!(frame.pc(), 0xdead_b000);
        assert_eq!(frame.raw().regs[30], 0);
    }

    #[test]
    fn missing_args_default_to_zero() {
        let frame = zeroed().setup_call(0x1000, &[7], 0);
        assert_eq!(frame.pc(), 0x1000);
        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(frame.raw().rdi, 7);
            assert_eq!(frame.raw().rsi, 0);
            assert_eq!(frame.raw().r9, 0);
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert_eq!(frame.raw().regs[0], 7);
            assert_eq!(frame.raw().regs[1], 0);
            assert_eq!(frame.raw().regs[5], 0);
        }
    }

    #[test]
    fn frames_compare_by_register_content() {
        let a = zeroed();
        let b = zeroed();
        assert_eq!(a, b);
        let c = zeroed().setup_call(0x1000, &[], 0);
        assert_ne!(a, c);
    }
}
