use bitflags::bitflags;

use crate::error::{Result, Status};

pub mod xstate;

bitflags! {
    /// Sub-group mask stating which parts of a [`Context`] are populated.
    ///
    /// Bit positions follow the AMD64 CONTEXT ABI so that the values are
    /// meaningful to anything else walking the same structures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextFlags: u32 {
        const AMD64           = 0x0010_0000;
        const CONTROL         = 0x0010_0001;
        const INTEGER         = 0x0010_0002;
        const SEGMENTS        = 0x0010_0004;
        const FLOATING_POINT  = 0x0010_0008;
        const DEBUG_REGISTERS = 0x0010_0010;
        const XSTATE          = 0x0010_0040;
        const FULL            = 0x0010_000b;
        const ALL             = 0x0010_005f;
        const UNWOUND_TO_CALL = 0x2000_0000;
    }
}

/// One SSE register, kept as two halves the way M128A lays it out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct V128 {
    pub low: u64,
    pub high: u64,
}

/// Full x86-64 register snapshot.
///
/// Readers must not assume fields outside `flags` are meaningful; the copy
/// helpers below only ever move the named sub-groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub flags: ContextFlags,

    // control
    pub rip: u64,
    pub rsp: u64,
    pub eflags: u32,
    pub seg_cs: u16,
    pub seg_ss: u16,

    // integer
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    // segments
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,

    // floating point
    pub mx_csr: u32,
    pub xmm: [V128; 16],

    // debug registers
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
}

/// General-purpose register numbering used by the unwind opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Register {
    pub fn get(&self, context: &Context) -> u64 {
        match self {
            Register::Rax => context.rax,
            Register::Rcx => context.rcx,
            Register::Rdx => context.rdx,
            Register::Rbx => context.rbx,
            Register::Rsp => context.rsp,
            Register::Rbp => context.rbp,
            Register::Rsi => context.rsi,
            Register::Rdi => context.rdi,
            Register::R8 => context.r8,
            Register::R9 => context.r9,
            Register::R10 => context.r10,
            Register::R11 => context.r11,
            Register::R12 => context.r12,
            Register::R13 => context.r13,
            Register::R14 => context.r14,
            Register::R15 => context.r15,
        }
    }

    pub fn get_mut<'a>(&self, context: &'a mut Context) -> &'a mut u64 {
        match self {
            Register::Rax => &mut context.rax,
            Register::Rcx => &mut context.rcx,
            Register::Rdx => &mut context.rdx,
            Register::Rbx => &mut context.rbx,
            Register::Rsp => &mut context.rsp,
            Register::Rbp => &mut context.rbp,
            Register::Rsi => &mut context.rsi,
            Register::Rdi => &mut context.rdi,
            Register::R8 => &mut context.r8,
            Register::R9 => &mut context.r9,
            Register::R10 => &mut context.r10,
            Register::R11 => &mut context.r11,
            Register::R12 => &mut context.r12,
            Register::R13 => &mut context.r13,
            Register::R14 => &mut context.r14,
            Register::R15 => &mut context.r15,
        }
    }
}

impl TryFrom<u8> for Register {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Rax,
            1 => Self::Rcx,
            2 => Self::Rdx,
            3 => Self::Rbx,
            4 => Self::Rsp,
            5 => Self::Rbp,
            6 => Self::Rsi,
            7 => Self::Rdi,
            8 => Self::R8,
            9 => Self::R9,
            10 => Self::R10,
            11 => Self::R11,
            12 => Self::R12,
            13 => Self::R13,
            14 => Self::R14,
            15 => Self::R15,
            err => return Err(err),
        })
    }
}

/// Copy the sub-groups named by `flags` from `src` to `dst` and update
/// `dst.flags` to match what is now populated.
pub fn copy_context(dst: &mut Context, src: &Context, flags: ContextFlags) {
    let flags = flags & !ContextFlags::AMD64;
    if flags.contains(ContextFlags::CONTROL & !ContextFlags::AMD64) {
        dst.rip = src.rip;
        dst.rsp = src.rsp;
        dst.eflags = src.eflags;
        dst.seg_cs = src.seg_cs;
        dst.seg_ss = src.seg_ss;
    }
    if flags.contains(ContextFlags::INTEGER & !ContextFlags::AMD64) {
        dst.rax = src.rax;
        dst.rcx = src.rcx;
        dst.rdx = src.rdx;
        dst.rbx = src.rbx;
        dst.rbp = src.rbp;
        dst.rsi = src.rsi;
        dst.rdi = src.rdi;
        dst.r8 = src.r8;
        dst.r9 = src.r9;
        dst.r10 = src.r10;
        dst.r11 = src.r11;
        dst.r12 = src.r12;
        dst.r13 = src.r13;
        dst.r14 = src.r14;
        dst.r15 = src.r15;
    }
    if flags.contains(ContextFlags::SEGMENTS & !ContextFlags::AMD64) {
        dst.seg_ds = src.seg_ds;
        dst.seg_es = src.seg_es;
        dst.seg_fs = src.seg_fs;
        dst.seg_gs = src.seg_gs;
    }
    if flags.contains(ContextFlags::FLOATING_POINT & !ContextFlags::AMD64) {
        dst.mx_csr = src.mx_csr;
        dst.xmm = src.xmm;
    }
    if flags.contains(ContextFlags::DEBUG_REGISTERS & !ContextFlags::AMD64) {
        dst.dr0 = src.dr0;
        dst.dr1 = src.dr1;
        dst.dr2 = src.dr2;
        dst.dr3 = src.dr3;
        dst.dr6 = src.dr6;
        dst.dr7 = src.dr7;
    }
    dst.flags |= flags | ContextFlags::AMD64;
}

/// Reject flag requests the platform does not accept: anything without the
/// architecture bit, and the XSTATE control bit on its own (it only rides
/// on top of a floating-point request).
pub fn validate_get_flags(flags: ContextFlags) -> Result<()> {
    if !flags.contains(ContextFlags::AMD64) {
        return Err(Status::InvalidParameter);
    }
    if flags.contains(ContextFlags::XSTATE & !ContextFlags::AMD64)
        && !flags.contains(ContextFlags::FLOATING_POINT & !ContextFlags::AMD64)
    {
        return Err(Status::InvalidParameter);
    }
    Ok(())
}

/// aarch64 register snapshot for the ARM64 unwind engine.
///
/// `x[29]` is the frame pointer, `x[30]` the link register.
#[derive(Debug, Clone, Copy)]
pub struct Arm64Context {
    pub flags: u32,
    pub cpsr: u32,
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub v: [V128; 32],
}

pub const CONTEXT_ARM64: u32 = 0x0040_0000;
pub const CONTEXT_ARM64_UNWOUND_TO_CALL: u32 = 0x2000_0000;

impl Default for Arm64Context {
    fn default() -> Self {
        Self {
            flags: CONTEXT_ARM64,
            cpsr: 0,
            x: [0; 31],
            sp: 0,
            pc: 0,
            v: [V128::default(); 32],
        }
    }
}

impl Arm64Context {
    pub fn fp(&self) -> u64 {
        self.x[29]
    }

    pub fn lr(&self) -> u64 {
        self.x[30]
    }
}
