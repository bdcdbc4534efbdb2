use bitflags::bitflags;

pub mod arm64;
pub mod x64;

bitflags! {
    /// UNWIND_INFO flag bits; also used to say which handler kind a
    /// virtual unwind is looking for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnwindFlags: u8 {
        const EHANDLER  = 0x1;
        const UHANDLER  = 0x2;
        const CHAININFO = 0x4;
    }
}

/// A language-specific handler located by a virtual unwind: the rebased
/// handler address plus the machine address of its trailing data blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageHandler {
    pub address: u64,
    pub data: u64,
}

/// Result of one virtual-unwind step. The context passed in has been
/// advanced to the caller's frame when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwound {
    pub handler: Option<LanguageHandler>,
    /// Stack address identifying the frame whose handler this is: the
    /// stack pointer at the start of the unwind, unless the function
    /// established a frame pointer, in which case the frame it set.
    pub establisher_frame: u64,
}

/// Which machine slot now holds each nonvolatile register after a virtual
/// unwind; callers use this to know where a register can be patched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonvolatileSlots {
    pub integer: [Option<u64>; 16],
    pub xmm: [Option<u64>; 16],
}

/// aarch64 flavor: x19..x28, fp, lr and d8..d15.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arm64NonvolatileSlots {
    pub x: [Option<u64>; 12],
    pub d: [Option<u64>; 8],
}
