//! x86-64 table-driven unwind: UNWIND_INFO decode and opcode replay.

use tracing::trace;

use crate::context::{Context, Register};
use crate::error::{Result, Status};
use crate::memory::MemorySource;
use crate::tables::RuntimeFunction;
use crate::unwind::{LanguageHandler, NonvolatileSlots, UnwindFlags, Unwound};

const UWOP_PUSH_NONVOL: u8 = 0; /* info == register number */
const UWOP_ALLOC_LARGE: u8 = 1; /* no info, alloc size in next 1 or 2 slots */
const UWOP_ALLOC_SMALL: u8 = 2; /* info == size of allocation / 8 - 1 */
const UWOP_SET_FPREG: u8 = 3; /* no info, FP = RSP + UNWIND_INFO.FPRegOffset*16 */
const UWOP_SAVE_NONVOL: u8 = 4; /* info == register number, offset in next slot */
const UWOP_SAVE_NONVOL_FAR: u8 = 5; /* info == register number, offset in next 2 slots */
const UWOP_EPILOG: u8 = 6; /* version 2 epilogue marker */
const UWOP_SAVE_XMM128: u8 = 8; /* info == XMM reg number, offset in next slot */
const UWOP_SAVE_XMM128_FAR: u8 = 9; /* info == XMM reg number, offset in next 2 slots */
const UWOP_PUSH_MACHFRAME: u8 = 10; /* info == 1 if an error code was pushed */

// These represent the logical operations, so large/small and far/near are
// merged; each keeps the prologue offset it was tagged with, which is what
// partial-prologue replay compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOp {
    PushNonVolatile { reg: Register },
    Alloc { size: u32 },
    SetFpReg,
    SaveNonVolatile { reg: Register, offset: u32 },
    SaveXmm128 { reg: u8, offset: u32 },
    PushMachFrame { error_code: bool },
    Epilog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindCode {
    pub code_offset: u8,
    pub op: UnwindOp,
}

#[derive(Debug, PartialEq, Eq)]
pub enum UnwindCodeParseError {
    IncompleteOp(u8),
    UnknownOp(u8),
    InvalidRegister(u8),
}

pub fn parse_unwind_ops(code_slots: &[u16]) -> std::result::Result<Vec<UnwindCode>, UnwindCodeParseError> {
    let mut ops = Vec::<UnwindCode>::new();

    let mut i = 0;
    while i < code_slots.len() {
        let code_offset = (code_slots[i] & 0xff) as u8;
        let unwind_op = ((code_slots[i] >> 8) & 0xf) as u8;
        let op_info = ((code_slots[i] >> 12) & 0xf) as u8;
        match unwind_op {
            UWOP_PUSH_NONVOL => {
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::PushNonVolatile {
                        reg: op_info
                            .try_into()
                            .map_err(UnwindCodeParseError::InvalidRegister)?,
                    },
                });
            }
            UWOP_ALLOC_LARGE if op_info == 0 => {
                if i + 1 >= code_slots.len() {
                    return Err(UnwindCodeParseError::IncompleteOp(UWOP_ALLOC_LARGE));
                }
                let size = (code_slots[i + 1] as u32) * 8;
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::Alloc { size },
                });
                i += 1;
            }
            UWOP_ALLOC_LARGE => {
                if i + 2 >= code_slots.len() {
                    return Err(UnwindCodeParseError::IncompleteOp(UWOP_ALLOC_LARGE));
                }
                let size = code_slots[i + 1] as u32 + ((code_slots[i + 2] as u32) << 16);
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::Alloc { size },
                });
                i += 2;
            }
            UWOP_ALLOC_SMALL => {
                let size = (op_info as u32) * 8 + 8;
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::Alloc { size },
                });
            }
            UWOP_SET_FPREG => {
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::SetFpReg,
                });
            }
            UWOP_SAVE_NONVOL => {
                if i + 1 >= code_slots.len() {
                    return Err(UnwindCodeParseError::IncompleteOp(UWOP_SAVE_NONVOL));
                }
                let offset = code_slots[i + 1] as u32 * 8;
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::SaveNonVolatile {
                        reg: op_info
                            .try_into()
                            .map_err(UnwindCodeParseError::InvalidRegister)?,
                        offset,
                    },
                });
                i += 1;
            }
            UWOP_SAVE_NONVOL_FAR => {
                if i + 2 >= code_slots.len() {
                    return Err(UnwindCodeParseError::IncompleteOp(UWOP_SAVE_NONVOL_FAR));
                }
                let offset = code_slots[i + 1] as u32 + ((code_slots[i + 2] as u32) << 16);
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::SaveNonVolatile {
                        reg: op_info
                            .try_into()
                            .map_err(UnwindCodeParseError::InvalidRegister)?,
                        offset,
                    },
                });
                i += 2;
            }
            UWOP_EPILOG => {
                if i + 1 >= code_slots.len() {
                    return Err(UnwindCodeParseError::IncompleteOp(UWOP_EPILOG));
                }
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::Epilog,
                });
                i += 1;
            }
            UWOP_SAVE_XMM128 => {
                if i + 1 >= code_slots.len() {
                    return Err(UnwindCodeParseError::IncompleteOp(UWOP_SAVE_XMM128));
                }
                let offset = code_slots[i + 1] as u32 * 16;
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::SaveXmm128 {
                        reg: op_info,
                        offset,
                    },
                });
                i += 1;
            }
            UWOP_SAVE_XMM128_FAR => {
                if i + 2 >= code_slots.len() {
                    return Err(UnwindCodeParseError::IncompleteOp(UWOP_SAVE_XMM128_FAR));
                }
                let offset = code_slots[i + 1] as u32 + ((code_slots[i + 2] as u32) << 16);
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::SaveXmm128 {
                        reg: op_info,
                        offset,
                    },
                });
                i += 2;
            }
            UWOP_PUSH_MACHFRAME => {
                ops.push(UnwindCode {
                    code_offset,
                    op: UnwindOp::PushMachFrame {
                        error_code: op_info != 0,
                    },
                });
            }
            err => return Err(UnwindCodeParseError::UnknownOp(err)),
        }
        i += 1;
    }

    Ok(ops)
}

/// Decoded per-function unwind metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindInfo {
    pub version: u8,
    pub flags: UnwindFlags,
    pub prolog_size: u8,
    pub frame_register: u8,
    pub frame_offset: u8,
    pub codes: Vec<UnwindCode>,
    pub handler_rva: Option<u32>,
    pub handler_data_address: u64,
    pub chained: Option<RuntimeFunction>,
}

/// Parse the UNWIND_INFO record at `base + unwind_rva` out of machine
/// memory. Opcode slots are stored in descending prologue-offset order and
/// are kept that way.
pub fn parse_unwind_info(
    memory: &impl MemorySource,
    base: u64,
    unwind_rva: u32,
) -> Result<UnwindInfo> {
    let addr = base + unwind_rva as u64;
    let header = memory.read_memory_full_array::<u8>(addr, 4)?;
    let version = header[0] & 0x7;
    let flags = UnwindFlags::from_bits_truncate(header[0] >> 3);
    let prolog_size = header[1];
    let count = header[2] as usize;
    let frame_register = header[3] & 0xf;
    let frame_offset = header[3] >> 4;

    if version != 1 && version != 2 {
        trace!(version, "unknown unwind info version");
        return Err(Status::BadFunctionTable);
    }

    let slots = memory.read_memory_full_array::<u16>(addr + 4, count)?;
    let codes = parse_unwind_ops(&slots).map_err(|_| Status::BadFunctionTable)?;

    // The trailer is aligned to an even slot count.
    let trailer = addr + 4 + (((count + 1) & !1) * 2) as u64;
    let mut handler_rva = None;
    let mut handler_data_address = 0;
    let mut chained = None;
    if flags.contains(UnwindFlags::CHAININFO) {
        chained = Some(RuntimeFunction {
            begin_address: memory.read_memory_data::<u32>(trailer)?,
            end_address: memory.read_memory_data::<u32>(trailer + 4)?,
            unwind_info: memory.read_memory_data::<u32>(trailer + 8)?,
        });
    } else if flags.intersects(UnwindFlags::EHANDLER | UnwindFlags::UHANDLER) {
        handler_rva = Some(memory.read_memory_data::<u32>(trailer)?);
        handler_data_address = trailer + 4;
    }

    Ok(UnwindInfo {
        version,
        flags,
        prolog_size,
        frame_register,
        frame_offset,
        codes,
        handler_rva,
        handler_data_address,
        chained,
    })
}

fn set_int_reg(
    context: &mut Context,
    slots: &mut Option<&mut NonvolatileSlots>,
    reg: Register,
    addr: u64,
    memory: &impl MemorySource,
) -> Result<()> {
    let value = memory.read_memory_data::<u64>(addr)?;
    *reg.get_mut(context) = value;
    if let Some(slots) = slots.as_deref_mut() {
        slots.integer[reg as usize] = Some(addr);
    }
    Ok(())
}

fn set_xmm_reg(
    context: &mut Context,
    slots: &mut Option<&mut NonvolatileSlots>,
    reg: u8,
    addr: u64,
    memory: &impl MemorySource,
) -> Result<()> {
    let low = memory.read_memory_data::<u64>(addr)?;
    let high = memory.read_memory_data::<u64>(addr + 8)?;
    context.xmm[reg as usize] = crate::context::V128 { low, high };
    if let Some(slots) = slots.as_deref_mut() {
        slots.xmm[reg as usize] = Some(addr);
    }
    Ok(())
}

fn read_u8(memory: &impl MemorySource, addr: u64) -> Option<u8> {
    memory.read_memory_data::<u8>(addr).ok()
}

fn read_i8(memory: &impl MemorySource, addr: u64) -> Option<i64> {
    Some(read_u8(memory, addr)? as i8 as i64)
}

fn read_i32(memory: &impl MemorySource, addr: u64) -> Option<i64> {
    memory.read_memory_data::<i32>(addr).ok().map(|v| v as i64)
}

/// Is `pc` inside a recognizable function epilogue? Only the fixed epilogue
/// shapes the ABI allows are matched: an optional add/lea adjusting rsp,
/// then pops, then ret or a tail jump out of the function.
fn is_inside_epilog(
    memory: &impl MemorySource,
    mut pc: u64,
    base: u64,
    function: &RuntimeFunction,
) -> bool {
    let Some(b0) = read_u8(memory, pc) else {
        return false;
    };

    // add or lea must be the first instruction, and it must have a rex.W prefix
    if (b0 & 0xf8) == 0x48 {
        let Some(b1) = read_u8(memory, pc + 1) else {
            return false;
        };
        match b1 {
            0x81 => {
                // add $nnnn,%rsp
                if b0 == 0x48 && read_u8(memory, pc + 2) == Some(0xc4) {
                    pc += 7;
                } else {
                    return false;
                }
            }
            0x83 => {
                // add $n,%rsp
                if b0 == 0x48 && read_u8(memory, pc + 2) == Some(0xc4) {
                    pc += 4;
                } else {
                    return false;
                }
            }
            0x8d => {
                // lea n(reg),%rsp
                if b0 & 0x06 != 0 {
                    return false; // rex.RX must be cleared
                }
                let Some(modrm) = read_u8(memory, pc + 2) else {
                    return false;
                };
                if (modrm >> 3) & 7 != 4 {
                    return false; // dest reg must be %rsp
                }
                if modrm & 7 == 4 {
                    return false; // no SIB byte allowed
                }
                match modrm >> 6 {
                    1 => pc += 4, // 8-bit offset
                    2 => pc += 7, // 32-bit offset
                    _ => return false,
                }
            }
            _ => {}
        }
    }

    // now check for various pop instructions
    loop {
        let Some(mut byte) = read_u8(memory, pc) else {
            return false;
        };
        let mut rex = 0;
        if byte & 0xf0 == 0x40 {
            rex = byte & 0x0f; // rex prefix
            pc += 1;
            match read_u8(memory, pc) {
                Some(next) => byte = next,
                None => return false,
            }
        }

        match byte {
            0x58..=0x5f => {
                // pop %reg
                pc += 1;
                continue;
            }
            0xc2 | 0xc3 => return true, // ret
            0xe9 => {
                // jmp nnnn
                let Some(disp) = read_i32(memory, pc + 1) else {
                    return false;
                };
                let target = pc.wrapping_add(5).wrapping_add(disp as u64);
                let rva = target.wrapping_sub(base);
                return !(rva >= function.begin_address as u64
                    && rva < function.end_address as u64);
            }
            0xeb => {
                // jmp n
                let Some(disp) = read_i8(memory, pc + 1) else {
                    return false;
                };
                let target = pc.wrapping_add(2).wrapping_add(disp as u64);
                let rva = target.wrapping_sub(base);
                return !(rva >= function.begin_address as u64
                    && rva < function.end_address as u64);
            }
            0xf3 => {
                // rep; ret (for amd64 prediction bug)
                return read_u8(memory, pc + 1) == Some(0xc3);
            }
            0xff => {
                // jmp indirect
                if rex != 0 && rex != 8 {
                    return false;
                }
                let Some(modrm) = read_u8(memory, pc + 1) else {
                    return false;
                };
                if modrm == 0x25 {
                    return true;
                }
                return rex != 0 && (modrm >> 3) & 7 == 4;
            }
            _ => return false,
        }
    }
}

/// Execute a function epilogue, which must have been validated with
/// `is_inside_epilog`.
fn interpret_epilog(
    memory: &impl MemorySource,
    mut pc: u64,
    context: &mut Context,
    slots: &mut Option<&mut NonvolatileSlots>,
) -> Result<()> {
    loop {
        let mut byte = memory.read_memory_data::<u8>(pc)?;
        let mut rex = 0;
        if byte & 0xf0 == 0x40 {
            rex = byte & 0x0f;
            pc += 1;
            byte = memory.read_memory_data::<u8>(pc)?;
        }

        match byte {
            0x58..=0x5f => {
                // pop %reg
                let reg = Register::try_from(byte - 0x58 + (rex & 1) * 8)
                    .map_err(|_| Status::BadFunctionTable)?;
                set_int_reg(context, slots, reg, context.rsp, memory)?;
                context.rsp += 8;
                pc += 1;
            }
            0x81 => {
                // add $nnnn,%rsp
                let disp = memory.read_memory_data::<i32>(pc + 2)? as i64;
                context.rsp = context.rsp.wrapping_add(disp as u64);
                pc += 6;
            }
            0x83 => {
                // add $n,%rsp
                let disp = memory.read_memory_data::<u8>(pc + 2)? as i8 as i64;
                context.rsp = context.rsp.wrapping_add(disp as u64);
                pc += 3;
            }
            0x8d => {
                let modrm = memory.read_memory_data::<u8>(pc + 1)?;
                let reg = Register::try_from((modrm & 7) + (rex & 1) * 8)
                    .map_err(|_| Status::BadFunctionTable)?;
                if modrm >> 6 == 1 {
                    // lea n(reg),%rsp
                    let disp = memory.read_memory_data::<u8>(pc + 2)? as i8 as i64;
                    context.rsp = reg.get(context).wrapping_add(disp as u64);
                    pc += 3;
                } else {
                    // lea nnnn(reg),%rsp
                    let disp = memory.read_memory_data::<i32>(pc + 2)? as i64;
                    context.rsp = reg.get(context).wrapping_add(disp as u64);
                    pc += 6;
                }
            }
            0xc2 => {
                // ret $nn
                context.rip = memory.read_memory_data::<u64>(context.rsp)?;
                let imm = memory.read_memory_data::<u16>(pc + 1)? as u64;
                context.rsp += 8 + imm;
                return Ok(());
            }
            0xe9 | 0xeb | 0xc3 | 0xf3 | 0xff => {
                context.rip = memory.read_memory_data::<u64>(context.rsp)?;
                context.rsp += 8;
                return Ok(());
            }
            _ => return Ok(()),
        }
    }
}

/// Replay (or reverse) the prologue of the function containing `pc`,
/// advancing `context` to the caller's frame.
///
/// With no function entry the PC is treated as a leaf: the return address
/// sits at the stack pointer. Registers no opcode touches keep the caller's
/// values exactly.
pub fn virtual_unwind(
    search: UnwindFlags,
    base: u64,
    pc: u64,
    function: Option<RuntimeFunction>,
    context: &mut Context,
    memory: &impl MemorySource,
    mut slots: Option<&mut NonvolatileSlots>,
) -> Result<Unwound> {
    trace!(base, pc, rva = pc - base, rsp = context.rsp, "virtual unwind");

    let mut frame = context.rsp;
    let mut establisher_frame = context.rsp;

    let Some(mut function) = function else {
        // leaf function
        context.rip = memory.read_memory_data::<u64>(context.rsp)?;
        context.rsp += 8;
        return Ok(Unwound {
            handler: None,
            establisher_frame,
        });
    };

    let mut mach_frame = false;
    let mut info;
    let mut prolog_offset;
    loop {
        // An odd unwind_info field redirects to another RUNTIME_FUNCTION.
        while function.unwind_info & 1 != 0 {
            let target = base + (function.unwind_info & !1) as u64;
            function = RuntimeFunction {
                begin_address: memory.read_memory_data::<u32>(target)?,
                end_address: memory.read_memory_data::<u32>(target + 4)?,
                unwind_info: memory.read_memory_data::<u32>(target + 8)?,
            };
        }
        info = parse_unwind_info(memory, base, function.unwind_info)?;

        if info.frame_register != 0 {
            let reg = Register::try_from(info.frame_register).map_err(|_| Status::BadFunctionTable)?;
            frame = reg.get(context) - info.frame_offset as u64 * 16;
        }

        // check if in prolog
        let begin = base + function.begin_address as u64;
        if pc >= begin && pc < begin + info.prolog_size as u64 {
            trace!("inside prolog");
            prolog_offset = (pc - begin) as u32;
        } else {
            prolog_offset = u32::MAX;
            // Zero opcode counts get no epilogue treatment (Win10 1809 rule).
            if !info.codes.is_empty() && is_inside_epilog(memory, pc, base, &function) {
                trace!("inside epilog");
                interpret_epilog(memory, pc, context, &mut slots)?;
                let establisher_frame = if info.frame_register != 0 {
                    context.rsp - 8
                } else {
                    frame
                };
                return Ok(Unwound {
                    handler: None,
                    establisher_frame,
                });
            }
        }

        for code in &info.codes {
            if prolog_offset < code.code_offset as u32 {
                continue; /* prologue has not executed this far yet */
            }
            match code.op {
                UnwindOp::PushNonVolatile { reg } => {
                    set_int_reg(context, &mut slots, reg, context.rsp, memory)?;
                    context.rsp += 8;
                }
                UnwindOp::Alloc { size } => {
                    context.rsp += size as u64;
                }
                UnwindOp::SetFpReg => {
                    context.rsp = frame;
                    establisher_frame = frame;
                }
                UnwindOp::SaveNonVolatile { reg, offset } => {
                    set_int_reg(context, &mut slots, reg, frame + offset as u64, memory)?;
                }
                UnwindOp::SaveXmm128 { reg, offset } => {
                    set_xmm_reg(context, &mut slots, reg, frame + offset as u64, memory)?;
                }
                UnwindOp::PushMachFrame { error_code } => {
                    if error_code {
                        context.rsp += 8;
                    }
                    context.rip = memory.read_memory_data::<u64>(context.rsp)?;
                    context.rsp = memory.read_memory_data::<u64>(context.rsp + 24)?;
                    mach_frame = true;
                }
                UnwindOp::Epilog => {}
            }
        }

        match info.chained {
            Some(chain) => function = chain, /* restart with the chained info */
            None => break,
        }
    }

    if !mach_frame {
        // now pop return address
        context.rip = memory.read_memory_data::<u64>(context.rsp)?;
        context.rsp += 8;
    }

    if !info.flags.intersects(search) || prolog_offset != u32::MAX {
        // no matching handler, or inside prolog
        return Ok(Unwound {
            handler: None,
            establisher_frame,
        });
    }

    let handler = info.handler_rva.map(|rva| LanguageHandler {
        address: base + rva as u64,
        data: info.handler_data_address,
    });
    Ok(Unwound {
        handler,
        establisher_frame,
    })
}
