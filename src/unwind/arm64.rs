//! aarch64 table-driven unwind: packed and full xdata forms.

use tracing::{trace, warn};

use crate::context::{Arm64Context, CONTEXT_ARM64_UNWOUND_TO_CALL};
use crate::error::{Result, Status};
use crate::memory::MemorySource;
use crate::unwind::{Arm64NonvolatileSlots, LanguageHandler, Unwound};

/// Partial prologue replay counts sequence codes differently from the skip
/// loop that consumes them: the sequence length excludes the custom-frame
/// codes (0xe8..0xef) while the skip loop steps over them one skip each, so
/// a prologue containing one lands one code off. Shipping unwinders behave
/// this way, so it is kept as platform behavior rather than corrected;
/// conformance tooling may depend on it.
pub const QUIRK_CUSTOM_FRAME_OFF_BY_ONE: bool = true;

/// One entry of the aarch64 function table: a begin RVA plus a second word
/// that is either a packed-unwind bitfield (low bits non-zero) or the RVA
/// of an xdata record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arm64RuntimeFunction {
    pub begin_address: u32,
    pub data: u32,
}

impl Arm64RuntimeFunction {
    pub fn flag(&self) -> u32 {
        self.data & 0x3
    }

    pub fn unwind_rva(&self) -> u32 {
        self.data
    }

    // packed-form fields
    pub fn function_length(&self) -> u32 {
        (self.data >> 2) & 0x7ff
    }

    pub fn reg_f(&self) -> u32 {
        (self.data >> 13) & 0x7
    }

    pub fn reg_i(&self) -> u32 {
        (self.data >> 16) & 0xf
    }

    pub fn h(&self) -> u32 {
        (self.data >> 20) & 0x1
    }

    pub fn cr(&self) -> u32 {
        (self.data >> 21) & 0x3
    }

    pub fn frame_size(&self) -> u32 {
        (self.data >> 23) & 0x1ff
    }
}

fn unwind_code_len(byte: u8) -> usize {
    match byte {
        0xc0..=0xdf => 2,
        0xe0 => 4,
        0xe2 => 2,
        0xe7 => 3,
        _ => 1,
    }
}

fn get_sequence_len(codes: &[u8], start: usize) -> usize {
    let mut len = 0;
    let mut i = start;
    while i < codes.len() {
        if codes[i] == 0xe4 || codes[i] == 0xe5 {
            break;
        }
        if !QUIRK_CUSTOM_FRAME_OFF_BY_ONE || codes[i] & 0xf8 != 0xe8 {
            len += 1; /* custom stack frames don't count */
        }
        i += unwind_code_len(codes[i]);
    }
    len
}

type SlotsRef<'a, 'b> = &'a mut Option<&'b mut Arm64NonvolatileSlots>;

fn restore_regs(
    reg: usize,
    count: usize,
    pos: i32,
    context: &mut Arm64Context,
    slots: SlotsRef,
    memory: &impl MemorySource,
) -> Result<()> {
    // a decodable register field can still name registers past x30
    if reg + count > context.x.len() {
        return Err(Status::BadFunctionTable);
    }
    let offset = pos.max(0) as u64;
    for i in 0..count {
        let addr = context.sp + 8 * (i as u64 + offset);
        let value = memory.read_memory_data::<u64>(addr)?;
        if let Some(slots) = slots.as_deref_mut() {
            if reg + i >= 19 {
                slots.x[reg + i - 19] = Some(addr);
            }
        }
        context.x[reg + i] = value;
    }
    if pos < 0 {
        context.sp += (-8 * pos) as u64;
    }
    Ok(())
}

fn restore_fpregs(
    reg: usize,
    count: usize,
    pos: i32,
    context: &mut Arm64Context,
    slots: SlotsRef,
    memory: &impl MemorySource,
) -> Result<()> {
    if reg + count > context.v.len() {
        return Err(Status::BadFunctionTable);
    }
    let offset = pos.max(0) as u64;
    for i in 0..count {
        let addr = context.sp + 8 * (i as u64 + offset);
        let value = memory.read_memory_data::<u64>(addr)?;
        if let Some(slots) = slots.as_deref_mut() {
            if (8..16).contains(&(reg + i)) {
                slots.d[reg + i - 8] = Some(addr);
            }
        }
        context.v[reg + i].low = value;
    }
    if pos < 0 {
        context.sp += (-8 * pos) as u64;
    }
    Ok(())
}

fn restore_qregs(
    reg: usize,
    count: usize,
    pos: i32,
    context: &mut Arm64Context,
    slots: SlotsRef,
    memory: &impl MemorySource,
) -> Result<()> {
    if reg + count > context.v.len() {
        return Err(Status::BadFunctionTable);
    }
    let offset = pos.max(0) as u64;
    for i in 0..count {
        let addr = context.sp + 16 * (i as u64 + offset);
        let low = memory.read_memory_data::<u64>(addr)?;
        let high = memory.read_memory_data::<u64>(addr + 8)?;
        if let Some(slots) = slots.as_deref_mut() {
            if reg + i >= 8 && reg + i < 16 {
                slots.d[reg + i - 8] = Some(addr);
            }
        }
        context.v[reg + i].low = low;
        context.v[reg + i].high = high;
    }
    if pos < 0 {
        context.sp += (-16 * pos) as u64;
    }
    Ok(())
}

fn restore_any_reg(
    reg: u8,
    count: usize,
    kind: u8,
    pos: u8,
    context: &mut Arm64Context,
    slots: SlotsRef,
    memory: &impl MemorySource,
) -> Result<()> {
    let mut pos = pos as i32;
    if reg & 0x20 != 0 {
        pos = -pos - 1;
    }
    match kind {
        0 => {
            if count > 1 || pos < 0 {
                pos *= 2;
            }
            restore_regs((reg & 0x1f) as usize, count, pos, context, slots, memory)
        }
        1 => {
            if count > 1 || pos < 0 {
                pos *= 2;
            }
            restore_fpregs((reg & 0x1f) as usize, count, pos, context, slots, memory)
        }
        2 => restore_qregs((reg & 0x1f) as usize, count, pos, context, slots, memory),
        _ => Ok(()),
    }
}

// Serialized Arm64Context field offsets, for the full-context restore code.
const CTX_X_OFFSET: u64 = 8;
const CTX_SP_OFFSET: u64 = 0x100;
const CTX_PC_OFFSET: u64 = 0x108;
const CTX_V_OFFSET: u64 = 0x110;

fn read_full_context(memory: &impl MemorySource, addr: u64) -> Result<Arm64Context> {
    let mut context = Arm64Context {
        flags: memory.read_memory_data::<u32>(addr)?,
        cpsr: memory.read_memory_data::<u32>(addr + 4)?,
        ..Arm64Context::default()
    };
    for i in 0..31 {
        context.x[i] = memory.read_memory_data::<u64>(addr + CTX_X_OFFSET + 8 * i as u64)?;
    }
    context.sp = memory.read_memory_data::<u64>(addr + CTX_SP_OFFSET)?;
    context.pc = memory.read_memory_data::<u64>(addr + CTX_PC_OFFSET)?;
    for i in 0..32 {
        let off = addr + CTX_V_OFFSET + 16 * i as u64;
        context.v[i].low = memory.read_memory_data::<u64>(off)?;
        context.v[i].high = memory.read_memory_data::<u64>(off + 8)?;
    }
    Ok(context)
}

fn process_unwind_codes(
    codes: &[u8],
    start: usize,
    skip: usize,
    context: &mut Arm64Context,
    slots: SlotsRef,
    memory: &impl MemorySource,
    final_pc_from_lr: &mut bool,
) -> Result<()> {
    let mut i = start;
    let mut skip = skip;

    // skip codes
    while i < codes.len() && skip > 0 {
        if codes[i] == 0xe4 {
            break;
        }
        i += unwind_code_len(codes[i]);
        skip -= 1;
    }

    let mut save_next = 2usize;
    while i < codes.len() {
        let byte = codes[i];
        let len = unwind_code_len(byte);
        if i + len > codes.len() {
            break;
        }
        let val = if len > 1 {
            (byte as u32) * 0x100 + codes[i + 1] as u32
        } else {
            byte as u32
        };

        match byte {
            0x00..=0x1f => {
                // alloc_s
                context.sp += 16 * (val & 0x1f) as u64;
            }
            0x20..=0x3f => {
                // save_r19r20_x
                restore_regs(19, save_next, -((val & 0x1f) as i32), context, slots, memory)?;
            }
            0x40..=0x7f => {
                // save_fplr
                restore_regs(29, 2, (val & 0x3f) as i32, context, slots, memory)?;
            }
            0x80..=0xbf => {
                // save_fplr_x
                restore_regs(29, 2, -((val & 0x3f) as i32) - 1, context, slots, memory)?;
            }
            0xc0..=0xc7 => {
                // alloc_m
                context.sp += 16 * (val & 0x7ff) as u64;
            }
            0xc8..=0xcb => {
                // save_regp
                let reg = 19 + ((val >> 6) & 0xf) as usize;
                restore_regs(reg, save_next, (val & 0x3f) as i32, context, slots, memory)?;
            }
            0xcc..=0xcf => {
                // save_regp_x
                let reg = 19 + ((val >> 6) & 0xf) as usize;
                restore_regs(reg, save_next, -((val & 0x3f) as i32) - 1, context, slots, memory)?;
            }
            0xd0..=0xd3 => {
                // save_reg
                let reg = 19 + ((val >> 6) & 0xf) as usize;
                restore_regs(reg, 1, (val & 0x3f) as i32, context, slots, memory)?;
            }
            0xd4..=0xd5 => {
                // save_reg_x
                let reg = 19 + ((val >> 5) & 0xf) as usize;
                restore_regs(reg, 1, -((val & 0x1f) as i32) - 1, context, slots, memory)?;
            }
            0xd6..=0xd7 => {
                // save_lrpair
                let reg = 19 + 2 * ((val >> 6) & 0x7) as usize;
                restore_regs(reg, 1, (val & 0x3f) as i32, context, slots, memory)?;
                restore_regs(30, 1, (val & 0x3f) as i32 + 1, context, slots, memory)?;
            }
            0xd8..=0xd9 => {
                // save_fregp
                let reg = 8 + ((val >> 6) & 0x7) as usize;
                restore_fpregs(reg, save_next, (val & 0x3f) as i32, context, slots, memory)?;
            }
            0xda..=0xdb => {
                // save_fregp_x
                let reg = 8 + ((val >> 6) & 0x7) as usize;
                restore_fpregs(reg, save_next, -((val & 0x3f) as i32) - 1, context, slots, memory)?;
            }
            0xdc..=0xdd => {
                // save_freg
                let reg = 8 + ((val >> 6) & 0x7) as usize;
                restore_fpregs(reg, 1, (val & 0x3f) as i32, context, slots, memory)?;
            }
            0xde => {
                // save_freg_x
                let reg = 8 + ((val >> 5) & 0x7) as usize;
                restore_fpregs(reg, 1, -((val & 0x3f) as i32) - 1, context, slots, memory)?;
            }
            0xe0 => {
                // alloc_l
                let size = ((codes[i + 1] as u64) << 16)
                    + ((codes[i + 2] as u64) << 8)
                    + codes[i + 3] as u64;
                context.sp += 16 * size;
            }
            0xe1 => {
                // set_fp
                context.sp = context.fp();
            }
            0xe2 => {
                // add_fp
                context.sp = context.fp() - 8 * (val & 0xff) as u64;
            }
            0xe3 => {} // nop
            0xe4 => break, // end
            0xe5 => {} // end_c
            0xe6 => {
                // save_next
                save_next += 2;
                i += len;
                continue;
            }
            0xe7 => {
                // save_any_reg
                let count = if codes[i + 1] & 0x40 != 0 { save_next } else { 1 };
                restore_any_reg(
                    codes[i + 1],
                    count,
                    codes[i + 2] >> 6,
                    codes[i + 2] & 0x3f,
                    context,
                    slots,
                    memory,
                )?;
            }
            0xe9 => {
                // machine frame: sp and pc were pushed by a trap
                context.pc = memory.read_memory_data::<u64>(context.sp + 8)?;
                context.sp = memory.read_memory_data::<u64>(context.sp)?;
                context.flags &= !CONTEXT_ARM64_UNWOUND_TO_CALL;
                *final_pc_from_lr = false;
            }
            0xea => {
                // full context pushed on the stack
                let flags = context.flags & !CONTEXT_ARM64_UNWOUND_TO_CALL;
                let addr = context.sp;
                let restored = read_full_context(memory, addr)?;
                if let Some(slots) = slots.as_deref_mut() {
                    for reg in 19..29 {
                        slots.x[reg - 19] = Some(addr + CTX_X_OFFSET + 8 * reg as u64);
                    }
                    for reg in 8..16 {
                        slots.d[reg - 8] = Some(addr + CTX_V_OFFSET + 16 * reg as u64);
                    }
                }
                let restored_flags = restored.flags;
                *context = restored;
                context.flags = flags | (restored_flags & CONTEXT_ARM64_UNWOUND_TO_CALL);
                *final_pc_from_lr = false;
            }
            0xec => {
                // clear unwound-to-call
                context.pc = context.lr();
                context.flags &= !CONTEXT_ARM64_UNWOUND_TO_CALL;
                *final_pc_from_lr = false;
            }
            0xfc => {
                // pac_sign_lr: nothing to strip, the model keeps raw addresses
            }
            _ => {
                warn!(code = byte, "unsupported unwind code");
                return Ok(());
            }
        }
        save_next = 2;
        i += len;
    }
    Ok(())
}

fn unwind_packed(
    base: u64,
    pc: u64,
    func: &Arm64RuntimeFunction,
    context: &mut Arm64Context,
    slots: SlotsRef,
    memory: &impl MemorySource,
) -> Result<()> {
    let mut int_size = func.reg_i() * 8;
    let mut fp_size = func.reg_f() * 8;
    let mut h_size = func.h() * 4;

    trace!(
        begin = base + func.begin_address as u64,
        len = func.function_length(),
        reg_f = func.reg_f(),
        reg_i = func.reg_i(),
        h = func.h(),
        cr = func.cr(),
        frame = func.frame_size(),
        "packed unwind"
    );

    if func.cr() == 1 {
        int_size += 8;
    }
    if func.reg_f() != 0 {
        fp_size += 8;
    }

    let regsave = (int_size + fp_size + 8 * 8 * func.h() + 0xf) & !0xf;
    let local_size = func.frame_size() * 16 - regsave;

    let int_regs = (int_size / 8) as i32;
    let fp_regs = (fp_size / 8) as i32;
    let saved_regs = (regsave / 8) as i32;
    let local_size_regs = (local_size / 8) as i32;

    // check for prolog/epilog
    let mut skip = 0u32;
    if func.flag() == 1 {
        let offset = ((pc - base) as u32 - func.begin_address) / 4;
        if offset < 17 || offset >= func.function_length() - 15 {
            let mut len = (int_size + 8) / 16 + (fp_size + 8) / 16;
            match func.cr() {
                2 | 3 => {
                    if func.cr() == 2 {
                        len += 1; // pacibsp
                    }
                    len += 1; // mov x29,sp
                    len += 1; // stp x29,lr,[sp,0]
                    if local_size > 512 {
                        if local_size != 0 {
                            len += 1; // sub sp,sp,#local_size
                        }
                        if local_size > 4088 {
                            len += 1; // sub sp,sp,#4088
                        }
                    }
                }
                _ => {
                    if local_size != 0 {
                        len += 1; // sub sp,sp,#local_size
                    }
                    if local_size > 4088 {
                        len += 1; // sub sp,sp,#4088
                    }
                }
            }
            if offset < len + h_size {
                // prolog
                skip = len + h_size - offset;
            } else if offset >= func.function_length() - (len + 1) {
                // epilog
                skip = offset - (func.function_length() - (len + 1));
                h_size = 0;
            }
        }
    }

    if skip == 0 {
        if func.cr() == 3 || func.cr() == 2 {
            // mov x29,sp
            context.sp = context.fp();
            restore_regs(29, 2, 0, context, slots, memory)?;
        }
        context.sp += local_size as u64;
        if fp_size != 0 {
            restore_fpregs(8, fp_regs as usize, int_regs, context, slots, memory)?;
        }
        if func.cr() == 1 {
            restore_regs(30, 1, int_regs - 1, context, slots, memory)?;
        }
        restore_regs(19, func.reg_i() as usize, -saved_regs, context, slots, memory)?;
    } else {
        let mut pos = 0u32;

        match func.cr() {
            2 | 3 => {
                // mov x29,sp
                if pos >= skip {
                    context.sp = context.fp();
                }
                pos += 1;
                if local_size <= 512 {
                    // stp x29,lr,[sp,-#local_size]!
                    if pos >= skip {
                        restore_regs(29, 2, -local_size_regs, context, slots, memory)?;
                    }
                    pos += 1;
                } else {
                    // stp x29,lr,[sp,0]
                    if pos >= skip {
                        restore_regs(29, 2, 0, context, slots, memory)?;
                    }
                    pos += 1;
                    if local_size != 0 {
                        // sub sp,sp,#local_size
                        if pos >= skip {
                            context.sp += ((local_size - 1) % 4088 + 1) as u64;
                        }
                        pos += 1;
                        if local_size > 4088 {
                            if pos >= skip {
                                context.sp += 4088;
                            }
                            pos += 1;
                        }
                    }
                }
            }
            _ => {
                if local_size != 0 {
                    // sub sp,sp,#local_size
                    if pos >= skip {
                        context.sp += ((local_size - 1) % 4088 + 1) as u64;
                    }
                    pos += 1;
                    if local_size > 4088 {
                        if pos >= skip {
                            context.sp += 4088;
                        }
                        pos += 1;
                    }
                }
            }
        }

        pos += h_size;

        if fp_size != 0 {
            if func.reg_f() % 2 == 0 {
                // str d%u,[sp,#fp_size]
                if pos >= skip {
                    let reg = 8 + func.reg_f() as usize;
                    restore_fpregs(reg, 1, int_regs + fp_regs - 1, context, slots, memory)?;
                }
                pos += 1;
            }
            for i in (0..(func.reg_f() + 1) / 2).rev() {
                if pos >= skip {
                    if i == 0 && int_size == 0 {
                        // stp d8,d9,[sp,-#regsave]!
                        restore_fpregs(8, 2, -saved_regs, context, slots, memory)?;
                    } else {
                        // stp dn,dn+1,[sp,#offset]
                        let reg = 8 + 2 * i as usize;
                        restore_fpregs(reg, 2, int_regs + 2 * i as i32, context, slots, memory)?;
                    }
                }
                pos += 1;
            }
        }

        if func.reg_i() % 2 != 0 {
            if pos >= skip {
                // stp xn,lr,[sp,#offset]
                if func.cr() == 1 {
                    restore_regs(30, 1, int_regs - 1, context, slots, memory)?;
                }
                // str xn,[sp,#offset]
                let reg = 18 + func.reg_i() as usize;
                let at = if func.reg_i() > 1 {
                    func.reg_i() as i32 - 1
                } else {
                    -saved_regs
                };
                restore_regs(reg, 1, at, context, slots, memory)?;
            }
            pos += 1;
        } else if func.cr() == 1 {
            // str lr,[sp,#offset]
            if pos >= skip {
                let at = if func.reg_i() != 0 { int_regs - 1 } else { -saved_regs };
                restore_regs(30, 1, at, context, slots, memory)?;
            }
            pos += 1;
        }

        for i in (0..func.reg_i() / 2).rev() {
            if pos >= skip {
                if i != 0 {
                    // stp xn,xn+1,[sp,#offset]
                    let reg = 19 + 2 * i as usize;
                    restore_regs(reg, 2, 2 * i as i32, context, slots, memory)?;
                } else {
                    // stp x19,x20,[sp,-#regsave]!
                    restore_regs(19, 2, -saved_regs, context, slots, memory)?;
                }
            }
            pos += 1;
        }
    }
    Ok(())
}

fn unwind_full(
    base: u64,
    pc: u64,
    func: &Arm64RuntimeFunction,
    context: &mut Arm64Context,
    slots: SlotsRef,
    memory: &impl MemorySource,
    final_pc_from_lr: &mut bool,
) -> Result<Option<LanguageHandler>> {
    let info_addr = base + func.unwind_rva() as u64;
    let header = memory.read_memory_data::<u32>(info_addr)?;
    let function_length = header & 0x3ffff;
    let exception_data_present = (header >> 20) & 1 != 0;
    let epilog_in_header = (header >> 21) & 1 != 0;
    let mut epilogs = ((header >> 22) & 0x1f) as usize;
    let mut codes = ((header >> 27) & 0x1f) as usize;

    let mut data_addr = info_addr + 4;
    if codes == 0 && epilogs == 0 {
        // extension word
        let ext = memory.read_memory_data::<u32>(data_addr)?;
        epilogs = (ext & 0xffff) as usize;
        codes = ((ext >> 16) & 0xff) as usize;
        data_addr += 4;
    }
    let epilog_addr = data_addr;
    if !epilog_in_header {
        data_addr += 4 * epilogs as u64;
    }

    let offset = (((pc - base) as u32 - func.begin_address) / 4) as usize;
    let code_bytes = memory.read_memory_full_array::<u8>(data_addr, codes * 4)?;

    trace!(
        begin = base + func.begin_address as u64,
        len = function_length,
        epilogs,
        code_bytes = codes * 4,
        "full unwind data"
    );

    // check for prolog
    if offset < codes * 4 {
        let len = get_sequence_len(&code_bytes, 0);
        if offset < len {
            process_unwind_codes(
                &code_bytes,
                0,
                len - offset,
                context,
                slots,
                memory,
                final_pc_from_lr,
            )?;
            return Ok(None);
        }
    }

    // check for epilog
    if !epilog_in_header {
        for i in 0..epilogs {
            let scope = memory.read_memory_data::<u32>(epilog_addr + 4 * i as u64)?;
            let scope_offset = (scope & 0x3ffff) as usize;
            let scope_index = ((scope >> 22) & 0x3ff) as usize;
            if offset < scope_offset {
                break;
            }
            if offset - scope_offset < codes * 4 - scope_index {
                let len = get_sequence_len(&code_bytes, scope_index);
                if offset <= scope_offset + len {
                    process_unwind_codes(
                        &code_bytes,
                        scope_index,
                        offset - scope_offset,
                        context,
                        slots,
                        memory,
                        final_pc_from_lr,
                    )?;
                    return Ok(None);
                }
            }
        }
    } else if function_length as usize - offset <= codes * 4 - epilogs {
        let start = epilogs;
        let len = get_sequence_len(&code_bytes, start) + 1;
        if offset >= function_length as usize - len {
            process_unwind_codes(
                &code_bytes,
                start,
                offset - (function_length as usize - len),
                context,
                slots,
                memory,
                final_pc_from_lr,
            )?;
            return Ok(None);
        }
    }

    process_unwind_codes(&code_bytes, 0, 0, context, slots, memory, final_pc_from_lr)?;

    // get handler since we are inside the main code
    if exception_data_present {
        let handler_rva_addr = data_addr + (codes * 4) as u64;
        let handler_rva = memory.read_memory_data::<u32>(handler_rva_addr)?;
        return Ok(Some(LanguageHandler {
            address: base + handler_rva as u64,
            data: handler_rva_addr + 4,
        }));
    }
    Ok(None)
}

/// Advance `context` from the frame containing `pc` to its caller's frame.
///
/// A missing function entry means a leaf: the return address is still in
/// the link register, and a leaf whose PC already equals the link register
/// cannot be unwound further.
pub fn virtual_unwind_arm64(
    base: u64,
    pc: u64,
    function: Option<Arm64RuntimeFunction>,
    context: &mut Arm64Context,
    memory: &impl MemorySource,
    mut slots: Option<&mut Arm64NonvolatileSlots>,
) -> Result<Unwound> {
    trace!(base, pc, rva = pc - base, sp = context.sp, "virtual unwind");

    if function.is_none() && pc == context.lr() {
        return Err(Status::BadFunctionTable); // invalid leaf function
    }

    context.flags |= CONTEXT_ARM64_UNWOUND_TO_CALL;

    let mut final_pc_from_lr = true;
    let handler = match &function {
        None => None, // leaf function
        Some(func) if func.flag() != 0 => {
            unwind_packed(base, pc, func, context, &mut slots, memory)?;
            None
        }
        Some(func) => unwind_full(
            base,
            pc,
            func,
            context,
            &mut slots,
            memory,
            &mut final_pc_from_lr,
        )?,
    };

    if final_pc_from_lr {
        context.pc = context.lr();
    }

    Ok(Unwound {
        handler,
        establisher_frame: context.sp,
    })
}
