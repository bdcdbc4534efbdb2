//! Extended (X-state) context layout.
//!
//! A context buffer holds the base CONTEXT image, a CONTEXT_EX chunk table,
//! and an XSAVE area: 512 bytes of legacy FP/SSE state, a 64-byte header
//! whose first quadword is the per-feature validity mask, then one area per
//! enabled feature. The XSAVE area is 64-byte aligned and the compaction
//! mask's high bit selects the compacted form.

use crate::context::ContextFlags;
use crate::error::{Result, Status};

/// Size of the serialized base CONTEXT image (AMD64 ABI).
pub const CONTEXT_IMAGE_SIZE: usize = 0x4d0;
/// Byte offset of ContextFlags inside the CONTEXT image.
pub const CONTEXT_FLAGS_OFFSET: usize = 0x30;
/// CONTEXT_EX: three {offset, length} chunks.
pub const CONTEXT_EX_SIZE: usize = 24;

pub const XSAVE_LEGACY_SIZE: usize = 512;
pub const XSAVE_HEADER_SIZE: usize = 64;
pub const XSTATE_ALIGN: usize = 64;

pub const XSTATE_LEGACY_FLOATING_POINT: u32 = 0;
pub const XSTATE_LEGACY_SSE: u32 = 1;
pub const XSTATE_AVX: u32 = 2;
pub const XSTATE_MPX_BNDREGS: u32 = 3;
pub const XSTATE_MPX_BNDCSR: u32 = 4;
pub const XSTATE_AVX512_KMASK: u32 = 5;
pub const XSTATE_AVX512_ZMM_H: u32 = 6;
pub const XSTATE_AVX512_ZMM: u32 = 7;

/// High bit of the compaction mask: the compacted XSAVE form is in use.
pub const COMPACTION_FORMAT: u64 = 1 << 63;

/// Bits 0 and 1 are the always-present legacy components; feature-presence
/// comparisons must exclude them.
pub fn supported_features(mask: u64) -> u64 {
    mask & !3 & !COMPACTION_FORMAT
}

fn feature_size(feature: u32) -> Option<usize> {
    Some(match feature {
        XSTATE_AVX => 256,
        XSTATE_MPX_BNDREGS => 64,
        XSTATE_MPX_BNDCSR => 64,
        XSTATE_AVX512_KMASK => 64,
        XSTATE_AVX512_ZMM_H => 512,
        XSTATE_AVX512_ZMM => 1024,
        _ => return None,
    })
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Resolved layout of a context buffer, as produced by
/// [`initialize_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLayout {
    pub total_len: usize,
    pub ex_offset: usize,
    pub xsave_offset: usize,
    pub xsave_len: usize,
    pub compaction_mask: u64,
}

fn required_len(flags: ContextFlags, compaction_mask: u64) -> usize {
    if !flags.contains(ContextFlags::XSTATE & !ContextFlags::AMD64) {
        return CONTEXT_IMAGE_SIZE + CONTEXT_EX_SIZE;
    }
    let xsave_offset = align_up(CONTEXT_IMAGE_SIZE + CONTEXT_EX_SIZE, XSTATE_ALIGN);
    let mut len = XSAVE_LEGACY_SIZE + XSAVE_HEADER_SIZE;
    for feature in XSTATE_AVX..=XSTATE_AVX512_ZMM {
        if supported_features(compaction_mask) & (1 << feature) != 0 {
            if let Some(size) = feature_size(feature) {
                len = align_up(len, XSTATE_ALIGN) + size;
            }
        }
    }
    xsave_offset + len
}

/// Lay out a context plus trailing CONTEXT_EX/XSTATE inside `buffer`.
///
/// Fails with `InsufficientBuffer` reporting the exact required length if
/// the buffer is too small. On success the base image's flags field is
/// initialized and the XSAVE feature mask starts out clear (INIT state for
/// every feature).
pub fn initialize_context(
    buffer: &mut [u8],
    flags: ContextFlags,
    compaction_mask: u64,
) -> Result<ContextLayout> {
    if !flags.contains(ContextFlags::AMD64) {
        return Err(Status::InvalidParameter);
    }
    let required = required_len(flags, compaction_mask);
    if buffer.len() < required {
        return Err(Status::InsufficientBuffer { required });
    }

    let has_xstate = flags.contains(ContextFlags::XSTATE & !ContextFlags::AMD64);
    let ex_offset = CONTEXT_IMAGE_SIZE;
    let xsave_offset = if has_xstate {
        align_up(CONTEXT_IMAGE_SIZE + CONTEXT_EX_SIZE, XSTATE_ALIGN)
    } else {
        0
    };
    let layout = ContextLayout {
        total_len: required,
        ex_offset,
        xsave_offset,
        xsave_len: if has_xstate { required - xsave_offset } else { 0 },
        compaction_mask: if has_xstate { compaction_mask } else { 0 },
    };

    buffer[..required].fill(0);
    buffer[CONTEXT_FLAGS_OFFSET..CONTEXT_FLAGS_OFFSET + 4]
        .copy_from_slice(&flags.bits().to_le_bytes());
    if has_xstate && compaction_mask & COMPACTION_FORMAT != 0 {
        // XCOMP_BV sits in the second header quadword.
        let off = xsave_offset + XSAVE_LEGACY_SIZE + 8;
        buffer[off..off + 8].copy_from_slice(&compaction_mask.to_le_bytes());
    }
    Ok(layout)
}

/// Locate a feature's area inside the buffer, as `(offset, length)`.
///
/// Returns `None` for features the layout does not carry. The legacy
/// FP/SSE components resolve into the 512-byte legacy area.
pub fn locate_extended_feature(layout: &ContextLayout, feature: u32) -> Option<(usize, usize)> {
    if layout.xsave_len == 0 {
        return None;
    }
    match feature {
        XSTATE_LEGACY_FLOATING_POINT => return Some((layout.xsave_offset, 160)),
        XSTATE_LEGACY_SSE => return Some((layout.xsave_offset + 160, 256)),
        _ => {}
    }
    if supported_features(layout.compaction_mask) & (1u64 << feature) == 0 {
        return None;
    }
    let size = feature_size(feature)?;
    let mut off = XSAVE_LEGACY_SIZE + XSAVE_HEADER_SIZE;
    for lower in XSTATE_AVX..feature {
        if supported_features(layout.compaction_mask) & (1 << lower) != 0 {
            if let Some(lower_size) = feature_size(lower) {
                off = align_up(off, XSTATE_ALIGN) + lower_size;
            }
        }
    }
    off = align_up(off, XSTATE_ALIGN);
    Some((layout.xsave_offset + off, size))
}

fn mask_offset(layout: &ContextLayout) -> usize {
    layout.xsave_offset + XSAVE_LEGACY_SIZE
}

/// Read the per-feature validity mask. A clear bit means the feature is in
/// INIT state: its contents are architecturally zero no matter what the
/// buffer bytes say.
pub fn get_extended_features_mask(buffer: &[u8], layout: &ContextLayout) -> u64 {
    if layout.xsave_len == 0 {
        return 0;
    }
    let off = mask_offset(layout);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[off..off + 8]);
    u64::from_le_bytes(bytes) & !3
}

/// Write the per-feature validity mask.
///
/// Setting any feature bit materializes the floating-point sub-group as
/// well: the legacy flag bit is ORed into the base image's flags. Masks
/// naming features the layout does not carry are rejected.
pub fn set_extended_features_mask(
    buffer: &mut [u8],
    layout: &ContextLayout,
    mask: u64,
) -> Result<()> {
    if layout.xsave_len == 0 {
        return Err(Status::InvalidParameter);
    }
    let mask = mask & !3;
    if mask & !supported_features(layout.compaction_mask) != 0 {
        return Err(Status::InvalidParameter);
    }
    let off = mask_offset(layout);
    buffer[off..off + 8].copy_from_slice(&mask.to_le_bytes());

    if mask != 0 {
        let mut flag_bytes = [0u8; 4];
        flag_bytes.copy_from_slice(&buffer[CONTEXT_FLAGS_OFFSET..CONTEXT_FLAGS_OFFSET + 4]);
        let flags = u32::from_le_bytes(flag_bytes) | ContextFlags::FLOATING_POINT.bits();
        buffer[CONTEXT_FLAGS_OFFSET..CONTEXT_FLAGS_OFFSET + 4]
            .copy_from_slice(&flags.to_le_bytes());
    }
    Ok(())
}
