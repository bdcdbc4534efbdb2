//! Exception records and the dispatch state machine.
//!
//! Dispatch order on the first chance: debugger, vectored handlers, then
//! the frame walk. On exhaustion: vectored continue handlers, debugger
//! second chance, unhandled filter, termination.

use std::rc::Rc;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::context::Context;
use crate::dispatch::cursor::{CursorEnv, FrameCursor};
use crate::error::{Result, Status};
use crate::tables::RuntimeFunction;
use crate::thread::ThreadId;
use crate::Machine;

pub mod cursor;

/// Hard cap on the parameter array of one record.
pub const MAXIMUM_PARAMETERS: usize = 15;

/// Fault address reported when the hardware cannot produce one, e.g. a
/// segment-limit violation indistinguishable from an out-of-range access.
pub const NO_FAULT_ADDRESS: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    GuardPageViolation,
    DatatypeMisalignment,
    Breakpoint,
    SingleStep,
    LongJump,
    UnwindConsolidate,
    AccessViolation,
    InvalidHandle,
    IllegalInstruction,
    NoncontinuableException,
    InvalidDisposition,
    Unwind,
    ArrayBoundsExceeded,
    FloatDenormalOperand,
    FloatDivideByZero,
    FloatInexactResult,
    FloatInvalidOperation,
    FloatOverflow,
    FloatStackCheck,
    FloatUnderflow,
    IntegerDivideByZero,
    IntegerOverflow,
    PrivilegedInstruction,
    StackOverflow,
    FloatMultipleFaults,
    FloatMultipleTraps,
    Other(u32),
}

impl ExceptionCode {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::GuardPageViolation => 0x8000_0001,
            Self::DatatypeMisalignment => 0x8000_0002,
            Self::Breakpoint => 0x8000_0003,
            Self::SingleStep => 0x8000_0004,
            Self::LongJump => 0x8000_0026,
            Self::UnwindConsolidate => 0x8000_0029,
            Self::AccessViolation => 0xc000_0005,
            Self::InvalidHandle => 0xc000_0008,
            Self::IllegalInstruction => 0xc000_001d,
            Self::NoncontinuableException => 0xc000_0025,
            Self::InvalidDisposition => 0xc000_0026,
            Self::Unwind => 0xc000_0027,
            Self::ArrayBoundsExceeded => 0xc000_008c,
            Self::FloatDenormalOperand => 0xc000_008d,
            Self::FloatDivideByZero => 0xc000_008e,
            Self::FloatInexactResult => 0xc000_008f,
            Self::FloatInvalidOperation => 0xc000_0090,
            Self::FloatOverflow => 0xc000_0091,
            Self::FloatStackCheck => 0xc000_0092,
            Self::FloatUnderflow => 0xc000_0093,
            Self::IntegerDivideByZero => 0xc000_0094,
            Self::IntegerOverflow => 0xc000_0095,
            Self::PrivilegedInstruction => 0xc000_0096,
            Self::StackOverflow => 0xc000_00fd,
            Self::FloatMultipleFaults => 0xc000_02b4,
            Self::FloatMultipleTraps => 0xc000_02b5,
            Self::Other(code) => code,
        }
    }
}

bitflags! {
    /// Record flag bits; unwind-pass bits tell a handler which callback
    /// contract is in force.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExceptionFlags: u32 {
        const NONCONTINUABLE  = 0x01;
        const UNWINDING       = 0x02;
        const EXIT_UNWIND     = 0x04;
        const NESTED_CALL     = 0x10;
        const TARGET_UNWIND   = 0x20;
        const COLLIDED_UNWIND = 0x40;
    }
}

/// What happened: a status code, where, and how.
#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    pub code: ExceptionCode,
    pub flags: ExceptionFlags,
    /// Outer record that was being handled when this one was raised.
    pub nested: Option<Box<ExceptionRecord>>,
    pub address: u64,
    pub parameters: Vec<u64>,
}

impl ExceptionRecord {
    pub fn new(code: ExceptionCode, address: u64) -> Self {
        Self {
            code,
            flags: ExceptionFlags::empty(),
            nested: None,
            address,
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(code: ExceptionCode, address: u64, parameters: &[u64]) -> Result<Self> {
        if parameters.len() > MAXIMUM_PARAMETERS {
            return Err(Status::InvalidParameter);
        }
        Ok(Self {
            code,
            flags: ExceptionFlags::empty(),
            nested: None,
            address,
            parameters: parameters.to_vec(),
        })
    }

    pub fn noncontinuable(mut self) -> Self {
        self.flags |= ExceptionFlags::NONCONTINUABLE;
        self
    }
}

/// What a frame handler told the dispatcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    ContinueExecution,
    ContinueSearch,
    NestedException,
    CollidedUnwind,
}

/// A frame handler either returns a disposition or faults itself, raising
/// a nested exception the dispatcher has to deal with.
pub enum HandlerOutcome {
    Disposition(Disposition),
    Raise(ExceptionRecord),
}

/// Per-invocation bookkeeping handed to a frame handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherContext {
    pub control_pc: u64,
    pub image_base: u64,
    pub function_entry: Option<RuntimeFunction>,
    pub establisher_frame: u64,
    pub target_pc: u64,
    pub handler_data: u64,
}

/// A frame-based or table-located language handler.
///
/// Implemented by closures in tests; the blanket impl keeps registration
/// sites free of adapter boilerplate.
pub trait FrameHandler {
    fn invoke(
        &self,
        record: &ExceptionRecord,
        frame: u64,
        context: &mut Context,
        dispatch: &mut DispatcherContext,
    ) -> HandlerOutcome;
}

impl<F> FrameHandler for F
where
    F: Fn(&ExceptionRecord, u64, &mut Context, &mut DispatcherContext) -> HandlerOutcome,
{
    fn invoke(
        &self,
        record: &ExceptionRecord,
        frame: u64,
        context: &mut Context,
        dispatch: &mut DispatcherContext,
    ) -> HandlerOutcome {
        self(record, frame, context, dispatch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectoredDisposition {
    ContinueExecution,
    ContinueSearch,
}

pub type VectoredHandler = Rc<dyn Fn(&ExceptionRecord, &mut Context) -> VectoredDisposition>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerVerdict {
    Handled,
    NotHandled,
}

/// The attached debugger, seen from the dispatcher: two notification
/// points, each allowed to rewrite the context it is shown.
pub trait DebuggerPort {
    fn first_chance(&mut self, record: &ExceptionRecord, context: &mut Context) -> DebuggerVerdict;
    fn second_chance(&mut self, record: &ExceptionRecord, context: &mut Context) -> DebuggerVerdict;
}

/// Last-resort filter consulted when nothing else claimed the exception.
pub type UnhandledFilter = Rc<dyn Fn(&ExceptionRecord, &mut Context) -> VectoredDisposition>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// Frame-chain dispatch, one-byte trap instruction.
    X86,
    /// Table-driven dispatch, one-byte trap instruction.
    X64,
    /// Table-driven dispatch, four-byte trap instruction.
    Arm64,
}

impl Arch {
    pub fn trap_instruction_len(self) -> u64 {
        match self {
            Arch::X86 | Arch::X64 => 1,
            Arch::Arm64 => 4,
        }
    }
}

/// How a dispatch episode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// A handler (or the debugger) claimed it; the thread context has been
    /// updated and execution resumes there.
    Continue,
    /// Nothing claimed it; the process exits with the exception code.
    Terminated { code: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    fn parameter(self) -> u64 {
        match self {
            AccessKind::Read => 0,
            AccessKind::Write => 1,
            AccessKind::Execute => 8,
        }
    }
}

/// A hardware trap, before classification into an exception code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    PageFault { address: u64, access: AccessKind },
    /// Segment-limit style fault where no linear address is available.
    SegmentLimit,
    GeneralProtection { privileged_instruction: bool },
    Breakpoint,
    SingleStep,
    DivideByZero,
    Overflow,
    ArrayBounds,
    IllegalInstruction,
    Alignment,
    StackOverflow,
    /// x87 fault; the status word picks the precise code.
    FpuFault { status: u16 },
    SimdFault,
}

fn fpu_code(status: u16) -> ExceptionCode {
    if status & 0x01 != 0 {
        // invalid operation; stack fault bit refines it
        if status & 0x40 != 0 {
            return ExceptionCode::FloatStackCheck;
        }
        return ExceptionCode::FloatInvalidOperation;
    }
    if status & 0x02 != 0 {
        return ExceptionCode::FloatDenormalOperand;
    }
    if status & 0x04 != 0 {
        return ExceptionCode::FloatDivideByZero;
    }
    if status & 0x08 != 0 {
        return ExceptionCode::FloatOverflow;
    }
    if status & 0x10 != 0 {
        return ExceptionCode::FloatUnderflow;
    }
    if status & 0x20 != 0 {
        return ExceptionCode::FloatInexactResult;
    }
    ExceptionCode::FloatInvalidOperation
}

/// Classify a trap into exactly one exception record with its
/// code-specific parameter list.
pub fn record_for_fault(fault: Fault, pc: u64) -> ExceptionRecord {
    match fault {
        Fault::PageFault { address, access } => {
            let mut record = ExceptionRecord::new(ExceptionCode::AccessViolation, pc);
            record.parameters = vec![access.parameter(), address];
            record
        }
        Fault::SegmentLimit => {
            let mut record = ExceptionRecord::new(ExceptionCode::AccessViolation, pc);
            record.parameters = vec![0, NO_FAULT_ADDRESS];
            record
        }
        Fault::GeneralProtection {
            privileged_instruction: true,
        } => ExceptionRecord::new(ExceptionCode::PrivilegedInstruction, pc),
        Fault::GeneralProtection {
            privileged_instruction: false,
        } => {
            let mut record = ExceptionRecord::new(ExceptionCode::AccessViolation, pc);
            record.parameters = vec![0, NO_FAULT_ADDRESS];
            record
        }
        Fault::Breakpoint => {
            let mut record = ExceptionRecord::new(ExceptionCode::Breakpoint, pc);
            record.parameters = vec![0];
            record
        }
        Fault::SingleStep => ExceptionRecord::new(ExceptionCode::SingleStep, pc),
        Fault::DivideByZero => ExceptionRecord::new(ExceptionCode::IntegerDivideByZero, pc),
        Fault::Overflow => ExceptionRecord::new(ExceptionCode::IntegerOverflow, pc),
        Fault::ArrayBounds => ExceptionRecord::new(ExceptionCode::ArrayBoundsExceeded, pc),
        Fault::IllegalInstruction => ExceptionRecord::new(ExceptionCode::IllegalInstruction, pc),
        Fault::Alignment => ExceptionRecord::new(ExceptionCode::DatatypeMisalignment, pc),
        Fault::StackOverflow => ExceptionRecord::new(ExceptionCode::StackOverflow, pc),
        Fault::FpuFault { status } => ExceptionRecord::new(fpu_code(status), pc),
        Fault::SimdFault => {
            let mut record = ExceptionRecord::new(ExceptionCode::FloatMultipleTraps, pc);
            record.parameters = vec![0];
            record
        }
    }
}

enum WalkOutcome {
    Resume,
    Exhausted,
    Noncontinuable,
}

impl Machine {
    /// Dispatch an already-built record against `context`.
    ///
    /// Malformed records fail synchronously; otherwise the episode runs to
    /// a resumption or termination decision and the thread context is
    /// updated accordingly.
    pub fn raise_exception(
        &mut self,
        thread: ThreadId,
        record: ExceptionRecord,
        context: Context,
        first_chance: bool,
    ) -> Result<Resumption> {
        if record.parameters.len() > MAXIMUM_PARAMETERS {
            return Err(Status::InvalidParameter);
        }
        self.dispatch_exception(thread, record, context, first_chance)
    }

    /// Raise an exception "from code", capturing the thread's own context.
    ///
    /// For the breakpoint code only, the reported PC is backed up over the
    /// trap instruction; every other code reports the raw PC.
    pub fn raise_software_exception(
        &mut self,
        thread: ThreadId,
        code: ExceptionCode,
        parameters: &[u64],
    ) -> Result<Resumption> {
        let mut context = self.thread(thread)?.context;
        let record = ExceptionRecord::with_parameters(code, context.rip, parameters)?;
        if code == ExceptionCode::Breakpoint {
            context.rip -= self.arch.trap_instruction_len();
        }
        self.dispatch_exception(thread, record, context, true)
    }

    /// Entry point for hardware traps: classify, fix up the breakpoint
    /// address, dispatch.
    pub fn raise_fault(&mut self, thread: ThreadId, fault: Fault) -> Result<Resumption> {
        let context = self.thread(thread)?.context;
        let mut record = record_for_fault(fault, context.rip);
        if record.code == ExceptionCode::Breakpoint {
            // the CPU reports the PC after the trap instruction
            record.address = context.rip - self.arch.trap_instruction_len();
        }
        self.dispatch_exception(thread, record, context, true)
    }

    fn dispatch_exception(
        &mut self,
        thread: ThreadId,
        record: ExceptionRecord,
        mut context: Context,
        first_chance: bool,
    ) -> Result<Resumption> {
        debug!(code = record.code.as_u32(), address = record.address, first_chance, "dispatch");
        let raised_dr6 = context.dr6;

        if first_chance {
            if let Some(debugger) = self.debugger.as_mut() {
                let mut debugger_context = context;
                match debugger.first_chance(&record, &mut debugger_context) {
                    DebuggerVerdict::Handled => {
                        return self.resume(thread, debugger_context, &record, raised_dr6);
                    }
                    DebuggerVerdict::NotHandled => {
                        // Mainline behavior: the debugger's edits are not
                        // shown to in-process handlers on the first pass.
                        if self.debugger_edits_visible {
                            context = debugger_context;
                        }
                    }
                }
            }

            let handlers: Vec<VectoredHandler> = self
                .vectored_exception
                .iter()
                .map(|(_, handler)| Rc::clone(handler))
                .collect();
            for handler in handlers {
                if handler(&record, &mut context) == VectoredDisposition::ContinueExecution {
                    return self.resume(thread, context, &record, raised_dr6);
                }
            }

            match self.walk_frames(thread, &record, &mut context, None)? {
                WalkOutcome::Resume => return self.resume(thread, context, &record, raised_dr6),
                WalkOutcome::Exhausted => {}
                WalkOutcome::Noncontinuable => {
                    if record.code == ExceptionCode::NoncontinuableException {
                        return Ok(Resumption::Terminated {
                            code: record.code.as_u32(),
                        });
                    }
                    let mut fatal =
                        ExceptionRecord::new(ExceptionCode::NoncontinuableException, record.address)
                            .noncontinuable();
                    fatal.nested = Some(Box::new(record));
                    return self.dispatch_exception(thread, fatal, context, true);
                }
            }
        }

        // continue pass
        let handlers: Vec<VectoredHandler> = self
            .vectored_continue
            .iter()
            .map(|(_, handler)| Rc::clone(handler))
            .collect();
        for handler in handlers {
            if handler(&record, &mut context) == VectoredDisposition::ContinueExecution {
                return self.resume(thread, context, &record, raised_dr6);
            }
        }

        if let Some(debugger) = self.debugger.as_mut() {
            let mut debugger_context = context;
            if debugger.second_chance(&record, &mut debugger_context) == DebuggerVerdict::Handled {
                return self.resume(thread, debugger_context, &record, raised_dr6);
            }
        }

        if let Some(filter) = self.unhandled_filter.clone() {
            if filter(&record, &mut context) == VectoredDisposition::ContinueExecution {
                return self.resume(thread, context, &record, raised_dr6);
            }
        }

        debug!(code = record.code.as_u32(), "unhandled exception");
        Ok(Resumption::Terminated {
            code: record.code.as_u32(),
        })
    }

    /// Walk the frame chain (or the function tables) outward, invoking
    /// each candidate handler until one claims the exception.
    fn walk_frames(
        &self,
        thread: ThreadId,
        record: &ExceptionRecord,
        context: &mut Context,
        nested_frame: Option<u64>,
    ) -> Result<WalkOutcome> {
        let mut walker = self.make_cursor(thread, context)?;
        let mut carried = ExceptionFlags::empty();
        loop {
            let step = {
                let env = CursorEnv {
                    tables: &self.tables,
                    memory: &self.memory,
                    handlers: &self.language_handlers,
                };
                walker.next_frame(&env)?
            };
            let Some(step) = step else {
                return Ok(WalkOutcome::Exhausted);
            };

            let mut invoked = record.clone();
            invoked.flags |= carried;
            if nested_frame == Some(step.dispatch.establisher_frame) {
                invoked.flags |= ExceptionFlags::NESTED_CALL;
            }
            let mut dispatch = step.dispatch;
            trace!(
                frame = dispatch.establisher_frame,
                control_pc = dispatch.control_pc,
                "invoking frame handler"
            );
            match step
                .handler
                .invoke(&invoked, dispatch.establisher_frame, context, &mut dispatch)
            {
                HandlerOutcome::Disposition(Disposition::ContinueExecution) => {
                    if record.flags.contains(ExceptionFlags::NONCONTINUABLE) {
                        return Ok(WalkOutcome::Noncontinuable);
                    }
                    return Ok(WalkOutcome::Resume);
                }
                HandlerOutcome::Disposition(Disposition::ContinueSearch) => {}
                HandlerOutcome::Disposition(Disposition::NestedException) => {
                    // outer frames keep seeing the nested-call flag
                    carried |= ExceptionFlags::NESTED_CALL;
                }
                HandlerOutcome::Disposition(Disposition::CollidedUnwind) => {
                    return Err(Status::InvalidDisposition);
                }
                HandlerOutcome::Raise(mut nested) => {
                    // the handler itself faulted; dispatch the nested
                    // exception, marking the frame it came from
                    nested.nested = Some(Box::new(record.clone()));
                    return self.walk_frames(
                        thread,
                        &nested,
                        context,
                        Some(step.dispatch.establisher_frame),
                    );
                }
            }
        }
    }

    fn resume(
        &mut self,
        thread_id: ThreadId,
        mut context: Context,
        record: &ExceptionRecord,
        raised_dr6: u64,
    ) -> Result<Resumption> {
        if record.code == ExceptionCode::SingleStep && context.dr6 == raised_dr6 {
            // stale trap status must not leak into the next episode; a
            // handler that rewrote dr6 keeps its value
            context.dr6 = 0;
        }
        self.thread_mut(thread_id)?.context = context;
        self.drain_apcs(thread_id)?;
        Ok(Resumption::Continue)
    }
}
