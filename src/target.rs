//! Unwinding as a control transfer: tear frames down to a chosen target
//! and resume there, or restore a previously captured context outright.

use std::rc::Rc;

use tracing::{debug, trace};

use crate::context::{Arm64Context, Context};
use crate::dispatch::{
    Arch, DispatcherContext, Disposition, ExceptionCode, ExceptionFlags, ExceptionRecord,
    HandlerOutcome, Resumption,
};
use crate::error::{Result, Status};
use crate::thread::ThreadId;
use crate::unwind::{arm64, x64, UnwindFlags};
use crate::Machine;

/// Picks the resume address for a consolidation unwind; the record is the
/// one the unwind was started with.
pub type ConsolidateCallback = Rc<dyn Fn(&ExceptionRecord) -> u64>;

// _JUMP_BUFFER field order, in units of eight bytes.
const JB_RBX: u64 = 1;
const JB_RSP: u64 = 2;
const JB_RBP: u64 = 3;
const JB_RSI: u64 = 4;
const JB_RDI: u64 = 5;
const JB_R12: u64 = 6;
const JB_R13: u64 = 7;
const JB_R14: u64 = 8;
const JB_R15: u64 = 9;
const JB_RIP: u64 = 10;

impl Machine {
    /// Unwind the thread to `target_frame`, invoking every intervening
    /// unwind handler exactly once with the unwinding flag set, then
    /// resume at `target_pc` with `return_value` in the return register.
    ///
    /// `target_frame` of `None` is an exit unwind: every frame is torn
    /// down. A consolidate record replaces `target_pc` with whatever the
    /// registered consolidation callback returns.
    pub fn unwind_to_target(
        &mut self,
        thread: ThreadId,
        target_frame: Option<u64>,
        target_pc: u64,
        record: Option<ExceptionRecord>,
        return_value: u64,
    ) -> Result<Resumption> {
        let context = self.thread(thread)?.context;
        let mut record =
            record.unwrap_or_else(|| ExceptionRecord::new(ExceptionCode::Unwind, context.rip));
        record.flags |= ExceptionFlags::UNWINDING;
        if target_frame.is_none() {
            record.flags |= ExceptionFlags::EXIT_UNWIND;
        }
        debug!(
            code = record.code.as_u32(),
            ?target_frame,
            target_pc,
            "unwinding"
        );

        self.thread_mut(thread)?.unwinding = true;
        let walked = match self.arch {
            Arch::X86 => self.unwind_chain(thread, target_frame, &record, target_pc, context),
            Arch::X64 => self.unwind_tables(thread, target_frame, &record, target_pc, context),
            Arch::Arm64 => {
                self.unwind_tables_arm64(thread, target_frame, &record, target_pc, context)
            }
        };
        self.thread_mut(thread)?.unwinding = false;
        let mut context = walked?;

        if record.code == ExceptionCode::UnwindConsolidate && !record.parameters.is_empty() {
            let key = record.parameters[0];
            let callback = self
                .consolidate_callbacks
                .get(&key)
                .cloned()
                .ok_or(Status::InvalidParameter)?;
            context.rip = callback(&record);
        } else {
            context.rip = target_pc;
        }
        context.rax = return_value;

        self.thread_mut(thread)?.context = context;
        self.drain_apcs(thread)?;
        Ok(Resumption::Continue)
    }

    /// Frame-chain unwind: handlers are popped as they are passed, and the
    /// chain head is left exactly at the target frame.
    fn unwind_chain(
        &mut self,
        thread: ThreadId,
        target_frame: Option<u64>,
        record: &ExceptionRecord,
        target_pc: u64,
        mut context: Context,
    ) -> Result<Context> {
        loop {
            let top = match self.thread(thread)?.seh_chain.last() {
                Some(frame) => frame.clone(),
                None => {
                    return match target_frame {
                        None => Ok(context),
                        Some(_) => Err(Status::InvalidUnwindTarget),
                    };
                }
            };
            if let Some(target) = target_frame {
                // frames grow toward higher addresses as the chain unwinds
                if top.frame > target {
                    return Err(Status::InvalidUnwindTarget);
                }
            }
            let at_target = target_frame == Some(top.frame);

            let mut invoked = record.clone();
            if at_target {
                invoked.flags |= ExceptionFlags::TARGET_UNWIND;
            }
            let mut dispatch = DispatcherContext {
                control_pc: context.rip,
                establisher_frame: top.frame,
                target_pc,
                ..Default::default()
            };
            trace!(frame = top.frame, at_target, "unwinding through frame");
            check_unwind_outcome(top.handler.invoke(
                &invoked,
                top.frame,
                &mut context,
                &mut dispatch,
            ))?;

            if at_target {
                return Ok(context);
            }
            self.thread_mut(thread)?.pop_frame();
        }
    }

    /// Table-driven unwind: virtual unwinds advance a working context; the
    /// walk stops with the context still inside the target frame, so
    /// execution can resume there.
    fn unwind_tables(
        &self,
        thread: ThreadId,
        target_frame: Option<u64>,
        record: &ExceptionRecord,
        target_pc: u64,
        mut context: Context,
    ) -> Result<Context> {
        let (stack_limit, stack_base) = {
            let thread = self.thread(thread)?;
            (thread.stack_limit, thread.stack_base)
        };
        loop {
            let sp = context.rsp;
            if sp < stack_limit || sp >= stack_base {
                return match target_frame {
                    None => Ok(context),
                    Some(_) => Err(Status::InvalidUnwindTarget),
                };
            }

            let looked_up = self.tables.lookup_function_entry(context.rip);
            let (function, image_base) = match looked_up {
                Some((function, base)) => (Some(function), base),
                None => (None, 0),
            };
            let mut advanced = context;
            let unwound = match x64::virtual_unwind(
                UnwindFlags::UHANDLER,
                image_base,
                context.rip,
                function,
                &mut advanced,
                &self.memory,
                None,
            ) {
                Ok(unwound) => unwound,
                Err(Status::AccessViolation { .. } | Status::NotEnoughData) => {
                    return match target_frame {
                        None => Ok(context),
                        Some(_) => Err(Status::InvalidUnwindTarget),
                    };
                }
                Err(err) => return Err(err),
            };
            if advanced.rip == context.rip && advanced.rsp == sp {
                return Err(Status::BadFunctionTable);
            }
            let establisher = unwound.establisher_frame;
            if let Some(target) = target_frame {
                if establisher > target {
                    return Err(Status::InvalidUnwindTarget);
                }
            }
            let at_target = target_frame == Some(establisher);

            if let Some(language) = unwound.handler {
                if let Some(handler) = self.language_handlers.get(&language.address) {
                    let mut invoked = record.clone();
                    if at_target {
                        invoked.flags |= ExceptionFlags::TARGET_UNWIND;
                    }
                    let mut dispatch = DispatcherContext {
                        control_pc: context.rip,
                        image_base,
                        function_entry: function,
                        establisher_frame: establisher,
                        target_pc,
                        handler_data: language.data,
                    };
                    trace!(frame = establisher, at_target, "unwinding through frame");
                    check_unwind_outcome(handler.invoke(
                        &invoked,
                        establisher,
                        &mut context,
                        &mut dispatch,
                    ))?;
                }
            }

            if at_target {
                // do not unwind the target frame itself; execution resumes
                // inside it
                return Ok(context);
            }
            context = advanced;
        }
    }

    /// aarch64 counterpart of `unwind_tables`. A private full aarch64
    /// context drives the replay; the thread context's program-counter,
    /// stack-pointer and frame-pointer fields track Pc, Sp and Fp.
    fn unwind_tables_arm64(
        &self,
        thread: ThreadId,
        target_frame: Option<u64>,
        record: &ExceptionRecord,
        target_pc: u64,
        mut context: Context,
    ) -> Result<Context> {
        let (stack_limit, stack_base) = {
            let thread = self.thread(thread)?;
            (thread.stack_limit, thread.stack_base)
        };
        let mut walk = Arm64Context {
            sp: context.rsp,
            pc: context.rip,
            ..Arm64Context::default()
        };
        walk.x[29] = context.rbp;
        loop {
            let sp = walk.sp;
            if sp < stack_limit || sp >= stack_base {
                return match target_frame {
                    None => Ok(context),
                    Some(_) => Err(Status::InvalidUnwindTarget),
                };
            }

            let looked_up = self.tables.lookup_arm64_function_entry(walk.pc);
            let (function, image_base) = match looked_up {
                Some((function, base)) => (Some(function), base),
                None => (None, 0),
            };
            let mut advanced = walk;
            let unwound = match arm64::virtual_unwind_arm64(
                image_base,
                walk.pc,
                function,
                &mut advanced,
                &self.memory,
                None,
            ) {
                Ok(unwound) => unwound,
                Err(Status::AccessViolation { .. } | Status::NotEnoughData) => {
                    return match target_frame {
                        None => Ok(context),
                        Some(_) => Err(Status::InvalidUnwindTarget),
                    };
                }
                Err(err) => return Err(err),
            };
            if advanced.pc == walk.pc && advanced.sp == sp {
                return Err(Status::BadFunctionTable);
            }
            let establisher = unwound.establisher_frame;
            if let Some(target) = target_frame {
                if establisher > target {
                    return Err(Status::InvalidUnwindTarget);
                }
            }
            let at_target = target_frame == Some(establisher);

            if let Some(language) = unwound.handler {
                if let Some(handler) = self.language_handlers.get(&language.address) {
                    let mut invoked = record.clone();
                    if at_target {
                        invoked.flags |= ExceptionFlags::TARGET_UNWIND;
                    }
                    let mut dispatch = DispatcherContext {
                        control_pc: walk.pc,
                        image_base,
                        function_entry: None,
                        establisher_frame: establisher,
                        target_pc,
                        handler_data: language.data,
                    };
                    trace!(frame = establisher, at_target, "unwinding through frame");
                    check_unwind_outcome(handler.invoke(
                        &invoked,
                        establisher,
                        &mut context,
                        &mut dispatch,
                    ))?;
                }
            }

            if at_target {
                // do not unwind the target frame itself; execution resumes
                // inside it
                return Ok(context);
            }
            walk = advanced;
            context.rip = walk.pc;
            context.rsp = walk.sp;
            context.rbp = walk.x[29];
        }
    }

    /// Install `context` as the thread's machine state.
    ///
    /// A long-jump record overrides the nonvolatile registers, stack and
    /// program counter from the jump buffer its first parameter points at.
    pub fn restore_context(
        &mut self,
        thread: ThreadId,
        context: &Context,
        record: Option<&ExceptionRecord>,
    ) -> Result<()> {
        let mut restored = *context;
        if let Some(record) = record {
            if record.code == ExceptionCode::LongJump && !record.parameters.is_empty() {
                let buffer = record.parameters[0];
                let word = |index: u64| self.memory.read_u64(buffer + 8 * index);
                restored.rbx = word(JB_RBX)?;
                restored.rsp = word(JB_RSP)?;
                restored.rbp = word(JB_RBP)?;
                restored.rsi = word(JB_RSI)?;
                restored.rdi = word(JB_RDI)?;
                restored.r12 = word(JB_R12)?;
                restored.r13 = word(JB_R13)?;
                restored.r14 = word(JB_R14)?;
                restored.r15 = word(JB_R15)?;
                restored.rip = word(JB_RIP)?;
            }
        }
        self.thread_mut(thread)?.context = restored;
        Ok(())
    }
}

/// On the unwind pass a handler may only continue the search; collided
/// unwinds fold into the search here, anything else is a broken handler.
fn check_unwind_outcome(outcome: HandlerOutcome) -> Result<()> {
    match outcome {
        HandlerOutcome::Disposition(Disposition::ContinueSearch)
        | HandlerOutcome::Disposition(Disposition::CollidedUnwind) => Ok(()),
        _ => Err(Status::InvalidDisposition),
    }
}
