//! Frame cursors: the dispatcher walks frames through one interface,
//! whether they come from the in-memory handler chain or from unwind
//! tables.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::trace;

use crate::context::{Arm64Context, Context};
use crate::dispatch::{Arch, DispatcherContext, FrameHandler};
use crate::error::{Result, Status};
use crate::memory::MachineMemory;
use crate::tables::FunctionTables;
use crate::thread::{SehFrame, Thread, ThreadId};
use crate::unwind::{arm64, x64, UnwindFlags};

/// Machine state a cursor may consult while advancing.
pub struct CursorEnv<'a> {
    pub tables: &'a FunctionTables,
    pub memory: &'a MachineMemory,
    pub handlers: &'a HashMap<u64, Rc<dyn FrameHandler>>,
}

/// One handler-bearing frame produced by a cursor.
pub struct FrameStep {
    pub handler: Rc<dyn FrameHandler>,
    pub dispatch: DispatcherContext,
}

/// Yields handler-bearing frames from innermost to outermost; `None` once
/// the walk runs off the end of the chain or the stack.
pub trait FrameCursor {
    fn next_frame(&mut self, env: &CursorEnv<'_>) -> Result<Option<FrameStep>>;
}

/// Walk of the registered handler chain, innermost node first.
pub struct ListCursor {
    frames: Vec<SehFrame>,
    control_pc: u64,
}

impl ListCursor {
    pub fn new(thread: &Thread, context: &Context) -> Self {
        Self {
            frames: thread.seh_chain.clone(),
            control_pc: context.rip,
        }
    }
}

impl FrameCursor for ListCursor {
    fn next_frame(&mut self, _env: &CursorEnv<'_>) -> Result<Option<FrameStep>> {
        Ok(self.frames.pop().map(|frame| FrameStep {
            handler: Rc::clone(&frame.handler),
            dispatch: DispatcherContext {
                control_pc: self.control_pc,
                establisher_frame: frame.frame,
                ..Default::default()
            },
        }))
    }
}

/// Table-driven walk: repeated virtual unwinds of a private context copy.
/// The copy advances even across frames with no handler, so the dispatch
/// context handed out always describes the frame whose handler it is.
pub struct TableCursor {
    control_pc: u64,
    unwind_context: Context,
    stack_limit: u64,
    stack_base: u64,
}

impl TableCursor {
    pub fn new(context: &Context, stack_limit: u64, stack_base: u64) -> Self {
        Self {
            control_pc: context.rip,
            unwind_context: *context,
            stack_limit,
            stack_base,
        }
    }
}

impl FrameCursor for TableCursor {
    fn next_frame(&mut self, env: &CursorEnv<'_>) -> Result<Option<FrameStep>> {
        loop {
            if self.control_pc == 0 {
                return Ok(None);
            }
            let sp = self.unwind_context.rsp;
            if sp < self.stack_limit || sp >= self.stack_base || sp & 7 != 0 {
                trace!(sp, "stack pointer left the thread stack, walk ends");
                return Ok(None);
            }

            let looked_up = env.tables.lookup_function_entry(self.control_pc);
            let (function, image_base) = match looked_up {
                Some((function, base)) => (Some(function), base),
                None => (None, 0),
            };
            let mut advanced = self.unwind_context;
            let unwound = match x64::virtual_unwind(
                UnwindFlags::EHANDLER,
                image_base,
                self.control_pc,
                function,
                &mut advanced,
                env.memory,
                None,
            ) {
                Ok(unwound) => unwound,
                // reading past the top of the mapped stack ends the walk
                Err(Status::AccessViolation { .. } | Status::NotEnoughData) => return Ok(None),
                Err(err) => return Err(err),
            };
            if advanced.rip == self.control_pc && advanced.rsp == sp {
                return Err(Status::BadFunctionTable);
            }

            let control_pc = self.control_pc;
            self.control_pc = advanced.rip;
            self.unwind_context = advanced;

            if let Some(language) = unwound.handler {
                match env.handlers.get(&language.address) {
                    Some(handler) => {
                        return Ok(Some(FrameStep {
                            handler: Rc::clone(handler),
                            dispatch: DispatcherContext {
                                control_pc,
                                image_base,
                                function_entry: function,
                                establisher_frame: unwound.establisher_frame,
                                target_pc: 0,
                                handler_data: language.data,
                            },
                        }));
                    }
                    None => {
                        trace!(address = language.address, "no handler registered at this address");
                    }
                }
            }
        }
    }
}

/// aarch64 table walk. The thread context's program-counter, stack-pointer
/// and frame-pointer fields carry Pc, Sp and Fp; the cursor keeps a private
/// full aarch64 context for the replay itself.
pub struct Arm64TableCursor {
    control_pc: u64,
    unwind_context: Arm64Context,
    stack_limit: u64,
    stack_base: u64,
}

impl Arm64TableCursor {
    pub fn new(context: &Context, stack_limit: u64, stack_base: u64) -> Self {
        let mut unwind_context = Arm64Context {
            sp: context.rsp,
            pc: context.rip,
            ..Arm64Context::default()
        };
        unwind_context.x[29] = context.rbp;
        Self {
            control_pc: context.rip,
            unwind_context,
            stack_limit,
            stack_base,
        }
    }
}

impl FrameCursor for Arm64TableCursor {
    fn next_frame(&mut self, env: &CursorEnv<'_>) -> Result<Option<FrameStep>> {
        loop {
            if self.control_pc == 0 {
                return Ok(None);
            }
            let sp = self.unwind_context.sp;
            if sp < self.stack_limit || sp >= self.stack_base || sp & 7 != 0 {
                trace!(sp, "stack pointer left the thread stack, walk ends");
                return Ok(None);
            }

            let looked_up = env.tables.lookup_arm64_function_entry(self.control_pc);
            let (function, image_base) = match looked_up {
                Some((function, base)) => (Some(function), base),
                None => (None, 0),
            };
            let mut advanced = self.unwind_context;
            let unwound = match arm64::virtual_unwind_arm64(
                image_base,
                self.control_pc,
                function,
                &mut advanced,
                env.memory,
                None,
            ) {
                Ok(unwound) => unwound,
                // reading past the top of the mapped stack ends the walk
                Err(Status::AccessViolation { .. } | Status::NotEnoughData) => return Ok(None),
                Err(err) => return Err(err),
            };
            if advanced.pc == self.control_pc && advanced.sp == sp {
                return Err(Status::BadFunctionTable);
            }

            let control_pc = self.control_pc;
            self.control_pc = advanced.pc;
            self.unwind_context = advanced;

            if let Some(language) = unwound.handler {
                match env.handlers.get(&language.address) {
                    Some(handler) => {
                        return Ok(Some(FrameStep {
                            handler: Rc::clone(handler),
                            dispatch: DispatcherContext {
                                control_pc,
                                image_base,
                                function_entry: None,
                                establisher_frame: unwound.establisher_frame,
                                target_pc: 0,
                                handler_data: language.data,
                            },
                        }));
                    }
                    None => {
                        trace!(address = language.address, "no handler registered at this address");
                    }
                }
            }
        }
    }
}

impl crate::Machine {
    pub(crate) fn make_cursor(
        &self,
        thread: ThreadId,
        context: &Context,
    ) -> Result<Box<dyn FrameCursor>> {
        let thread = self.thread(thread)?;
        Ok(match self.arch {
            Arch::X86 => Box::new(ListCursor::new(thread, context)),
            Arch::X64 => {
                Box::new(TableCursor::new(context, thread.stack_limit, thread.stack_base))
            }
            Arch::Arm64 => {
                Box::new(Arm64TableCursor::new(context, thread.stack_limit, thread.stack_base))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Disposition, ExceptionRecord, HandlerOutcome};

    fn env<'a>(
        tables: &'a FunctionTables,
        memory: &'a MachineMemory,
        handlers: &'a HashMap<u64, Rc<dyn FrameHandler>>,
    ) -> CursorEnv<'a> {
        CursorEnv {
            tables,
            memory,
            handlers,
        }
    }

    fn search_handler() -> Rc<dyn FrameHandler> {
        Rc::new(
            |_: &ExceptionRecord, _: u64, _: &mut Context, _: &mut DispatcherContext| {
                HandlerOutcome::Disposition(Disposition::ContinueSearch)
            },
        )
    }

    #[test]
    fn list_cursor_yields_innermost_first() {
        let mut thread = Thread::new(ThreadId(1), 0x1000, 0x2000);
        thread.push_frame(0x1f00, search_handler());
        thread.push_frame(0x1e00, search_handler());

        let context = Context {
            rip: 0x4444,
            ..Context::default()
        };
        let mut cursor = ListCursor::new(&thread, &context);
        let tables = FunctionTables::new();
        let memory = MachineMemory::new();
        let handlers = HashMap::new();
        let env = env(&tables, &memory, &handlers);

        let first = cursor.next_frame(&env).unwrap().unwrap();
        assert_eq!(first.dispatch.establisher_frame, 0x1e00);
        assert_eq!(first.dispatch.control_pc, 0x4444);
        let second = cursor.next_frame(&env).unwrap().unwrap();
        assert_eq!(second.dispatch.establisher_frame, 0x1f00);
        assert!(cursor.next_frame(&env).unwrap().is_none());
    }

    #[test]
    fn table_cursor_stops_when_the_stack_runs_out() {
        // two leaf frames, then the stack pointer reaches the stack base
        let mut memory = MachineMemory::new();
        memory.map(0x7000, 0x1000);
        memory.write_u64(0x7ff0, 0x5500).unwrap();
        memory.write_u64(0x7ff8, 0x5600).unwrap();

        let context = Context {
            rip: 0x5400,
            rsp: 0x7ff0,
            ..Context::default()
        };
        let mut cursor = TableCursor::new(&context, 0x7000, 0x8000);
        let tables = FunctionTables::new();
        let handlers = HashMap::new();
        let env = env(&tables, &memory, &handlers);

        // no handlers anywhere, so the walk just exhausts
        assert!(cursor.next_frame(&env).unwrap().is_none());
    }
}
