//! A structured-exception and stack-unwinding engine over a modeled
//! machine: exception dispatch, virtual unwind driven by on-image unwind
//! metadata, unwind-to-target control transfer, and the thread plumbing
//! around them.
//!
//! The machine is a model, not a host process: memory is a set of mapped
//! ranges, threads are context snapshots, and handlers are capabilities
//! registered by the embedder. Everything the dispatcher does is
//! observable through those pieces.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

pub use context::{Context, ContextFlags};
pub use dispatch::{
    Arch, DebuggerPort, DebuggerVerdict, Disposition, DispatcherContext, ExceptionCode,
    ExceptionFlags, ExceptionRecord, Fault, FrameHandler, HandlerOutcome, Resumption,
    UnhandledFilter, VectoredDisposition, VectoredHandler, MAXIMUM_PARAMETERS,
};
pub use error::{Result, Status};
pub use memory::{MachineMemory, MemorySource};
pub use tables::{FunctionTables, RuntimeFunction};
pub use target::ConsolidateCallback;
pub use thread::{Apc, Thread, ThreadId};

pub mod context;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod tables;
mod target;
pub mod thread;
pub mod unwind;

use context::{copy_context, validate_get_flags};

/// The whole modeled machine: memory, threads, published unwind tables and
/// every registered handler, filter and callback.
pub struct Machine {
    pub memory: MachineMemory,
    pub tables: FunctionTables,
    pub(crate) arch: Arch,
    threads: HashMap<ThreadId, Thread>,
    next_thread_id: u32,
    pub(crate) vectored_exception: Vec<(u64, VectoredHandler)>,
    pub(crate) vectored_continue: Vec<(u64, VectoredHandler)>,
    next_cookie: u64,
    pub(crate) language_handlers: HashMap<u64, Rc<dyn FrameHandler>>,
    pub(crate) consolidate_callbacks: HashMap<u64, ConsolidateCallback>,
    pub(crate) debugger: Option<Box<dyn DebuggerPort>>,
    pub(crate) unhandled_filter: Option<UnhandledFilter>,
    /// Compatibility switch: show the debugger's first-chance context
    /// edits to in-process handlers even when it does not claim the
    /// exception.
    pub(crate) debugger_edits_visible: bool,
    process_suspended: bool,
}

impl Machine {
    pub fn new(arch: Arch) -> Self {
        Self {
            memory: MachineMemory::new(),
            tables: FunctionTables::new(),
            arch,
            threads: HashMap::new(),
            next_thread_id: 0,
            vectored_exception: Vec::new(),
            vectored_continue: Vec::new(),
            next_cookie: 0,
            language_handlers: HashMap::new(),
            consolidate_callbacks: HashMap::new(),
            debugger: None,
            unhandled_filter: None,
            debugger_edits_visible: false,
            process_suspended: false,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Create a thread with the given stack range. Debug registers always
    /// start zeroed, whatever the creating thread's context holds.
    pub fn create_thread(&mut self, stack_limit: u64, stack_base: u64) -> ThreadId {
        self.next_thread_id += 1;
        let id = ThreadId(self.next_thread_id);
        self.threads.insert(id, Thread::new(id, stack_limit, stack_base));
        debug!(id = id.0, stack_limit, stack_base, "thread created");
        id
    }

    pub fn thread(&self, id: ThreadId) -> Result<&Thread> {
        self.threads.get(&id).ok_or(Status::InvalidThread)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread> {
        self.threads.get_mut(&id).ok_or(Status::InvalidThread)
    }

    /// Snapshot the thread's context with the control, integer and segment
    /// groups marked valid.
    pub fn capture_context(&self, id: ThreadId) -> Result<Context> {
        let mut context = self.thread(id)?.context;
        context.flags = ContextFlags::FULL | ContextFlags::SEGMENTS;
        Ok(context)
    }

    /// Read the register groups named by `flags` out of the thread.
    pub fn get_context(&self, id: ThreadId, flags: ContextFlags) -> Result<Context> {
        validate_get_flags(flags)?;
        let thread = self.thread(id)?;
        let mut out = Context {
            flags,
            ..Context::default()
        };
        copy_context(&mut out, &thread.context, flags);
        Ok(out)
    }

    /// Write the register groups marked valid in `context` into the thread;
    /// unmarked groups keep their current values.
    pub fn set_context(&mut self, id: ThreadId, context: &Context) -> Result<()> {
        let flags = context.flags;
        let thread = self.thread_mut(id)?;
        copy_context(&mut thread.context, context, flags);
        Ok(())
    }

    pub fn suspend_thread(&mut self, id: ThreadId) -> Result<u8> {
        self.thread_mut(id)?.suspend()
    }

    pub fn resume_thread(&mut self, id: ThreadId) -> Result<u8> {
        self.thread_mut(id)?.resume()
    }

    /// Suspend a thread for the lifetime of the returned guard.
    pub fn suspend_scope(&mut self, id: ThreadId) -> Result<SuspendScope<'_>> {
        self.suspend_thread(id)?;
        Ok(SuspendScope { machine: self, thread: id })
    }

    /// Suspend every thread. Suspending an already-suspended process is a
    /// success no-op, the counts are not bumped twice.
    pub fn suspend_process(&mut self) -> Result<()> {
        if self.process_suspended {
            return Ok(());
        }
        let ids: Vec<ThreadId> = self.threads.keys().copied().collect();
        for id in ids {
            self.suspend_thread(id)?;
        }
        self.process_suspended = true;
        Ok(())
    }

    /// Undo one process suspension. Resuming a running process is a
    /// success no-op.
    pub fn resume_process(&mut self) -> Result<()> {
        if !self.process_suspended {
            return Ok(());
        }
        let ids: Vec<ThreadId> = self.threads.keys().copied().collect();
        for id in ids {
            self.resume_thread(id)?;
        }
        self.process_suspended = false;
        Ok(())
    }

    pub fn queue_apc(&mut self, id: ThreadId, apc: Apc) -> Result<()> {
        self.thread_mut(id)?.queue_apc(apc);
        Ok(())
    }

    /// Run queued APCs until the queue is empty. Nothing runs while the
    /// thread is suspended or an unwind is in flight; the queue is drained
    /// again when those clear.
    pub fn drain_apcs(&mut self, id: ThreadId) -> Result<()> {
        loop {
            let apc = {
                let thread = self.thread_mut(id)?;
                if thread.unwinding || thread.is_suspended() {
                    return Ok(());
                }
                thread.apcs.pop_front()
            };
            match apc {
                Some(apc) => apc(self, id),
                None => return Ok(()),
            }
        }
    }

    /// Register a vectored exception handler; `first` puts it at the front
    /// of the chain. The cookie removes it again.
    pub fn add_vectored_exception_handler(&mut self, first: bool, handler: VectoredHandler) -> u64 {
        self.next_cookie += 1;
        let cookie = self.next_cookie;
        if first {
            self.vectored_exception.insert(0, (cookie, handler));
        } else {
            self.vectored_exception.push((cookie, handler));
        }
        cookie
    }

    pub fn remove_vectored_exception_handler(&mut self, cookie: u64) -> bool {
        let before = self.vectored_exception.len();
        self.vectored_exception.retain(|(c, _)| *c != cookie);
        self.vectored_exception.len() != before
    }

    /// Register a vectored continue handler, consulted only after every
    /// frame handler has declined.
    pub fn add_vectored_continue_handler(&mut self, first: bool, handler: VectoredHandler) -> u64 {
        self.next_cookie += 1;
        let cookie = self.next_cookie;
        if first {
            self.vectored_continue.insert(0, (cookie, handler));
        } else {
            self.vectored_continue.push((cookie, handler));
        }
        cookie
    }

    pub fn remove_vectored_continue_handler(&mut self, cookie: u64) -> bool {
        let before = self.vectored_continue.len();
        self.vectored_continue.retain(|(c, _)| *c != cookie);
        self.vectored_continue.len() != before
    }

    /// Bind a language-specific handler implementation to the machine
    /// address unwind metadata will report for it.
    pub fn register_language_handler(&mut self, address: u64, handler: Rc<dyn FrameHandler>) {
        self.language_handlers.insert(address, handler);
    }

    /// Register the callback a consolidation unwind will call to pick its
    /// resume address; `key` matches the record's first parameter.
    pub fn register_consolidate_callback(&mut self, key: u64, callback: ConsolidateCallback) {
        self.consolidate_callbacks.insert(key, callback);
    }

    pub fn set_debugger(&mut self, debugger: Option<Box<dyn DebuggerPort>>) {
        self.debugger = debugger;
    }

    pub fn set_unhandled_filter(&mut self, filter: Option<UnhandledFilter>) {
        self.unhandled_filter = filter;
    }

    pub fn set_debugger_edits_visible(&mut self, visible: bool) {
        self.debugger_edits_visible = visible;
    }
}

/// Guard returned by [`Machine::suspend_scope`]; dropping it resumes the
/// thread.
pub struct SuspendScope<'a> {
    machine: &'a mut Machine,
    thread: ThreadId,
}

impl SuspendScope<'_> {
    pub fn machine(&mut self) -> &mut Machine {
        self.machine
    }
}

impl Drop for SuspendScope<'_> {
    fn drop(&mut self) {
        // resume can only fail if the thread vanished, nothing to do then
        let _ = self.machine.resume_thread(self.thread);
    }
}
