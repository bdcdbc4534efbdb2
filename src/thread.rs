use std::collections::VecDeque;
use std::rc::Rc;

use crate::context::Context;
use crate::dispatch::FrameHandler;
use crate::error::{Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u32);

/// Upper bound on the per-thread suspend counter.
pub const MAXIMUM_SUSPEND_COUNT: u8 = 127;

/// One node of the frame-based handler chain.
///
/// The chain is LIFO and stack-resident in the real thing; here the frame
/// address keeps the correlation with the stack while the handler itself is
/// a capability, so the dispatcher can be driven by closures in tests.
#[derive(Clone)]
pub struct SehFrame {
    pub frame: u64,
    pub handler: Rc<dyn FrameHandler>,
}

pub type Apc = Rc<dyn Fn(&mut crate::Machine, ThreadId)>;

pub struct Thread {
    pub id: ThreadId,
    pub context: Context,
    /// Innermost handler last; the head pointer of the 32-bit walk.
    pub(crate) seh_chain: Vec<SehFrame>,
    pub(crate) suspend_count: u8,
    pub(crate) apcs: VecDeque<Apc>,
    /// Set while an unwind is in flight; APCs do not drain until it clears.
    pub(crate) unwinding: bool,
    pub stack_base: u64,
    pub stack_limit: u64,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, stack_limit: u64, stack_base: u64) -> Self {
        // Debug registers are deliberately not inherited: every new thread
        // starts with zeroed Dr0-Dr7 regardless of who created it.
        Self {
            id,
            context: Context::default(),
            seh_chain: Vec::new(),
            suspend_count: 0,
            apcs: VecDeque::new(),
            unwinding: false,
            stack_base,
            stack_limit,
        }
    }

    /// Push a handler registration; the model analogue of linking a new
    /// EXCEPTION_REGISTRATION_RECORD at function entry.
    pub fn push_frame(&mut self, frame: u64, handler: Rc<dyn FrameHandler>) {
        self.seh_chain.push(SehFrame { frame, handler });
    }

    /// Pop the innermost registration (function exit).
    pub fn pop_frame(&mut self) -> Option<SehFrame> {
        self.seh_chain.pop()
    }

    /// The active chain head, i.e. the frame address of the innermost node.
    pub fn exception_list_head(&self) -> Option<u64> {
        self.seh_chain.last().map(|f| f.frame)
    }

    pub fn suspend(&mut self) -> Result<u8> {
        if self.suspend_count >= MAXIMUM_SUSPEND_COUNT {
            return Err(Status::SuspendCountExceeded);
        }
        let previous = self.suspend_count;
        self.suspend_count += 1;
        Ok(previous)
    }

    pub fn resume(&mut self) -> Result<u8> {
        if self.suspend_count == 0 {
            // Resuming a running thread does not go negative.
            return Err(Status::Unsuccessful);
        }
        let previous = self.suspend_count;
        self.suspend_count -= 1;
        Ok(previous)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count > 0
    }

    pub fn unwinding(&self) -> bool {
        self.unwinding
    }

    pub fn queue_apc(&mut self, apc: Apc) {
        self.apcs.push_back(apc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_count_saturates_with_error() {
        let mut thread = Thread::new(ThreadId(1), 0x1000, 0x2000);
        for expected in 0..MAXIMUM_SUSPEND_COUNT {
            assert_eq!(thread.suspend().unwrap(), expected);
        }
        assert_eq!(thread.suspend(), Err(Status::SuspendCountExceeded));
        assert_eq!(thread.suspend_count, MAXIMUM_SUSPEND_COUNT);
    }

    #[test]
    fn resume_below_zero_is_an_error_not_a_wrap() {
        let mut thread = Thread::new(ThreadId(1), 0x1000, 0x2000);
        assert_eq!(thread.resume(), Err(Status::Unsuccessful));
        thread.suspend().unwrap();
        assert_eq!(thread.resume().unwrap(), 1);
        assert_eq!(thread.resume(), Err(Status::Unsuccessful));
    }
}
