use thiserror::Error;

/// Status codes reported by the engine to its immediate caller.
///
/// These mirror the NTSTATUS values the real interface returns; none of them
/// terminate the process. Faults detected while the machine executes are not
/// `Status` values, they become exception records (see `dispatch`).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    #[error("invalid parameter or flag combination")]
    InvalidParameter,
    #[error("the operation was unsuccessful")]
    Unsuccessful,
    #[error("buffer too small, {required} bytes required")]
    InsufficientBuffer { required: usize },
    #[error("suspend count would exceed the per-thread limit")]
    SuspendCountExceeded,
    #[error("out of memory for the requested table")]
    NoMemory,
    #[error("function table is malformed or missing for this range")]
    BadFunctionTable,
    #[error("handler returned an invalid disposition")]
    InvalidDisposition,
    #[error("continue-execution requested for a non-continuable exception")]
    NoncontinuableException,
    #[error("unwind target frame is not on the active chain")]
    InvalidUnwindTarget,
    #[error("memory access outside the mapped ranges at {address:#x}")]
    AccessViolation { address: u64 },
    #[error("not enough mapped data to satisfy the read")]
    NotEnoughData,
    #[error("no thread with the given id")]
    InvalidThread,
}

pub type Result<T> = std::result::Result<T, Status>;
