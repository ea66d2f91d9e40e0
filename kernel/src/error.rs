//! Crate-wide error taxonomy. Every subsystem returns `Result<T, KernelError>`
//! internally; the syscall boundary (`syscall.rs`) is the single place that
//! flattens these down to the `i64` ABI return codes the process sees.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    IoError,
    Unsupported,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Userspace only ever sees `-1`; the taxonomy above exists for kernel
    /// code to branch on, not for the ABI to expose.
    pub const fn to_errno(self) -> i64 {
        -1
    }
}

impl From<KernelError> for i64 {
    fn from(e: KernelError) -> i64 {
        e.to_errno()
    }
}
