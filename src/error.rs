//! Crate-wide error type for ambient (non-process-fault) failures.
//!
//! User-visible process faults are reported as a plain `i32` exit status
//! per the syscall ABI; this type is for the boot-time and resource-layer
//! failures that have no process to blame yet.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfPhysicalFrames,
    OutOfSwapSlots,
    OutOfFileDescriptors,
    OutOfThreadIds,
    AddressAlreadyMapped,
    AddressNotMapped,
    Misaligned,
    HeapInitFailed,
    BadBootInfo,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfPhysicalFrames => "no free physical frames",
            KernelError::OutOfSwapSlots => "swap disk exhausted",
            KernelError::OutOfFileDescriptors => "file descriptor table full",
            KernelError::OutOfThreadIds => "thread id space exhausted",
            KernelError::AddressAlreadyMapped => "address already mapped",
            KernelError::AddressNotMapped => "address not mapped",
            KernelError::Misaligned => "address not page aligned",
            KernelError::HeapInitFailed => "kernel heap initialization failed",
            KernelError::BadBootInfo => "bootloader handoff missing required field",
        };
        f.write_str(msg)
    }
}

pub type KResult<T> = Result<T, KernelError>;
