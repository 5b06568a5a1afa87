//! Per-coroutine stacks, mapped straight from the OS.
//!
//! Every coroutine owns an independent stack region instead of borrowing
//! a slice of the thread's stack, so suspending and resuming never copies
//! stack memory around. The region is mapped with `mmap` and carries one
//! `PROT_NONE` guard page at its low end; since stacks grow downward, an
//! overflow faults instead of scribbling over the neighbor mapping.

use core::ffi::c_void;
use core::ptr::null_mut;

use errno::{errno, Errno};
use log::debug;
use thiserror::Error;

/// Default stack size handed to new coroutines, guard page excluded.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

// Page size is 4 kb "on most architectures".
const PAGE_SIZE: usize = 4096;

/// An OS-level failure while managing a coroutine stack.
#[derive(Debug, Error)]
#[error("{op} failed: {errno}")]
pub struct StackError {
    op: &'static str,
    errno: Errno,
}

impl StackError {
    pub(crate) fn os(op: &'static str) -> Self {
        StackError { op, errno: errno() }
    }
}

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

#[cfg(target_os = "linux")]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK;
#[cfg(not(target_os = "linux"))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

/// One mapped coroutine stack. The mapping lives exactly as long as this
/// value.
pub struct CoroStack {
    base: *mut u8,
    total: usize,
}

impl CoroStack {
    /// Maps a stack with at least `size` usable bytes plus a guard page.
    pub fn new(size: usize) -> Result<Self, StackError> {
        let usable = round_up(size.max(PAGE_SIZE), PAGE_SIZE);
        let total = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::os("mmap"));
        }
        let base = base as *mut u8;

        // Revoke access to the lowest page; the stack grows down into it
        // only on overflow.
        if unsafe { libc::mprotect(base as *mut c_void, PAGE_SIZE, libc::PROT_NONE) } != 0 {
            let err = StackError::os("mprotect");
            unsafe { libc::munmap(base as *mut c_void, total) };
            return Err(err);
        }

        debug!("mapped a {}-byte coroutine stack at {:p}", total, base);
        Ok(CoroStack { base, total })
    }

    /// The usable region (above the guard page) and its length, in the
    /// form `ucontext` wants for `uc_stack`.
    pub fn usable(&self) -> (*mut u8, usize) {
        (unsafe { self.base.add(PAGE_SIZE) }, self.total - PAGE_SIZE)
    }
}

impl Drop for CoroStack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut c_void, self.total) };
        debug_assert_eq!(rc, 0, "munmap of a coroutine stack failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn maps_and_reports_usable_region() {
        let stack = CoroStack::new(DEFAULT_STACK_SIZE).unwrap();
        let (top, len) = stack.usable();
        assert!(!top.is_null());
        assert_eq!(len, DEFAULT_STACK_SIZE);

        // The usable region must actually be writable.
        unsafe {
            top.write(0xA5);
            top.add(len - 1).write(0x5A);
            assert_eq!(top.read(), 0xA5);
        }
    }

    #[test]
    fn tiny_requests_still_get_a_page() {
        let stack = CoroStack::new(1).unwrap();
        let (_, len) = stack.usable();
        assert_eq!(len, PAGE_SIZE);
    }
}
