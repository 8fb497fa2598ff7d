//! Low-level stack switching primitive.
//!
//! This is the one collaborator the scheduler consumes rather than owns: an
//! mmap-backed [`Stack`], a saved callee-saved register set ([`Registers`])
//! and [`switch`], which parks the current execution context and resumes
//! another. The scheduler only ever primes a context with an entry point,
//! switches to it, and drops the stack once the task is done.

use crate::error::Error;
use std::arch::naked_asm;
use std::io;
use std::ptr;

/// Entry point planted into a primed context. Receives the argument passed to
/// [`Registers::primed`] and must never return: a task that falls off the end
/// of its entry would `ret` into garbage.
pub(crate) type Entry = extern "C" fn(usize) -> !;

/// Smallest stack we will map. Two pages of usable space is enough for the
/// entry trampoline plus a shallow call chain; anything less faults on the
/// guard page immediately.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Callee-saved register set for one execution context, System V x86_64.
///
/// Offsets are fixed by the `switch` asm below; keep both in sync.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct Registers {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

/// Callee-saved register set for one execution context, AAPCS64.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct Registers {
    sp: u64,
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    fp: u64,
    lr: u64,
    d: [u64; 8],
}

/// Save the current context into `save` and resume `restore`.
///
/// Returns (to the caller of `switch`) only when some other context switches
/// back into `save`.
///
/// # Safety
///
/// Both pointers must be valid and distinct, `restore` must hold either a
/// primed context or one previously filled by `switch`, and no borrow of
/// scheduler state may be held across the call.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(_save: *mut Registers, _restore: *const Registers) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // For a primed context this pops the trampoline address planted by
        // `Registers::primed`; for a parked one, the original return address.
        "ret",
    );
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(_save: *mut Registers, _restore: *const Registers) {
    naked_asm!(
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "stp x19, x20, [x0, #0x08]",
        "stp x21, x22, [x0, #0x18]",
        "stp x23, x24, [x0, #0x28]",
        "stp x25, x26, [x0, #0x38]",
        "stp x27, x28, [x0, #0x48]",
        "stp x29, x30, [x0, #0x58]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #0x08]",
        "ldp x21, x22, [x1, #0x18]",
        "ldp x23, x24, [x1, #0x28]",
        "ldp x25, x26, [x1, #0x38]",
        "ldp x27, x28, [x1, #0x48]",
        "ldp x29, x30, [x1, #0x58]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}

/// First code that runs on a fresh stack. Moves the argument out of the
/// callee-saved slot it was primed into and tail-calls the entry, aligning
/// the stack per the ABI first. The entry never returns.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
extern "C" fn trampoline() {
    naked_asm!(
        "mov rdi, r12",
        "and rsp, -16",
        "call r13",
        "ud2",
    );
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
extern "C" fn trampoline() {
    naked_asm!(
        "mov x0, x19",
        "br x20",
    );
}

impl Registers {
    /// Build a context suspended at `entry`, ready for its first `switch`.
    ///
    /// There is no handshake: the entry and its argument ride in
    /// callee-saved slots, so the new stack runs nothing until the scheduler
    /// dispatches it.
    pub(crate) fn primed(stack: &Stack, entry: Entry, arg: usize) -> Self {
        let mut regs = Registers::default();
        let top = (stack.top() as usize) & !15;

        #[cfg(target_arch = "x86_64")]
        {
            // Plant the trampoline address so the first `ret` in `switch`
            // lands on it.
            let slot = (top - 8) as *mut u64;
            unsafe { slot.write(trampoline as usize as u64) };
            regs.rsp = slot as u64;
            regs.r12 = arg as u64;
            regs.r13 = entry as usize as u64;
        }

        #[cfg(target_arch = "aarch64")]
        {
            regs.sp = top as u64;
            regs.lr = trampoline as usize as u64;
            regs.x19 = arg as u64;
            regs.x20 = entry as usize as u64;
        }

        regs
    }
}

/// Privately mapped, downward-growing task stack with a PROT_NONE guard page
/// at the low end. Unmapped on drop.
#[derive(Debug)]
pub(crate) struct Stack {
    base: ptr::NonNull<libc::c_void>,
    len: usize,
}

impl Stack {
    pub(crate) fn map(size: usize) -> Result<Self, Error> {
        let page = page_size();
        // Requested size rounded up to whole pages, plus the guard page.
        // Absurd requests overflow here and fail like any other allocation.
        let Some(len) = size
            .max(MIN_STACK_SIZE)
            .checked_next_multiple_of(page)
            .and_then(|usable| usable.checked_add(page))
        else {
            return Err(Error::StackAlloc {
                size,
                source: io::Error::from(io::ErrorKind::OutOfMemory),
            });
        };

        #[cfg(target_os = "linux")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::StackAlloc {
                size,
                source: io::Error::last_os_error(),
            });
        }

        // Guard page at the low end: overflowing the stack faults instead of
        // silently corrupting whatever got mapped below.
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(Error::StackAlloc { size, source });
        }

        // Safety: mmap succeeded, so `base` is non-null.
        let base = unsafe { ptr::NonNull::new_unchecked(base) };
        Ok(Self { base, len })
    }

    /// Highest address of the mapping; stacks grow down from here.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().cast::<u8>().add(self.len) }
    }

    /// Usable bytes, excluding the guard page.
    pub(crate) fn size(&self) -> usize {
        self.len - page_size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: we own the mapping and nothing executes on it anymore by
        // the time the task record is released.
        unsafe { libc::munmap(self.base.as_ptr(), self.len) };
    }
}

fn page_size() -> usize {
    // Safety: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
