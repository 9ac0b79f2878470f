//! `int $0x80` syscall entry: saves the full GPR set into a [`TrapFrame`] on
//! the current stack, dispatches in Rust, restores, and `iretq`s back.
//!
//! The development-mode counterpart to a future `SYSCALL`/`SYSRET` fast
//! path; kept as a software-interrupt gate since it needs no
//! `STAR`/`LSTAR` MSR setup to exercise the ring-3 spawn path.

#![allow(clippy::missing_safety_doc)]

use crate::smap::SmapGuard;
use core::arch::naked_asm;

/// Saved register/interrupt context for an `int $0x80` syscall.
///
/// Layout must match the push order in [`int80_entry`] exactly: `rax` is
/// pushed last (lowest address), so `&TrapFrame == rsp` at the call site.
#[derive(Debug)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    // CPU-pushed interrupt frame (x86-64 interrupt gate, no error code):
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Syscall numbers this kernel's `int $0x80` gate understands.
///
/// `Write` matches the user ABI's syscall 0: `write(fd, ptr, len)` to the
/// serial console, the minimum surface the embedded demo thread needs.
#[repr(u64)]
pub enum Sysno {
    Write = 0,
}

/// Longest single `write` this kernel will copy out of user memory per
/// call. The embedded demo writes a short fixed string; there is no
/// buffered-I/O path yet to justify anything larger.
const MAX_WRITE_LEN: u64 = 4096;

#[unsafe(naked)]
pub extern "C" fn int80_entry() {
    naked_asm!(
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdi",
        "push rsi",
        "push rdx",
        "push rcx",
        "push rbx",
        "push rax",
        "mov rdi, rsp",
        "call {rust}",
        "pop rax",
        "pop rbx",
        "pop rcx",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
        rust = sym int80_dispatch,
    );
}

extern "C" fn int80_dispatch(tf: &mut TrapFrame) {
    let sysno = tf.rax;
    let a0 = tf.rdi;
    let a1 = tf.rsi;
    let a2 = tf.rdx;

    tf.rax = match sysno {
        x if x == Sysno::Write as u64 => sys_write(a0, a1, a2),
        _ => u64::MAX, // -ENOSYS
    };
}

/// `write(fd, ptr, len)`: copies `len` bytes from the calling thread's user
/// memory at `ptr` to the serial console, ignoring `fd` (there is only one
/// sink). Returns the byte count written, or `u64::MAX` if `len` is
/// unreasonable.
///
/// # Safety (informal)
/// `ptr` is trusted only as far as [`SmapGuard`] goes: SMAP, not a software
/// range check, is what stops this from reading kernel memory the user
/// thread doesn't own. A real syscall surface would additionally validate
/// `ptr` falls within the user half before dereferencing it.
fn sys_write(_fd: u64, ptr: u64, len: u64) -> u64 {
    if len > MAX_WRITE_LEN {
        return u64::MAX;
    }
    let guard = SmapGuard::enter();
    for i in 0..len {
        let byte = unsafe { core::ptr::read((ptr + i) as *const u8) };
        crate::serial::write_byte(byte);
    }
    drop(guard);
    len
}
