//! The saved machine context a suspended thread resumes from.
//!
//! The layout mirrors exactly what [`crate::interrupts::timer`] and
//! [`crate::interrupts::resched`] push on their entry and pop on their exit:
//! fifteen general-purpose registers (in push order, `rax` first / highest
//! address) followed by the five hardware-pushed `iretq` fields. A thread's
//! `ctx` pointer is the address of the lowest field (`r15`) — i.e. the value
//! RSP held immediately after the asm prologue finished pushing GPRs, before
//! any scratch alignment adjustment for the `call` that follows. That
//! pointer is stable across an arbitrary number of suspend/resume cycles, so
//! it can be stored in [`super::Thread::ctx`] and handed straight back to the
//! asm epilogue as the next `rsp`.

use crate::gdt::{KERNEL_CS, KERNEL_DS, USER_CS, USER_DS};
use kernel_vmem::addresses::VirtualAddress;

/// `RFLAGS` value used for every freshly spawned thread: reserved bit 1 set,
/// `IF` (bit 9) set so the thread starts with interrupts enabled.
pub const INITIAL_RFLAGS: u64 = 0x202;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // Hardware-pushed on interrupt entry, in long mode always all five
    // fields regardless of whether a privilege change occurred.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(size_of::<InterruptFrame>() == 20 * 8);

/// Build a synthetic [`InterruptFrame`] at the top of a freshly mapped
/// kernel stack so the scheduler can "resume into" a thread that has never
/// actually been interrupted yet.
///
/// `entry` receives `arg` in `rdi`, matching the `extern "C" fn(u64) -> !`
/// kernel-thread entry-point convention. The thread starts at CPL0 with its
/// own, empty kernel stack (`rsp = kstack_top`).
///
/// # Safety
/// `kstack_top` must be 16-byte aligned and must have at least
/// `size_of::<InterruptFrame>()` mapped, writable bytes below it.
pub unsafe fn new_kernel_thread_frame(
    kstack_top: VirtualAddress,
    entry: extern "C" fn(u64) -> !,
    arg: u64,
) -> VirtualAddress {
    let frame_addr = kstack_top.as_u64() - size_of::<InterruptFrame>() as u64;
    let frame = InterruptFrame {
        rdi: arg,
        rip: entry as usize as u64,
        cs: u64::from(KERNEL_CS),
        rflags: INITIAL_RFLAGS,
        rsp: kstack_top.as_u64(),
        ss: u64::from(KERNEL_DS),
        ..InterruptFrame::default()
    };
    unsafe {
        (frame_addr as *mut InterruptFrame).write(frame);
    }
    VirtualAddress::new(frame_addr)
}

/// Build a synthetic [`InterruptFrame`] that resumes directly into ring-3
/// user code, using the kernel stack only to hold the saved context (the
/// thread's own stack is `ustack_top`, mapped separately in user memory).
///
/// # Safety
/// Same requirements as [`new_kernel_thread_frame`]; additionally `entry`
/// and `ustack_top` must already be mapped present/user/executable resp.
/// present/user/writable in the target address space.
pub unsafe fn new_user_thread_frame(
    kstack_top: VirtualAddress,
    entry: VirtualAddress,
    ustack_top: VirtualAddress,
) -> VirtualAddress {
    let frame_addr = kstack_top.as_u64() - size_of::<InterruptFrame>() as u64;
    let frame = InterruptFrame {
        rip: entry.as_u64(),
        cs: u64::from(USER_CS) | 3,
        rflags: INITIAL_RFLAGS,
        rsp: ustack_top.as_u64(),
        ss: u64::from(USER_DS) | 3,
        ..InterruptFrame::default()
    };
    unsafe {
        (frame_addr as *mut InterruptFrame).write(frame);
    }
    VirtualAddress::new(frame_addr)
}
