//! # Preemptive kernel scheduler
//!
//! A single global run queue of [`Thread`]s, round-robin over whichever CPUs
//! pull from it (the BSP and every application processor
//! [`crate::smp::bring_up_aps`] started), preemption driven by the LAPIC timer
//! ([`crate::interrupts::timer`]), and a context switch that is nothing more
//! than overwriting `rsp` with another thread's saved [`context::InterruptFrame`]
//! pointer before the shared `iretq` epilogue runs (see [`context`]).
//!
//! ## Locking
//!
//! The whole scheduler state (thread arena, run queue, sleeping list, process
//! table) lives behind one [`kernel_sync::SpinMutex`], taken with interrupts
//! disabled (`lock_irq`) by every public entry point here. Per `SPEC_FULL.md`
//! §5 the acquisition order across subsystems is PMM < VMM < heap <
//! run_queue; [`spawn_kernel_thread`] honours that by mapping the new kernel
//! stack (which takes the VMM's locks) *before* taking the scheduler lock.

pub mod context;
pub mod process;
pub mod queue;
pub mod stacks;

use crate::alloc::{FlushTlb, try_with_kernel_vmm};
use crate::per_cpu::PerCpu;
use context::InterruptFrame;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::MAX_THREADS;
use kernel_sync::{RawSpin, SpinMutex};
use kernel_vmem::addresses::VirtualAddress;
use process::{Cpl, Pid, ProcessTable};
use queue::{RunQueue, SleepingList};

pub type ThreadId = u32;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThreadState {
    Runnable,
    Running,
    Sleeping,
    Blocked,
    Zombie,
}

pub struct Thread {
    pub tid: ThreadId,
    pub pid: Pid,
    pub kstack_slot: usize,
    pub kstack_top: VirtualAddress,
    pub ustack_base: Option<VirtualAddress>,
    /// Pointer to this thread's saved [`InterruptFrame`] on its own kernel
    /// stack. Valid whenever the thread is not the one currently executing.
    pub ctx: VirtualAddress,
    pub state: ThreadState,
    pub wake_tsc: Option<u64>,

    // RunQueue intrusive links (meaningful only while `state` is `Runnable`).
    next: ThreadId,
    prev: ThreadId,
    // SleepingList intrusive links (meaningful only while `state` is `Sleeping`).
    sleep_next: Option<ThreadId>,
    sleep_prev: Option<ThreadId>,
}

struct Scheduler {
    threads: [Option<Thread>; MAX_THREADS],
    run_queue: RunQueue,
    sleeping: SleepingList,
    processes: ProcessTable,
    next_tid: ThreadId,
    /// The BSP's own original execution context, registered lazily by
    /// [`run_idle_loop`] the first time it is preempted rather than crafted
    /// synthetically — there is no "before the kernel started" stack frame
    /// to fabricate one from.
    idle_tid: Option<ThreadId>,
    /// Currently running thread, one slot per CPU.
    current: [Option<ThreadId>; MAX_CPUS],
}

const MAX_CPUS: usize = 32;

impl Scheduler {
    const fn new() -> Self {
        Self {
            threads: [const { None }; MAX_THREADS],
            run_queue: RunQueue::new(),
            sleeping: SleepingList::new(),
            processes: ProcessTable::new(),
            next_tid: 0,
            idle_tid: None,
            current: [None; MAX_CPUS],
        }
    }

    fn alloc_tid(&mut self) -> ThreadId {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    fn thread(&self, tid: ThreadId) -> &Thread {
        self.threads[tid as usize].as_ref().expect("dangling thread id")
    }

    fn thread_mut(&mut self, tid: ThreadId) -> &mut Thread {
        self.threads[tid as usize].as_mut().expect("dangling thread id")
    }

    fn cpu_id() -> usize {
        PerCpu::current().cpu_id as usize
    }
}

static SCHED: SpinMutex<Scheduler> = SpinMutex::from_raw(RawSpin::new(), Scheduler::new());

/// TSC ticks per millisecond, set once by [`init`] after timer calibration.
static TSC_TICKS_PER_MS: AtomicU64 = AtomicU64::new(0);

/// Record the calibrated TSC frequency so [`sleep_ms`] can convert
/// milliseconds into an absolute TSC deadline.
pub fn init(tsc_hz: u64) {
    TSC_TICKS_PER_MS.store(tsc_hz / 1000, Ordering::Relaxed);
}

fn now_tsc() -> u64 {
    crate::tsc::rdtsc()
}

/// Register the calling context (the BSP, running on its boot-derived
/// kernel stack with no scheduler thread of its own yet) as the idle
/// thread, then loop forever. Its very first preemption lazily populates
/// `ctx` — see [`on_tick`].
pub fn run_idle_loop() -> ! {
    let tid = {
        let mut sched = SCHED.lock_irq();
        let pid = sched.processes.create(Cpl::Ring0, unsafe { kernel_vmem::read_cr3_phys() });
        let tid = sched.alloc_tid();
        sched.threads[tid as usize] = Some(Thread {
            tid,
            pid,
            kstack_slot: usize::MAX, // idle thread keeps its original boot stack
            kstack_top: VirtualAddress::zero(),
            ustack_base: None,
            ctx: VirtualAddress::zero(), // populated on first preemption
            state: ThreadState::Running,
            wake_tsc: None,
            next: tid,
            prev: tid,
            sleep_next: None,
            sleep_prev: None,
        });
        sched.idle_tid = Some(tid);
        sched.current[Scheduler::cpu_id()] = Some(tid);
        tid
    };
    log::info!("Idle thread {tid} registered on cpu {}", Scheduler::cpu_id());

    loop {
        unsafe { core::arch::asm!("sti; hlt", options(nomem, nostack)) };
    }
}

/// Allocate a kernel stack and spawn a new kernel-mode thread under the
/// kernel process (creating it on first use), enqueuing it runnable.
///
/// # Panics
/// Panics if the kernel-thread-stack region or the thread table is
/// exhausted — both are fixed-size debug/sizing bounds, not expected to be
/// hit by the handful of kernel worker threads this kernel spawns.
pub fn spawn_kernel_thread(entry: extern "C" fn(u64) -> !, arg: u64) -> ThreadId {
    // Map the stack before touching the scheduler lock: PMM/VMM locks must
    // never be acquired while holding the run-queue lock (SPEC_FULL.md §5).
    let (slot, kstack_top) = try_with_kernel_vmm(FlushTlb::OnSuccess, |vmm| stacks::alloc_stack(vmm))
        .expect("map kernel-thread stack")
        .expect("kernel-thread stack slots exhausted");

    let ctx = unsafe { context::new_kernel_thread_frame(kstack_top, entry, arg) };

    let mut sched = SCHED.lock_irq();
    let pid = kernel_process_pid(&mut sched);
    let tid = sched.alloc_tid();
    sched.threads[tid as usize] = Some(Thread {
        tid,
        pid,
        kstack_slot: slot,
        kstack_top,
        ustack_base: None,
        ctx,
        state: ThreadState::Runnable,
        wake_tsc: None,
        next: tid,
        prev: tid,
        sleep_next: None,
        sleep_prev: None,
    });
    sched.processes.get_mut(pid).expect("kernel process").num_threads += 1;
    let threads = &mut sched.threads;
    sched.run_queue.push_back(threads, tid);
    tid
}

/// Spawn a ring-3 thread that resumes directly at `entry_va` on `ustack_top`,
/// under a fresh user process.
pub fn spawn_user_thread(entry_va: VirtualAddress, ustack_top: VirtualAddress) -> ThreadId {
    let (slot, kstack_top) = try_with_kernel_vmm(FlushTlb::OnSuccess, |vmm| stacks::alloc_stack(vmm))
        .expect("map kernel-thread stack")
        .expect("kernel-thread stack slots exhausted");

    let ctx = unsafe { context::new_user_thread_frame(kstack_top, entry_va, ustack_top) };

    let mut sched = SCHED.lock_irq();
    let pid = sched.processes.create(Cpl::Ring3, unsafe { kernel_vmem::read_cr3_phys() });
    let tid = sched.alloc_tid();
    sched.threads[tid as usize] = Some(Thread {
        tid,
        pid,
        kstack_slot: slot,
        kstack_top,
        ustack_base: Some(ustack_top),
        ctx,
        state: ThreadState::Runnable,
        wake_tsc: None,
        next: tid,
        prev: tid,
        sleep_next: None,
        sleep_prev: None,
    });
    sched.processes.get_mut(pid).expect("just created").num_threads += 1;
    let threads = &mut sched.threads;
    sched.run_queue.push_back(threads, tid);
    tid
}

static KERNEL_PID: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(u32::MAX);

/// The shared kernel process every `spawn_kernel_thread` thread runs under,
/// created lazily on first use.
fn kernel_process_pid(sched: &mut Scheduler) -> Pid {
    let existing = KERNEL_PID.load(Ordering::Relaxed);
    if existing != u32::MAX {
        return existing;
    }
    let pid = sched.processes.create(Cpl::Ring0, unsafe { kernel_vmem::read_cr3_phys() });
    KERNEL_PID.store(pid, Ordering::Relaxed);
    pid
}

/// Called from the timer-tick asm trampoline with the interrupted thread's
/// freshly saved `ctx`. Processes due sleepers, then returns the `ctx` of
/// whichever thread should run next (possibly the same one).
pub extern "C" fn on_tick(ctx: u64) -> u64 {
    reschedule(ctx)
}

/// Called from the voluntary-yield software interrupt ([`crate::interrupts::resched`]).
pub extern "C" fn on_yield(ctx: u64) -> u64 {
    reschedule(ctx)
}

fn reschedule(ctx: u64) -> u64 {
    let cpu = Scheduler::cpu_id();
    let mut sched = SCHED.lock_irq();

    let now = now_tsc();
    {
        let threads = &mut sched.threads;
        sched.sleeping.drain_due(threads, now, |tid| {
            threads[tid as usize].as_mut().unwrap().state = ThreadState::Runnable;
        });
    }
    // Threads woken above still need to be (re)joined to the run queue; do
    // that as a second pass since `drain_due`'s closure can't also borrow
    // `run_queue` mutably.
    requeue_woken(&mut sched);

    let Some(current_tid) = sched.current[cpu] else {
        // Very first tick before `run_idle_loop` registered anything: nothing
        // to save, just keep executing wherever we were.
        return ctx;
    };

    // Save where the interrupted thread was, whether this is its first
    // preemption (idle thread, `ctx` still the zero sentinel) or its Nth.
    sched.thread_mut(current_tid).ctx = VirtualAddress::new(ctx);

    if sched.thread(current_tid).state == ThreadState::Running {
        sched.thread_mut(current_tid).state = ThreadState::Runnable;
        let threads = &mut sched.threads;
        threads[current_tid as usize].as_mut().unwrap().next = current_tid;
        threads[current_tid as usize].as_mut().unwrap().prev = current_tid;
        sched.run_queue.push_back(threads, current_tid);
    }

    let next_tid = {
        let threads = &mut sched.threads;
        sched.run_queue.rotate(threads)
    };

    let Some(next_tid) = next_tid else {
        // Nothing runnable at all (shouldn't happen: idle is always
        // queued), fall back to resuming whoever we interrupted.
        return ctx;
    };

    {
        let threads = &mut sched.threads;
        sched.run_queue.remove(threads, next_tid);
    }
    sched.thread_mut(next_tid).state = ThreadState::Running;
    sched.current[cpu] = Some(next_tid);

    let next_ctx = sched.thread(next_tid).ctx;
    let next_kstack_top = sched.thread(next_tid).kstack_top;
    drop(sched);

    if next_kstack_top.as_u64() != 0 {
        crate::tss::set_rsp0(unsafe { crate::per_cpu::bsp_percpu_mut() }, next_kstack_top);
    }

    if next_ctx.as_u64() == 0 {
        // Idle thread hasn't been preempted before; nothing saved to resume
        // into, so just continue on the interrupted context.
        return ctx;
    }
    next_ctx.as_u64()
}

fn requeue_woken(sched: &mut Scheduler) {
    // `drain_due` already flipped state to `Runnable`; find any thread in
    // that state that isn't already linked into the run queue (its `next`
    // still points at itself and it isn't the queue's sole/head entry) and
    // push it back on. Threads are few (N <= MAX_THREADS), so a linear scan
    // mirrors the rest of this module's fixed-capacity style.
    let tids: heapless_ids::SmallIdSet = {
        let mut set = heapless_ids::SmallIdSet::new();
        for (i, t) in sched.threads.iter().enumerate() {
            if let Some(t) = t {
                if t.state == ThreadState::Runnable && t.wake_tsc.is_some() {
                    set.push(i as ThreadId);
                }
            }
        }
        set
    };
    for tid in tids.iter() {
        sched.thread_mut(tid).wake_tsc = None;
        let threads = &mut sched.threads;
        threads[tid as usize].as_mut().unwrap().next = tid;
        threads[tid as usize].as_mut().unwrap().prev = tid;
        sched.run_queue.push_back(threads, tid);
    }
}

/// Tiny fixed-capacity `Vec<ThreadId>` substitute, kept local to this module
/// since it is only ever used to stage the handful of threads a single tick
/// wakes up before they are re-linked into the run queue.
mod heapless_ids {
    use super::ThreadId;
    use kernel_info::memory::MAX_THREADS;

    pub struct SmallIdSet {
        items: [ThreadId; MAX_THREADS],
        len: usize,
    }

    impl SmallIdSet {
        pub const fn new() -> Self {
            Self {
                items: [0; MAX_THREADS],
                len: 0,
            }
        }

        pub fn push(&mut self, id: ThreadId) {
            self.items[self.len] = id;
            self.len += 1;
        }

        pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
            self.items[..self.len].iter().copied()
        }
    }
}

/// Voluntarily give up the remainder of this thread's timeslice.
pub fn yield_now() {
    unsafe {
        core::arch::asm!("int {v}", v = const crate::interrupts::resched::RESCHED_VECTOR);
    }
}

/// Sleep the calling thread for approximately `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    let ticks_per_ms = TSC_TICKS_PER_MS.load(Ordering::Relaxed).max(1);
    let deadline = now_tsc() + ms * ticks_per_ms;

    {
        let cpu = Scheduler::cpu_id();
        let mut sched = SCHED.lock_irq();
        if let Some(tid) = sched.current[cpu] {
            sched.thread_mut(tid).wake_tsc = Some(deadline);
            sched.thread_mut(tid).state = ThreadState::Sleeping;
            let threads = &mut sched.threads;
            sched.sleeping.insert(threads, tid);
        }
    }
    yield_now();
}

/// Transition a sleeping/blocked thread back to runnable immediately.
pub fn wake(tid: ThreadId) {
    let mut sched = SCHED.lock_irq();
    let state = sched.thread(tid).state;
    if !matches!(state, ThreadState::Sleeping | ThreadState::Blocked) {
        return;
    }
    if state == ThreadState::Sleeping {
        let threads = &mut sched.threads;
        sched.sleeping.remove(threads, tid);
    }
    sched.thread_mut(tid).state = ThreadState::Runnable;
    sched.thread_mut(tid).wake_tsc = None;
    let threads = &mut sched.threads;
    threads[tid as usize].as_mut().unwrap().next = tid;
    threads[tid as usize].as_mut().unwrap().prev = tid;
    sched.run_queue.push_back(threads, tid);
}

/// Terminate the calling thread. Never returns; the next scheduled thread
/// resumes in its place.
pub fn exit() -> ! {
    {
        let cpu = Scheduler::cpu_id();
        let mut sched = SCHED.lock_irq();
        if let Some(tid) = sched.current[cpu] {
            sched.thread_mut(tid).state = ThreadState::Zombie;
            let pid = sched.thread(tid).pid;
            if let Some(p) = sched.processes.get_mut(pid) {
                p.num_threads = p.num_threads.saturating_sub(1);
            }
        }
    }
    yield_now();
    unreachable!("a zombie thread must never be rescheduled");
}
