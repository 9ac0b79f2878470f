//! The process table: the coarse-grained container a [`super::Thread`] runs under.
//!
//! Every process today shares the single kernel address space created in
//! [`crate::alloc`] — there is no per-process PML4 yet, only a recorded `cr3`
//! snapshot for bookkeeping and future debugger-CLI dumps (`proc <pid>`).
//! `cpl` governs which selectors and stack layout a thread spawned under this
//! process receives; it does not yet gate a real privilege boundary between
//! processes.

use kernel_info::memory::MAX_PROCESSES;
use kernel_vmem::addresses::PhysicalAddress;

pub type Pid = u32;

/// Privilege level new threads of a process run at.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Cpl {
    Ring0,
    Ring3,
}

pub struct Process {
    pub pid: Pid,
    pub cpl: Cpl,
    /// CR3 snapshot at process-creation time.
    pub page_table_root: PhysicalAddress,
    pub num_threads: u32,
}

impl Process {
    const fn empty(pid: Pid, cpl: Cpl, page_table_root: PhysicalAddress) -> Self {
        Self {
            pid,
            cpl,
            page_table_root,
            num_threads: 0,
        }
    }
}

/// Fixed-capacity process table, linearly scanned like
/// [`kernel_vmem::address_space::reservation::ReservationList`].
pub struct ProcessTable {
    slots: [Option<Process>; MAX_PROCESSES],
    next_pid: Pid,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PROCESSES],
            next_pid: 1,
        }
    }

    /// Create a new process, returning its freshly allocated PID.
    ///
    /// # Panics
    /// Panics if the table is full (`MAX_PROCESSES` live processes) — this is
    /// a fixed, debug-time sizing bound, not a recoverable runtime error.
    pub fn create(&mut self, cpl: Cpl, page_table_root: PhysicalAddress) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .expect("process table exhausted");
        *slot = Some(Process::empty(pid, cpl, page_table_root));
        pid
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.iter_mut().flatten().find(|p| p.pid == pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.iter().flatten().find(|p| p.pid == pid)
    }
}
