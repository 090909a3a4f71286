//! Process ownership revert
//!
//! While the kernel was suspended in Falcon mode the BIOS tracked page-table
//! roots on its own. After resume every owner is reported back so that the
//! BIOS bookkeeping matches the live task list again.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use falcon_abi::{owner, svc};
use spinning_top::RwSpinlock;

use crate::addr::PhysAddr;
use crate::bios::{BiosChannel, ResidentBios};

/// Process ID type
pub type Pid = u32;

/// Address space of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub page_table_root: PhysAddr,
    /// Tasks other than the borrowing idle task using this address space
    pub users: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub pid: Pid,
    /// Kernel threads have none
    pub mm: Option<MemoryDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    /// The kernel's own page table
    Init,
    /// Identity map used around power transitions
    IdentityMap,
    /// Idle task of a CPU
    Idle(u32),
    Task,
}

impl OwnerKind {
    fn code(self) -> u32 {
        match self {
            OwnerKind::Init => owner::INIT,
            OwnerKind::IdentityMap => owner::IDENTITY_MAP,
            OwnerKind::Idle(_) => owner::IDLE,
            OwnerKind::Task => owner::TASK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessPageTableOwnership {
    pub pid: Pid,
    pub page_table_root: PhysAddr,
    pub kind: OwnerKind,
}

impl ProcessPageTableOwnership {
    /// `REVERT_PROCESS` arguments: `[pid, owner kind, root, cpu, 0]`
    pub fn args(&self) -> [u32; 5] {
        let cpu = match self.kind {
            OwnerKind::Idle(cpu) => cpu,
            _ => 0,
        };
        [self.pid, self.kind.code(), self.page_table_root.as_u32(), cpu, 0]
    }
}

// ============================================================================
// Task table
// ============================================================================

/// Live tasks plus the address spaces that are not owned by any task
pub struct TaskTable {
    init_mm: MemoryDescriptor,
    idmap_root: PhysAddr,
    /// Indexed by CPU
    idle: Vec<MemoryDescriptor>,
    tasks: RwSpinlock<BTreeMap<Pid, Task>>,
}

impl TaskTable {
    pub fn new(init_mm: MemoryDescriptor, idmap_root: PhysAddr, idle: Vec<MemoryDescriptor>) -> Self {
        Self {
            init_mm,
            idmap_root,
            idle,
            tasks: RwSpinlock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, task: Task) -> Option<Task> {
        self.tasks.write().insert(task.pid, task)
    }

    pub fn remove(&self, pid: Pid) -> Option<Task> {
        self.tasks.write().remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk every page-table owner with the task list read-locked.
    ///
    /// Order: init, identity map, idle tasks with no other users, then each
    /// task that has an address space.
    pub fn for_each_owner(&self, mut f: impl FnMut(ProcessPageTableOwnership)) {
        let tasks = self.tasks.read();

        f(ProcessPageTableOwnership {
            pid: 0,
            page_table_root: self.init_mm.page_table_root,
            kind: OwnerKind::Init,
        });
        f(ProcessPageTableOwnership {
            pid: 0,
            page_table_root: self.idmap_root,
            kind: OwnerKind::IdentityMap,
        });
        for (cpu, mm) in self.idle.iter().enumerate() {
            if mm.users == 0 {
                f(ProcessPageTableOwnership {
                    pid: 0,
                    page_table_root: mm.page_table_root,
                    kind: OwnerKind::Idle(cpu as u32),
                });
            }
        }
        for task in tasks.values() {
            if let Some(mm) = task.mm {
                f(ProcessPageTableOwnership {
                    pid: task.pid,
                    page_table_root: mm.page_table_root,
                    kind: OwnerKind::Task,
                });
            }
        }
    }
}

// ============================================================================
// Revert
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertReport {
    pub attempted: usize,
    /// Owners the BIOS did not accept
    pub failed: Vec<ProcessPageTableOwnership>,
}

impl RevertReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Report every page-table owner to the BIOS. Best effort: a rejected owner
/// is logged and the walk goes on.
pub fn revert_all<B: ResidentBios>(channel: &BiosChannel<B>, tasks: &TaskTable) -> RevertReport {
    let mut report = RevertReport::default();
    tasks.for_each_owner(|ownership| {
        report.attempted += 1;
        let rejected = match channel.call(svc::REVERT_PROCESS, ownership.args()) {
            Ok(rc) if rc >= 0 => return,
            Ok(rc) => rc,
            Err(_) => falcon_abi::rc::RC_ERR,
        };
        log::warn!(
            "[Falcon] ownership revert failed for pid {} ({:?}, root {}): {}",
            ownership.pid,
            ownership.kind,
            ownership.page_table_root,
            rejected
        );
        report.failed.push(ownership);
    });
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedBios, ready_channel};
    use alloc::vec;

    fn mm(root: u32, users: u32) -> MemoryDescriptor {
        MemoryDescriptor {
            page_table_root: PhysAddr::new(root),
            users,
        }
    }

    fn table() -> TaskTable {
        let table = TaskTable::new(
            mm(0x8000_4000, 1),
            PhysAddr::new(0x8000_8000),
            vec![mm(0x8100_0000, 0), mm(0x8200_0000, 2)],
        );
        for pid in 1..=5 {
            table.insert(Task {
                pid,
                mm: Some(mm(0x9000_0000 + pid * 0x4000, 1)),
            });
        }
        table.insert(Task { pid: 9, mm: None });
        table
    }

    #[test]
    fn test_owner_order() {
        let mut owners = Vec::new();
        table().for_each_owner(|o| owners.push(o));
        let kinds: Vec<_> = owners.iter().map(|o| o.kind).collect();
        assert_eq!(
            kinds,
            [
                OwnerKind::Init,
                OwnerKind::IdentityMap,
                OwnerKind::Idle(0),
                OwnerKind::Task,
                OwnerKind::Task,
                OwnerKind::Task,
                OwnerKind::Task,
                OwnerKind::Task,
            ]
        );
        assert_eq!(owners[0].page_table_root, PhysAddr::new(0x8000_4000));
        assert_eq!(owners[2].args(), [0, owner::IDLE, 0x8100_0000, 0, 0]);
        assert_eq!(owners[7].pid, 5);
    }

    /// The writer keeps the task pids a contiguous run of `SPAN` or
    /// `SPAN + 1`. A walk that saw a half-applied update would report a gap
    /// or a run of another length.
    #[test]
    fn test_walk_sees_one_snapshot_under_concurrent_updates() {
        use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
        use std::time::{Duration, Instant};

        const SPAN: u32 = 16;
        let table = TaskTable::new(mm(0x8000_4000, 1), PhysAddr::new(0x8000_8000), vec![mm(0x8100_0000, 0)]);
        let task = |pid| Task {
            pid,
            mm: Some(mm(0x9000_0000 + (pid % 0x1000) * 0x4000, 1)),
        };
        for pid in 1..=SPAN {
            table.insert(task(pid));
        }

        // Reject every task so the report lists the whole snapshot
        let bios = ScriptedBios::with_handler(|call| {
            std::thread::yield_now();
            (call.function_id == svc::REVERT_PROCESS && call.args[1] == owner::TASK).then_some(-1)
        });
        let channel = ready_channel(bios);
        let stop = AtomicBool::new(false);
        let updates = AtomicU32::new(0);

        let reports = std::thread::scope(|s| {
            s.spawn(|| {
                let (mut lo, mut hi) = (1, SPAN + 1);
                while !stop.load(Ordering::SeqCst) {
                    table.insert(task(hi));
                    hi += 1;
                    table.remove(lo);
                    lo += 1;
                    updates.fetch_add(1, Ordering::SeqCst);
                }
            });

            let deadline = Instant::now() + Duration::from_secs(5);
            let mut reports = Vec::new();
            while reports.len() < 50 || (updates.load(Ordering::SeqCst) < 200 && Instant::now() < deadline) {
                reports.push(revert_all(&channel, &table));
            }
            stop.store(true, Ordering::SeqCst);
            reports
        });

        assert!(updates.load(Ordering::SeqCst) > 0);
        for report in &reports {
            let pids: Vec<Pid> = report.failed.iter().map(|o| o.pid).collect();
            let len = pids.len() as u32;
            assert!(len == SPAN || len == SPAN + 1, "torn walk: {:?}", pids);
            assert!(pids.windows(2).all(|w| w[1] == w[0] + 1), "torn walk: {:?}", pids);
            assert_eq!(report.attempted, 3 + pids.len());
        }
    }

    #[test]
    fn test_failure_does_not_stop_the_walk() {
        let bios = ScriptedBios::with_handler(|call| {
            (call.function_id == svc::REVERT_PROCESS && call.args[1] == owner::TASK && call.args[0] == 3)
                .then_some(-1)
        });
        let channel = ready_channel(bios);
        let report = revert_all(&channel, &table());

        assert_eq!(report.attempted, 8);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].pid, 3);

        let task_pids: Vec<u32> = channel
            .bios()
            .calls_for(svc::REVERT_PROCESS)
            .iter()
            .filter(|c| c.args[1] == owner::TASK)
            .map(|c| c.args[0])
            .collect();
        assert_eq!(task_pids, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_bios_not_ready_fails_every_owner() {
        let channel = BiosChannel::new(ScriptedBios::new());
        let report = revert_all(&channel, &table());
        assert_eq!(report.failed.len(), report.attempted);
        assert!(channel.bios().calls().is_empty());
    }

    #[test]
    fn test_table_updates() {
        let table = table();
        assert_eq!(table.len(), 6);
        assert!(table.remove(3).is_some());
        assert!(table.remove(3).is_none());
        let report = revert_all(&ready_channel(ScriptedBios::new()), &table);
        assert_eq!(report.attempted, 7);
        assert!(report.is_clean());
    }
}
