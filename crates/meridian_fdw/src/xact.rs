//! Local transaction nesting as seen by foreign-data code.

use meridian_common::error::FdwError;
use meridian_common::types::{Csn, IsolationLevel, Xid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubXactEvent {
    StartSub,
    PreCommitSub,
    CommitSub,
    AbortSub,
}

/// Called at every subtransaction boundary with the nesting level of the
/// subtransaction that is starting or ending.
pub trait SubXactObserver {
    fn on_subxact(&mut self, event: SubXactEvent, nest_level: u32) -> Result<(), FdwError>;
}

/// The local transaction a session is running.
///
/// Level 1 is the top-level transaction; each subtransaction adds one.
#[derive(Debug, Clone)]
pub struct LocalXactState {
    xid: Option<Xid>,
    isolation: IsolationLevel,
    nest_level: u32,
    global_csn: Option<Csn>,
}

impl LocalXactState {
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            xid: None,
            isolation,
            nest_level: 1,
            global_csn: None,
        }
    }

    pub fn with_xid(mut self, xid: Xid) -> Self {
        self.xid = Some(xid);
        self
    }

    /// Take part in a global snapshot: `csn` is pushed to every remote
    /// session the transaction touches.
    pub fn with_global_snapshot(mut self, csn: Csn) -> Self {
        self.global_csn = Some(csn);
        self
    }

    pub fn xid(&self) -> Option<Xid> {
        self.xid
    }

    pub fn set_xid(&mut self, xid: Xid) {
        self.xid = Some(xid);
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn nest_level(&self) -> u32 {
        self.nest_level
    }

    pub fn global_csn(&self) -> Option<Csn> {
        self.global_csn
    }

    /// Update the exported snapshot CSN, e.g. after the snapshot is retaken.
    pub fn set_global_csn(&mut self, csn: Csn) {
        self.global_csn = Some(csn);
    }

    pub fn start_subtransaction(
        &mut self,
        observers: &mut [&mut dyn SubXactObserver],
    ) -> Result<(), FdwError> {
        self.nest_level += 1;
        notify(observers, SubXactEvent::StartSub, self.nest_level)
    }

    /// Pre-commit runs while the subtransaction is still current; an error
    /// there leaves the level unchanged so the caller can abort it instead.
    pub fn commit_subtransaction(
        &mut self,
        observers: &mut [&mut dyn SubXactObserver],
    ) -> Result<(), FdwError> {
        let level = self.top_sub_level()?;
        notify(observers, SubXactEvent::PreCommitSub, level)?;
        self.nest_level -= 1;
        notify(observers, SubXactEvent::CommitSub, level)
    }

    /// The level is popped even when an observer fails.
    pub fn abort_subtransaction(
        &mut self,
        observers: &mut [&mut dyn SubXactObserver],
    ) -> Result<(), FdwError> {
        let level = self.top_sub_level()?;
        let result = notify(observers, SubXactEvent::AbortSub, level);
        self.nest_level -= 1;
        result
    }

    fn top_sub_level(&self) -> Result<u32, FdwError> {
        if self.nest_level <= 1 {
            return Err(FdwError::MissedSubxactCleanup(self.nest_level));
        }
        Ok(self.nest_level)
    }
}

fn notify(
    observers: &mut [&mut dyn SubXactObserver],
    event: SubXactEvent,
    level: u32,
) -> Result<(), FdwError> {
    let mut first_err = None;
    for observer in observers.iter_mut() {
        if let Err(e) = observer.on_subxact(event, level) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}
