use std::sync::Arc;

use derive_more::{Deref, DerefMut, Display};

use super::interp::{ExecCx, ExecError, Lane, LaneYield};
use crate::{code::BarrierId, memory::WorkgroupMemory, program::ProgramData};

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct CoroutineId(uid::Id<CoroutineId>);

/// What a suspended coroutine reports: the synchronization point it reached.
/// The driver must not resume it past this barrier until every coroutine of
/// the same workgroup has reported the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YieldResult {
    pub barrier: BarrierId,
}

/// Outcome of one [`WorkgroupCoroutine::resume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Suspended at a barrier.
    Yield(YieldResult),
    /// Every invocation of the coroutine's range has finished.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Suspended,
    Completed,
}

/// A suspendable execution context covering a contiguous subgroup range of
/// one workgroup.
///
/// Lifecycle: [`begin`](Self::begin), then [`resume`](Self::resume) until it
/// returns [`Step::Complete`], then drop. Dropping earlier cancels the
/// remaining work with no further side effects. Resuming after completion is
/// a caller bug and panics.
#[derive(Debug)]
pub struct WorkgroupCoroutine {
    id: CoroutineId,
    data: Arc<ProgramData>,
    workgroup: [u32; 3],
    memory: WorkgroupMemory,
    first_subgroup: u32,
    subgroup_count: u32,
    lanes: Vec<Lane>,
    state: State,
}

impl WorkgroupCoroutine {
    /// Creates a coroutine for subgroups
    /// `[first_subgroup, first_subgroup + subgroup_count)` of the workgroup at
    /// `workgroup`.
    ///
    /// The range must lie within the program's subgroup count and `memory`
    /// must cover the program's declared footprint; the driver enforces both
    /// before calling.
    pub fn begin(
        data: Arc<ProgramData>,
        workgroup: [u32; 3],
        memory: WorkgroupMemory,
        first_subgroup: u32,
        subgroup_count: u32,
    ) -> Self {
        let info = data.info();
        assert!(subgroup_count > 0, "empty subgroup range");
        assert!(
            first_subgroup + subgroup_count <= info.subgroups(),
            "subgroup range [{first_subgroup}, {}) exceeds {} subgroups",
            first_subgroup + subgroup_count,
            info.subgroups()
        );
        assert!(
            memory.words() >= info.workgroup_words,
            "workgroup memory of {} words, program declares {}",
            memory.words(),
            info.workgroup_words
        );

        let registers = data.program().routine().registers();
        let first = first_subgroup * info.subgroup_width;
        let last = ((first_subgroup + subgroup_count) * info.subgroup_width)
            .min(info.invocations());
        let lanes = (first..last)
            .map(|invocation| Lane::new(invocation, registers))
            .collect();

        let id = CoroutineId(uid::Id::new());
        log::trace!(
            "begin coroutine {id} of `{}`: workgroup {workgroup:?}, subgroups [{first_subgroup}, {})",
            info.entry,
            first_subgroup + subgroup_count
        );
        Self {
            id,
            data,
            workgroup,
            memory,
            first_subgroup,
            subgroup_count,
            lanes,
            state: State::Created,
        }
    }

    #[inline]
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    #[inline]
    pub fn workgroup(&self) -> [u32; 3] {
        self.workgroup
    }

    /// The covered subgroup range as `(first, count)`.
    #[inline]
    pub fn subgroup_range(&self) -> (u32, u32) {
        (self.first_subgroup, self.subgroup_count)
    }

    /// Runs every unfinished invocation until the next suspension point or
    /// completion.
    ///
    /// All lanes must agree on the outcome of a round: a mix of returned and
    /// barrier-parked lanes, or two different barrier ids, is a broken
    /// program and traps.
    pub fn resume(&mut self) -> Result<Step, ExecError> {
        assert!(
            self.state != State::Completed,
            "coroutine resumed after completion"
        );
        let cx = ExecCx {
            data: &self.data,
            shared: &self.memory,
            workgroup: self.workgroup,
        };

        let mut barrier = None;
        let mut finished = 0usize;
        for lane in self.lanes.iter_mut().filter(|lane| !lane.finished()) {
            match lane.run(&cx)? {
                LaneYield::Finished => finished += 1,
                LaneYield::Barrier(id) => match barrier {
                    None => barrier = Some(id),
                    Some(lhs) if lhs != id => {
                        return Err(ExecError::BarrierMismatch { lhs, rhs: id });
                    }
                    Some(_) => {}
                },
            }
        }

        match barrier {
            Some(id) if finished > 0 => Err(ExecError::BarrierExit(id)),
            Some(barrier) => {
                self.state = State::Suspended;
                Ok(Step::Yield(YieldResult { barrier }))
            }
            None => {
                self.state = State::Completed;
                Ok(Step::Complete)
            }
        }
    }
}
