use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use thiserror::Error;

use super::{
    coroutine::{Step, WorkgroupCoroutine},
    interp::ExecError,
};
use crate::{code::BarrierId, memory::WorkgroupMemory, program::ProgramData};

/// One request to execute a bound program over a grid of workgroups.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub data: Arc<ProgramData>,
    /// Workgroup counts along X/Y/Z.
    pub grid: [u32; 3],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Workgroups run to completion.
    pub workgroups: usize,
    /// Invocations run to completion.
    pub invocations: usize,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("execution trapped in workgroup {workgroup:?}: {source}")]
    Exec {
        workgroup: [u32; 3],
        #[source]
        source: ExecError,
    },
    #[error("dispatch cancelled after {completed} of {total} workgroups")]
    Cancelled { completed: usize, total: usize },
    #[error("engine channel closed")]
    Closed(#[from] flume::RecvError),
}

/// Cooperative cancellation token for an in-flight dispatch.
///
/// Observed between resume rounds and between workgroups; outstanding
/// coroutines are dropped before their workgroup's memory. A trap aborts the
/// dispatch through the same token.
#[derive(Debug, Default, Clone)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Splits `subgroups` into at most `parts` contiguous, disjoint, covering
/// ranges of near-equal size, as `(first, count)` pairs.
pub fn partition(subgroups: u32, parts: usize) -> Vec<(u32, u32)> {
    if subgroups == 0 {
        return vec![];
    }
    let parts = (parts.min(subgroups as usize).max(1)) as u32;
    let base = subgroups / parts;
    let rem = subgroups % parts;
    let mut first = 0;
    (0..parts)
        .map(|part| {
            let count = base + (part < rem) as u32;
            let range = (first, count);
            first += count;
            range
        })
        .collect()
}

/// Owns the coroutine lifecycle for whole dispatches.
///
/// For each workgroup coordinate it allocates the shared memory, begins one
/// coroutine per partitioned subgroup range, and resumes them in rounds: a
/// round either completes every coroutine or parks them all at one barrier,
/// which is the rendezvous the happens-before rule of workgroup memory
/// hangs on. Workgroups are independent; with the `rayon` feature both the
/// workgroups and the coroutines within a round run on the thread pool.
#[derive(Debug, Clone)]
pub struct Driver {
    coroutines: usize,
}

impl Default for Driver {
    fn default() -> Self {
        Self { coroutines: 1 }
    }
}

impl Driver {
    /// A driver that splits each workgroup into at most `coroutines`
    /// coroutines.
    pub fn new(coroutines: usize) -> Self {
        assert!(coroutines > 0, "driver needs at least one coroutine");
        Self { coroutines }
    }

    pub fn dispatch(
        &self,
        dispatch: &Dispatch,
        cancel: &Cancel,
    ) -> Result<DispatchReport, DispatchError> {
        let data = &dispatch.data;
        let info = data.info();
        let [x, y, z] = dispatch.grid;
        let total = x as usize * y as usize * z as usize;
        let coords: Vec<[u32; 3]> = itertools::iproduct!(0..z, 0..y, 0..x)
            .map(|(z, y, x)| [x, y, z])
            .collect();
        log::trace!(
            "dispatch `{}` over {:?} ({total} workgroups)",
            info.entry,
            dispatch.grid
        );

        #[cfg(not(feature = "rayon"))]
        let completed = {
            let mut completed = 0;
            for &workgroup in &coords {
                if cancel.is_cancelled() {
                    break;
                }
                match self.run_workgroup(data, workgroup, cancel) {
                    Ok(true) => completed += 1,
                    Ok(false) => break,
                    Err(source) => return Err(DispatchError::Exec { workgroup, source }),
                }
            }
            completed
        };
        #[cfg(feature = "rayon")]
        let completed = {
            use rayon::prelude::*;

            let runs: Vec<_> = coords
                .par_iter()
                .map(|&workgroup| {
                    if cancel.is_cancelled() {
                        return (workgroup, Ok(false));
                    }
                    let run = self.run_workgroup(data, workgroup, cancel);
                    if run.is_err() {
                        cancel.cancel();
                    }
                    (workgroup, run)
                })
                .collect();

            let mut completed = 0;
            for (workgroup, run) in runs {
                match run {
                    Ok(true) => completed += 1,
                    Ok(false) => {}
                    Err(source) => return Err(DispatchError::Exec { workgroup, source }),
                }
            }
            completed
        };

        if completed < total {
            return Err(DispatchError::Cancelled { completed, total });
        }
        Ok(DispatchReport {
            workgroups: completed,
            invocations: completed * info.invocations() as usize,
        })
    }

    /// Runs one workgroup to completion. Returns `Ok(false)` if cancelled
    /// before finishing.
    fn run_workgroup(
        &self,
        data: &Arc<ProgramData>,
        workgroup: [u32; 3],
        cancel: &Cancel,
    ) -> Result<bool, ExecError> {
        let info = data.info();
        // declared after the memory, so on every exit path the coroutines
        // drop before the workgroup memory they share
        let memory = WorkgroupMemory::new(info.workgroup_words);
        let mut coroutines: Vec<_> = partition(info.subgroups(), self.coroutines)
            .into_iter()
            .map(|(first, count)| {
                WorkgroupCoroutine::begin(data.clone(), workgroup, memory.clone(), first, count)
            })
            .collect();

        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            #[cfg(not(feature = "rayon"))]
            let steps: Vec<Step> = coroutines
                .iter_mut()
                .map(WorkgroupCoroutine::resume)
                .collect::<Result<_, _>>()?;
            #[cfg(feature = "rayon")]
            let steps: Vec<Step> = {
                use rayon::prelude::*;
                coroutines
                    .par_iter_mut()
                    .map(WorkgroupCoroutine::resume)
                    .collect::<Result<_, _>>()?
            };

            // a non-error round is unanimous: every coroutine completed, or
            // every coroutine parked at the same barrier
            let mut complete = 0;
            let mut barrier: Option<BarrierId> = None;
            for step in steps {
                match step {
                    Step::Complete => complete += 1,
                    Step::Yield(result) => match barrier {
                        None => barrier = Some(result.barrier),
                        Some(lhs) if lhs != result.barrier => {
                            return Err(ExecError::BarrierMismatch {
                                lhs,
                                rhs: result.barrier,
                            });
                        }
                        Some(_) => {}
                    },
                }
            }
            match barrier {
                None => return Ok(true),
                Some(id) if complete > 0 => return Err(ExecError::BarrierExit(id)),
                Some(id) => log::trace!("workgroup {workgroup:?} rendezvous at {id}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use itertools::Itertools;

    use super::{Cancel, Dispatch, DispatchError, Driver, partition};
    use crate::{
        code::{BarrierId, BinaryOp, Builtin, Dim, Instr, Reg, Routine, RoutineBuilder},
        exec::interp::ExecError,
        memory::Storage,
        program::{
            BindingInfo, BufferDescriptor, DescriptorSetLayout, Program, ProgramData, ProgramInfo,
        },
    };

    fn bind(
        workgroup_size: [u32; 3],
        subgroup_width: u32,
        workgroup_words: usize,
        routine: Routine,
        buffer_words: usize,
    ) -> (Arc<ProgramData>, BufferDescriptor) {
        let info = ProgramInfo {
            entry: "test".into(),
            workgroup_size,
            subgroup_width,
            workgroup_words,
            bindings: vec![BindingInfo {
                min_len: buffer_words * 4,
            }]
            .into(),
        };
        let program = Arc::new(Program::new(info, routine).expect("must validate"));
        let descriptor = BufferDescriptor::new(Storage::zeroed(buffer_words));
        let layout = DescriptorSetLayout::new(vec![descriptor.clone()]);
        let data = ProgramData::bind(program, layout, []).expect("must bind");
        (Arc::new(data), descriptor)
    }

    #[test]
    fn test_partition() {
        assert_eq!(partition(4, 1), vec![(0, 4)]);
        assert_eq!(partition(4, 2), vec![(0, 2), (2, 2)]);
        assert_eq!(partition(5, 2), vec![(0, 3), (3, 2)]);
        assert_eq!(partition(2, 8), vec![(0, 1), (1, 1)]);

        fastrand::seed(42);
        for _ in 0..100 {
            let subgroups = fastrand::u32(1..100);
            let parts = fastrand::usize(1..20);
            let ranges = partition(subgroups, parts);

            assert!(ranges.len() <= parts);
            let mut next = 0;
            for &(first, count) in &ranges {
                // contiguous, disjoint, non-empty
                assert_eq!(first, next);
                assert!(count > 0);
                next = first + count;
            }
            // covering
            assert_eq!(next, subgroups);
        }
    }

    /// Rotates a shared ring by one slot per iteration, twice, with two
    /// barriers per iteration, then writes each slot out to the buffer.
    fn rotate_routine(n: u32) -> Routine {
        let mut b = RoutineBuilder::new(7);
        let head = b.label();
        let exit = b.label();
        b.push(Instr::Builtin {
            dst: Reg(0),
            builtin: Builtin::LocalIndex,
        })
        .push(Instr::Const {
            dst: Reg(6),
            value: n,
        })
        .push(Instr::SharedStore {
            addr: Reg(0),
            src: Reg(0),
        })
        .push(Instr::Const {
            dst: Reg(3),
            value: 0,
        })
        .bind(head)
        .push(Instr::Const {
            dst: Reg(4),
            value: 2,
        })
        .push(Instr::Binary {
            dst: Reg(5),
            op: BinaryOp::Lt,
            lhs: Reg(3),
            rhs: Reg(4),
        })
        .branch_zero(Reg(5), exit)
        .push(Instr::Barrier { id: BarrierId(0) })
        .push(Instr::Const {
            dst: Reg(4),
            value: 1,
        })
        .push(Instr::Binary {
            dst: Reg(1),
            op: BinaryOp::Add,
            lhs: Reg(0),
            rhs: Reg(4),
        })
        .push(Instr::Binary {
            dst: Reg(1),
            op: BinaryOp::Rem,
            lhs: Reg(1),
            rhs: Reg(6),
        })
        .push(Instr::SharedLoad {
            dst: Reg(2),
            addr: Reg(1),
        })
        .push(Instr::Barrier { id: BarrierId(1) })
        .push(Instr::SharedStore {
            addr: Reg(0),
            src: Reg(2),
        })
        .push(Instr::Binary {
            dst: Reg(3),
            op: BinaryOp::Add,
            lhs: Reg(3),
            rhs: Reg(4),
        })
        .jump(head)
        .bind(exit)
        .push(Instr::SharedLoad {
            dst: Reg(2),
            addr: Reg(0),
        })
        .push(Instr::Store {
            binding: 0,
            addr: Reg(0),
            src: Reg(2),
        })
        .push(Instr::Return);
        b.build().expect("must build")
    }

    #[test]
    fn test_partition_determinism() {
        const N: u32 = 8;
        let expected = (0..N).map(|i| (i + 2) % N).collect_vec();

        for coroutines in 1..=4 {
            let (data, buffer) = bind([N, 1, 1], 2, N as usize, rotate_routine(N), N as usize);
            let driver = Driver::new(coroutines);
            let dispatch = Dispatch {
                data,
                grid: [1, 1, 1],
            };
            let report = driver
                .dispatch(&dispatch, &Cancel::new())
                .expect("must dispatch");

            assert_eq!(report.workgroups, 1);
            assert_eq!(report.invocations, N as usize);
            assert_eq!(buffer.to_words(), expected, "split into {coroutines}");
        }
    }

    #[test]
    fn test_split_barrier_visibility() {
        // invocation i publishes 10 + i, then reads slot n - 1 - i after the
        // barrier; with two coroutines of one subgroup each, every read
        // crosses the coroutine split
        let code = vec![
            Instr::Builtin {
                dst: Reg(0),
                builtin: Builtin::LocalIndex,
            },
            Instr::Const {
                dst: Reg(1),
                value: 10,
            },
            Instr::Binary {
                dst: Reg(2),
                op: BinaryOp::Add,
                lhs: Reg(0),
                rhs: Reg(1),
            },
            Instr::SharedStore {
                addr: Reg(0),
                src: Reg(2),
            },
            Instr::Barrier { id: BarrierId(0) },
            Instr::Const {
                dst: Reg(3),
                value: 3,
            },
            Instr::Binary {
                dst: Reg(4),
                op: BinaryOp::Sub,
                lhs: Reg(3),
                rhs: Reg(0),
            },
            Instr::SharedLoad {
                dst: Reg(5),
                addr: Reg(4),
            },
            Instr::Store {
                binding: 0,
                addr: Reg(0),
                src: Reg(5),
            },
            Instr::Return,
        ];
        let routine = Routine::new(code, 6).expect("must build");

        let (data, buffer) = bind([4, 1, 1], 2, 4, routine, 4);
        let driver = Driver::new(2);
        let dispatch = Dispatch {
            data,
            grid: [1, 1, 1],
        };
        driver
            .dispatch(&dispatch, &Cancel::new())
            .expect("must dispatch");
        assert_eq!(buffer.to_words(), vec![13, 12, 11, 10]);
    }

    #[test]
    fn test_grid_coordinates() {
        // buffer[global_id.x] = global_id.x * 10 across 2 workgroups
        let code = vec![
            Instr::Builtin {
                dst: Reg(0),
                builtin: Builtin::GlobalId(Dim::X),
            },
            Instr::Const {
                dst: Reg(1),
                value: 10,
            },
            Instr::Binary {
                dst: Reg(2),
                op: BinaryOp::Mul,
                lhs: Reg(0),
                rhs: Reg(1),
            },
            Instr::Store {
                binding: 0,
                addr: Reg(0),
                src: Reg(2),
            },
            Instr::Return,
        ];
        let routine = Routine::new(code, 3).expect("must build");

        let (data, buffer) = bind([2, 1, 1], 2, 0, routine, 4);
        let dispatch = Dispatch {
            data,
            grid: [2, 1, 1],
        };
        let report = Driver::default()
            .dispatch(&dispatch, &Cancel::new())
            .expect("must dispatch");

        assert_eq!(report.workgroups, 2);
        assert_eq!(report.invocations, 4);
        assert_eq!(buffer.to_words(), vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_trap_reports_workgroup() {
        // store far out of the bound view
        let code = vec![
            Instr::Const {
                dst: Reg(0),
                value: 100,
            },
            Instr::Store {
                binding: 0,
                addr: Reg(0),
                src: Reg(0),
            },
            Instr::Return,
        ];
        let routine = Routine::new(code, 1).expect("must build");

        let (data, _) = bind([1, 1, 1], 1, 0, routine, 4);
        let dispatch = Dispatch {
            data,
            grid: [1, 1, 1],
        };
        let err = Driver::default()
            .dispatch(&dispatch, &Cancel::new())
            .expect_err("must trap");
        assert!(matches!(
            err,
            DispatchError::Exec {
                workgroup: [0, 0, 0],
                source: ExecError::Buffer { binding: 0, .. }
            }
        ));
    }

    #[test]
    fn test_cancelled_before_start() {
        let code = vec![
            Instr::Builtin {
                dst: Reg(0),
                builtin: Builtin::LocalIndex,
            },
            Instr::Store {
                binding: 0,
                addr: Reg(0),
                src: Reg(0),
            },
            Instr::Return,
        ];
        let routine = Routine::new(code, 1).expect("must build");

        let (data, buffer) = bind([2, 2, 1], 1, 0, routine, 4);
        let cancel = Cancel::new();
        cancel.cancel();

        let dispatch = Dispatch {
            data,
            grid: [4, 1, 1],
        };
        let err = Driver::default()
            .dispatch(&dispatch, &cancel)
            .expect_err("must cancel");
        assert!(matches!(
            err,
            DispatchError::Cancelled {
                completed: 0,
                total: 4
            }
        ));
        // no side effects from any destroyed coroutine
        assert_eq!(buffer.to_words(), vec![0; 4]);
    }
}
