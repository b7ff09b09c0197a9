//! `weft` executes compiled GPU compute programs on the CPU, reproducing
//! workgroup and subgroup semantics with coroutines on ordinary threads.
//!
//! ## Key Components
//! 1. **Program Model**:
//!    - Kernel bytecode ([`code::Routine`]) with a label-patching builder.
//!    - Reflection metadata ([`program::ProgramInfo`]) and validated
//!      resource binding ([`program::ProgramData`]).
//!
//! 2. **Execution Model**:
//!    - One [`exec::WorkgroupCoroutine`] per contiguous subgroup range,
//!      suspending only at barriers.
//!    - A driver that partitions subgroups, drives coroutines in rounds, and
//!      enforces the barrier rendezvous that orders workgroup memory.
//!    - An async engine front over a `flume` event channel.
//!
//! 3. **Memory Model**:
//!    - Word-addressed shared storage for buffers and workgroup memory;
//!      well-defined under any interleaving, ordered by barriers.
//!
//! ## Design Principles
//! - **Determinism**: results do not depend on how subgroups are split
//!   across coroutines or threads.
//! - **Cooperative scheduling**: execution yields only at barriers or
//!   completion, never preemptively.
//! - **Validation before execution**: a dispatch either binds and runs, or
//!   is rejected before any side effect.

pub mod code;
pub mod exec;
pub mod memory;
pub mod platform;
pub mod program;
