//! Coroutine-based execution of compiled programs: per-invocation
//! interpretation, workgroup coroutines, the barrier-driving dispatcher, and
//! the async engine front.

pub use coroutine::{CoroutineId, Step, WorkgroupCoroutine, YieldResult};
pub use driver::{Cancel, Dispatch, DispatchError, DispatchReport, Driver, partition};
pub use engine::{Engine, EngineBuilder, EngineEvent};
pub use interp::ExecError;

pub mod coroutine;
pub mod driver;
pub mod engine;
pub mod interp;
