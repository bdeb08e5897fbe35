//! Session Layer
//!
//! One host process runs exactly one session: allocation, waiting for
//! participants, the round loop, and the scheduled shutdown that follows.

pub mod context;
pub mod coordinator;
pub mod lifecycle;
pub mod matchmaking;
pub mod shutdown;

pub use context::{SessionContext, SessionError, SessionOutcome};
pub use coordinator::{
    CoordinatorError, EndReason, GameSummary, RoundCoordinator, RoundProgress, RoundTimings,
};
pub use lifecycle::{GameEnd, LifecycleError, SessionLifecycle, SessionState};
pub use matchmaking::{AllocationClient, AllocationError, Roster, StaticAllocation};
pub use shutdown::{
    ExitProcess, ProcessTerminator, ShutdownKind, ShutdownRequest, ShutdownScheduler,
    TokenTerminator,
};
