use tokio::sync::oneshot;

use crate::error::CycleError;
use crate::job::Schedule;

/// Commands sent from a `JobHandle` (or a watch handler) to the job's trigger loop.
#[derive(Debug)]
pub(crate) enum TriggerCommand {
  /// Run one cycle now, outside the regular schedule.
  RunNow {
    /// Receives the cycle outcome. `None` for fire-and-forget follow-up cycles
    /// requested after a failover claim.
    responder: Option<oneshot::Sender<Result<(), CycleError>>>,
  },
  /// Replace the schedule; the next due time is recomputed from now.
  UpdateSchedule {
    schedule: Schedule,
    responder: oneshot::Sender<()>,
  },
}

/// Represents the requested shutdown mode. Sent via a `watch` channel.
/// `None` indicates the job is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Let the in-flight cycle finish, then stop triggering.
  Graceful,
  /// Stop the trigger loop without waiting for the in-flight cycle.
  /// Item bodies already spawned still run to completion.
  Force,
}
