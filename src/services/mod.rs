// Bridge services
pub mod command_executor;
pub mod command_lease;
pub mod control_plane;
pub mod cron_mirror;
pub mod heartbeat;
pub mod sse;
pub mod status_registry;
pub mod telemetry_spooler;

#[cfg(test)]
pub(crate) mod testing;

pub use command_executor::{CliCommandExecutor, CommandExecutor};
pub use command_lease::{CommandLeaseClient, Disposition, InFlightCommands, LeaseSettings};
pub use control_plane::{ControlPlane, HttpControlPlane};
pub use cron_mirror::{CronMirror, CronSource, JsonFileCronSource};
pub use heartbeat::HeartbeatEmitter;
pub use sse::{SseDecoder, SseEvent, decode_events};
pub use status_registry::StatusRegistry;
pub use telemetry_spooler::TelemetrySpooler;
