pub mod command;
pub mod cron;
pub mod health;
pub mod telemetry;

pub use command::*;
pub use cron::*;
pub use health::*;
pub use telemetry::*;
