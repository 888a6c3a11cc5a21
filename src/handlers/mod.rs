pub mod health;

pub use health::{AppState, component_health, health_summary};
