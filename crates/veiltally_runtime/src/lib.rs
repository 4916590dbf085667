#![forbid(unsafe_code)]

pub mod flows;
pub mod lifecycle;

pub use lifecycle::{ControllerConfig, LifecycleController, LifecycleEvent, LifecycleState};
