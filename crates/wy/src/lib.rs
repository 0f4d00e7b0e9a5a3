pub mod client;
pub mod engine;
pub mod metrics;
pub mod server;
pub mod tunnel;

pub use client::{LoadGenerator, LoadPlan, Repetition};
pub use server::{App, TargetServer};
