// Common library for shared code across the seeder and reconciler

pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod models;
pub mod notification;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod schedule;
pub mod seed;
pub mod store;
pub mod telemetry;
