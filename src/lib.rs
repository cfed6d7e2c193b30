//! Session isolation and lifecycle management for ephemeral research
//! sandboxes: credential provisioning, port and subnet allocation, runtime
//! orchestration, TTL expiry reconciliation, and per-session ephemeral
//! storage.

pub mod allocator;
pub mod auth;
pub mod descriptor;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod shared;
pub mod store;
