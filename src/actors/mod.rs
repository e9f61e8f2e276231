//! Event plumbing between the control loops
//!
//! ```text
//!   ResourceMonitor ──┐
//!   StorageMonitor  ──┼──► broadcast<AlertEvent> ──► NotifierActor ──► webhook
//!   StorageAlerting ──┘
//!
//!   ScalabilityManager ──► broadcast<ScalingEvent> ──► subscribers
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: the notifier has an mpsc command channel for control messages
//! 2. **Events**: producers publish to broadcast channels for fan-out
//! 3. **Request/Response**: oneshot channels for queries

pub mod messages;
pub mod notifier;
