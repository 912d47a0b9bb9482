//! Pipeline stages run by the `telemetry-worker` binary.
//!
//! * `inbound`: consume raw device payloads, decode them and publish event
//!   requests to the decoded events topic.
//! * `events`: consume decoded event requests, route them by event type and
//!   deliver command invocations to the destinations mapped for the target
//!   device's type.

pub mod config;
pub mod event_router;
pub mod events;
pub mod inbound;
pub mod metrics_consts;
pub mod reload;
pub mod sink;
