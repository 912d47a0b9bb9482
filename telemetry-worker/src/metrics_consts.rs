pub const EVENTS_PUBLISHED: &str = "telemetry_worker_events_published_total";
pub const EVENTS_DROPPED_TOO_BIG: &str = "telemetry_worker_events_dropped_too_big_total";
pub const INBOUND_DECODE_FAILURES: &str = "telemetry_worker_decode_failures_total";
pub const INBOUND_NOTHING_DECODED: &str = "telemetry_worker_nothing_decoded_total";
pub const EVENTS_ROUTED: &str = "telemetry_worker_events_routed_total";
pub const COMMAND_OUTCOMES: &str = "telemetry_worker_command_outcomes_total";
pub const MAPPING_RELOADS: &str = "telemetry_worker_mapping_reloads_total";
pub const MAPPING_RELOAD_FAILURES: &str = "telemetry_worker_mapping_reload_failures_total";
