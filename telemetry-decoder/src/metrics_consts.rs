/// Counter of event requests produced, labelled by `event_type`
pub const DECODER_EVENTS_DECODED: &str = "telemetry_decoder_events_decoded_total";

/// Counter of messages for which no decoder choice matched
pub const DECODER_NO_MATCH: &str = "telemetry_decoder_no_match_total";

/// Counter of messages rejected, labelled by `reason`
pub const DECODER_FAILURES: &str = "telemetry_decoder_failures_total";

/// Histogram of decode time in seconds, directory lookups included
pub const DECODER_DURATION_SECONDS: &str = "telemetry_decoder_duration_seconds";
