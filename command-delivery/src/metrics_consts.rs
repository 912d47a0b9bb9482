/// Counter of commands handed to every resolved destination
pub const COMMANDS_DELIVERED: &str = "command_delivery_commands_delivered_total";

/// Counter of commands sent to the undelivered sink, labelled by `reason`
pub const COMMANDS_UNDELIVERED: &str = "command_delivery_commands_undelivered_total";

/// Counter of encode failures, labelled by `command`
pub const COMMAND_ENCODE_FAILURES: &str = "command_delivery_encode_failures_total";

/// Counter of failed deliveries, labelled by `destination`
pub const COMMAND_DELIVERY_ERRORS: &str = "command_delivery_delivery_errors_total";

/// Counter of mapped destinations with no registered transport
pub const COMMAND_UNKNOWN_DESTINATIONS: &str = "command_delivery_unknown_destinations_total";

/// Counter of system commands handed to every resolved destination, labelled by `command`
pub const SYSTEM_COMMANDS_DELIVERED: &str = "command_delivery_system_commands_delivered_total";
