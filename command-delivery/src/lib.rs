pub mod destination;
pub mod encoder;
pub mod metrics_consts;
pub mod processor;
pub mod routing;
pub mod schema;
pub mod system;

pub use destination::{CommandDestination, UndeliveredCommandSink};
pub use encoder::DynamicProtocolEncoder;
pub use processor::{CommandProcessor, DeliveryOutcome};
pub use routing::{DeviceTypeMappingRouter, MappingTable, RouteTarget};
pub use schema::DynamicSchema;
pub use system::SystemCommand;
