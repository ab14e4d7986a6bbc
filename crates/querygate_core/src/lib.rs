mod driver;
mod error;
mod metadata;
mod registry;
mod resolver;
mod task;
mod template;
mod value;

pub use driver::{Driver, RowStream, StreamFrame};
pub use error::GatewayError;
pub use metadata::{ConnectorConfig, MetadataStore, QueryDefinition};
pub use registry::{DriverFactory, DriverRegistry, DriverRegistryBuilder};
pub use resolver::{QueryResolver, ResolvedQuery};
pub use task::{QueryRequest, QueryTask, TaskStatus};
pub use template::render_template;
pub use value::{Row, Value};

pub use chrono;
