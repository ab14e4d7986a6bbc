mod driver;

pub use driver::{BACKEND_KIND, BigQueryConfig, BigQueryDriver, factory};
