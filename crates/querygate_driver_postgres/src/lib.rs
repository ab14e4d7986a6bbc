mod driver;

pub use driver::{BACKEND_KIND, PostgresConfig, PostgresDriver, SslMode, factory};
