mod driver;

pub use driver::{AthenaConfig, AthenaDriver, BACKEND_KIND, factory};
