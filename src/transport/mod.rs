pub mod connection;
pub mod value;

pub use connection::{Connection, Error, DEFAULT_READ_TIMEOUT};
pub use value::Value;
