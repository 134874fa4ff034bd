pub mod error;
mod http;

pub use error::ClientError;
pub use http::{DEFAULT_SERVER, SupervisorClient};
