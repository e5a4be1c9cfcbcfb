pub mod client;
pub mod transport;
pub mod types;

pub use client::{header_pair, ApiClient};
pub use transport::{Transport, TransportError};
pub use types::{error_message, ApiResponse, FetchResponse, Method, Operation};
