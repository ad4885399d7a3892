//! Output file storage and the HTTP transport used by the actor client.

mod output;
mod transport;

pub use output::{sha256_hex, OutputStore, StoredOutput};
pub use transport::{
    is_transient_error, is_transient_status, ApiRequest, ApiResponse, FetchError,
    HttpClientConfig, HttpFetcher, RetrySchedule,
};

pub const CRATE_NAME: &str = "leadflow-storage";
