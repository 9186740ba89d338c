//! Chunk delivery: one [`Uploader`] per capture pipeline, wrapping a
//! [`ChunkTransport`](tapedeck_protocol::ChunkTransport) with the bounded
//! retry policy and publishing every terminal outcome on a [`DeliveryHub`].

mod http;
mod retry;
mod uploader;

pub use http::{HttpTransport, PROJECT_KEY_HEADER};
pub use retry::RetryPolicy;
pub use uploader::{
    Delivery, DeliveryHub, DeliveryOutcome, UploadStats, UploadStatsSnapshot, Uploader,
};
