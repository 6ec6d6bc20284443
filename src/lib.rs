//! Client-side telemetry ingestion pipeline
//!
//! Applications hand the pipeline validated measurement [`Point`]s; the
//! pipeline deduplicates repeated field values, batches points per
//! destination [`Namespace`], encodes them into the backend's line
//! protocol, optionally compresses the payload, and delivers it to an HTTPS
//! ingress endpoint with authentication, retries, backpressure and
//! crash-survival snapshots.
//!
//! The stages compose as a chain of writers, each holding the next stage:
//!
//! ```ignore
//! let transmitter = BackgroundTelemessageWriter::with_auth(transmit_cfg, driver)?;
//! let gzip = GzipTelemessageWriter::new(transmitter, GzipConfig::default());
//! let buffer = BufferedPointWriter::new(gzip, BufferConfig::default());
//! let pipeline = PointDuplicateFilter::new(buffer, FilterConfig::default());
//!
//! pipeline.write_points(points).await?;
//! ```
//!
//! Delivery is at-least-once with best-effort deduplication and bounded
//! retries; submission order is not preserved across retries.

pub mod auth;
pub mod buffer;
pub mod config;
pub mod direct;
pub mod error;
pub mod filter;
pub mod gzip;
pub mod lineproto;
pub mod namespace;
pub mod point;
mod retry;
mod snapshot;
pub mod telemessage;
pub mod time;
pub mod transmit;
pub mod upload;
pub mod writer;

// Re-exports
pub use auth::{ApiDriver, AuthProvider, StaticAuthProvider};
pub use buffer::BufferedPointWriter;
pub use config::{
    AuthConfig, BufferConfig, DirectWriterConfig, FilterConfig, GzipConfig, RetryPolicy,
    TransmitterConfig,
};
pub use direct::DirectPointWriter;
pub use error::{Error, Result};
pub use filter::PointDuplicateFilter;
pub use gzip::GzipTelemessageWriter;
pub use namespace::Namespace;
pub use point::{FieldSet, FieldValue, Point, TagSet};
pub use telemessage::Telemessage;
pub use time::{Clock, FixedClock, SystemClock};
pub use transmit::BackgroundTelemessageWriter;
pub use upload::DirectTelemessageWriter;
pub use writer::{PointWriter, TelemessageWriter};
