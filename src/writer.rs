//! Writer traits for the pipeline stages
//!
//! The pipeline is a chain of writers, each holding a reference to the next
//! stage. Point writers accept batches of points and may transform, drop or
//! buffer them; telemessage writers accept prepared payloads and carry them
//! toward the wire. `flush` drains any internally held state and then
//! flushes the downstream stage.

use async_trait::async_trait;

use crate::error::Result;
use crate::point::Point;
use crate::telemessage::Telemessage;

/// A pipeline stage that accepts batches of points
#[async_trait]
pub trait PointWriter: Send + Sync {
    /// Write a batch of points. Implementations must forward at most one
    /// downstream call per incoming batch and never an empty batch.
    async fn write_points(&self, points: Vec<Point>) -> Result<()>;

    /// Drain internal state and flush downstream
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// A pipeline stage that accepts prepared telemetry messages
#[async_trait]
pub trait TelemessageWriter: Send + Sync {
    /// Write a single telemetry message
    async fn write_telemessage(&self, message: Telemessage) -> Result<()>;

    /// Drain internal state, i.e. make sure that any internally stored or
    /// buffered messages are transmitted
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
