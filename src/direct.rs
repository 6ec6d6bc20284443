//! Direct point-to-telemessage conversion
//!
//! The unbuffered alternative to [`crate::buffer::BufferedPointWriter`]:
//! every call groups the incoming points by namespace and emits size-bounded
//! telemessages immediately. Nothing is coalesced across calls and no
//! background task is involved.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::warn;

use crate::config::DirectWriterConfig;
use crate::error::Result;
use crate::lineproto::encode_point;
use crate::namespace::Namespace;
use crate::point::Point;
use crate::telemessage::Telemessage;
use crate::writer::{PointWriter, TelemessageWriter};

/// Groups points by namespace and writes size-bounded telemessages downstream
pub struct DirectPointWriter<W> {
    output: W,
    config: DirectWriterConfig,
}

impl<W: TelemessageWriter> DirectPointWriter<W> {
    pub fn new(output: W, config: DirectWriterConfig) -> Self {
        Self { output, config }
    }
}

#[async_trait]
impl<W: TelemessageWriter> PointWriter for DirectPointWriter<W> {
    async fn write_points(&self, points: Vec<Point>) -> Result<()> {
        let mut groups: HashMap<Namespace, Vec<Point>> = HashMap::new();
        for point in points {
            groups.entry(point.namespace().clone()).or_default().push(point);
        }

        for (namespace, group) in groups {
            let params = namespace.params();
            let mut batch: Vec<String> = Vec::new();
            let mut batch_len = 0usize;
            for point in &group {
                let line = encode_point(point);
                // +1 accounts for the newline once the lines are joined
                if !batch.is_empty() && batch_len + 1 + line.len() > self.config.max_batch_bytes {
                    let message = Telemessage::from_lines(params.clone(), batch.drain(..));
                    if let Err(e) = self.output.write_telemessage(message).await {
                        warn!(error = %e, "Failed to write telemessage from direct point writer");
                    }
                    batch_len = 0;
                }
                if !batch.is_empty() {
                    batch_len += 1;
                }
                batch_len += line.len();
                batch.push(line);
            }
            if !batch.is_empty() {
                let message = Telemessage::from_lines(params, batch);
                if let Err(e) = self.output.write_telemessage(message).await {
                    warn!(error = %e, "Failed to write telemessage from direct point writer");
                }
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.output.flush().await
    }
}
