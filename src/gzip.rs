//! Payload compression stage
//!
//! Compresses telemessage payloads with gzip before they reach the
//! transmitter. Compression is only applied when it actually pays off on the
//! wire: the compressed payload plus the cost of the extra
//! `Content-Encoding: gzip` header must be smaller than the original
//! payload, otherwise the message is forwarded unchanged.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use tracing::warn;

use crate::config::GzipConfig;
use crate::error::Result;
use crate::telemessage::Telemessage;
use crate::writer::TelemessageWriter;

/// Approximate on-wire cost of the `Content-Encoding: gzip` header
const HEADER_OVERHEAD: usize = 23;

/// Compresses payloads when net-beneficial and passes them downstream
pub struct GzipTelemessageWriter<W> {
    output: W,
    level: Compression,
}

impl<W: TelemessageWriter> GzipTelemessageWriter<W> {
    pub fn new(output: W, config: GzipConfig) -> Self {
        Self {
            output,
            level: Compression::new(config.compress_level.min(9)),
        }
    }

    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(data)?;
        encoder.finish()
    }
}

#[async_trait]
impl<W: TelemessageWriter> TelemessageWriter for GzipTelemessageWriter<W> {
    async fn write_telemessage(&self, message: Telemessage) -> Result<()> {
        let compressed = match self.compress(&message.data) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!(error = %e, "Compression failed, forwarding uncompressed payload");
                return self.output.write_telemessage(message).await;
            }
        };
        if compressed.len() + HEADER_OVERHEAD < message.data.len() {
            let message = Telemessage {
                parameters: message.parameters,
                data: Bytes::from(compressed),
                headers: message.headers,
            }
            .with_header("Content-Encoding", "gzip");
            self.output.write_telemessage(message).await
        } else {
            self.output.write_telemessage(message).await
        }
    }

    async fn flush(&self) -> Result<()> {
        self.output.flush().await
    }
}
