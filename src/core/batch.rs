use std::io::{Read, Write};
use std::time::Duration;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::envelope::{Envelope, WireFrame};
use super::frame::WsFrame;
use super::timer::ScheduledTask;
use super::types::{LinkError, LinkResult, NetworkQuality};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Effective batching and compression parameters for the current network quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTuning {
    pub max_batch_size: usize,
    pub max_batch_delay: Duration,
    pub compression_threshold: usize,
    pub compression_level: u32,
}

impl BatchTuning {
    /// Poorer links get smaller batches and earlier, stronger compression.
    pub fn for_quality(
        max_batch_size: usize,
        max_batch_delay: Duration,
        compression_threshold: usize,
        quality: Option<NetworkQuality>,
    ) -> Self {
        let (size_div, threshold_div, level) = match quality {
            None | Some(NetworkQuality::Excellent) => (1, 1, 1),
            Some(NetworkQuality::Good) => (1, 1, 3),
            Some(NetworkQuality::Fair) => (2, 2, 6),
            Some(NetworkQuality::Poor) => (4, 4, 9),
        };
        Self {
            max_batch_size: (max_batch_size / size_div).max(1),
            max_batch_delay,
            compression_threshold: compression_threshold / threshold_div,
            compression_level: level,
        }
    }
}

/// What the caller must do after buffering an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPush {
    /// First envelope in an empty buffer: arm the flush timer.
    StartTimer,
    /// Size limit reached: flush now.
    Flush,
    Buffered,
}

/// Ordered envelopes awaiting a size- or time-triggered flush.
#[derive(Debug, Default)]
pub struct BatchBuffer {
    items: Vec<Envelope>,
    timer: Option<ScheduledTask>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope, max_batch_size: usize) -> BatchPush {
        let was_empty = self.items.is_empty();
        self.items.push(envelope);
        if self.items.len() >= max_batch_size.max(1) {
            BatchPush::Flush
        } else if was_empty {
            BatchPush::StartTimer
        } else {
            BatchPush::Buffered
        }
    }

    pub fn set_timer(&mut self, task: ScheduledTask) {
        self.timer = Some(task);
    }

    /// Take the buffered envelopes and cancel the flush timer.
    pub fn take(&mut self) -> Vec<Envelope> {
        self.timer = None;
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.timer = None;
        self.items.clear();
    }
}

/// Serialize a flushed batch: a single envelope goes out plain, more are wrapped.
pub fn encode_batch(envelopes: &[Envelope]) -> LinkResult<String> {
    match envelopes {
        [] => Err(LinkError::InvalidState("empty batch".to_string())),
        [single] => encode_wire(&single.to_wire()),
        many => encode_wire(&WireFrame::batch(
            many.iter().map(Envelope::to_wire).collect(),
        )),
    }
}

pub fn encode_wire(frame: &WireFrame) -> LinkResult<String> {
    sonic_rs::to_string(frame).map_err(|e| LinkError::Validation(e.to_string()))
}

pub fn gzip(data: &[u8], level: u32) -> LinkResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|e| LinkError::Validation(format!("compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| LinkError::Validation(format!("compression failed: {e}")))
}

/// Build the outbound frame, gzip-compressing to binary above `threshold` when it pays off.
pub fn compress_frame(text: String, threshold: usize, level: u32) -> WsFrame {
    if text.len() <= threshold {
        return WsFrame::text(text);
    }
    match gzip(text.as_bytes(), level) {
        Ok(compressed) if compressed.len() < text.len() => WsFrame::Binary(Bytes::from(compressed)),
        Ok(_) => WsFrame::text(text),
        Err(err) => {
            tracing::debug!(error = %err, "compression failed; sending raw frame");
            WsFrame::text(text)
        }
    }
}

/// Inflate a gzip payload; anything without the gzip magic is returned as-is.
pub fn decompress_frame(data: &[u8]) -> LinkResult<Vec<u8>> {
    if !data.starts_with(&GZIP_MAGIC) {
        return Ok(data.to_vec());
    }
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| LinkError::Validation(format!("decompression failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::{BATCH, OutboundMessage};
    use sonic_rs::{JsonValueTrait, Value};

    fn envelope(i: usize) -> Envelope {
        Envelope::from_message(
            OutboundMessage::new("status", Value::default()).with_id(format!("m-{i}").as_str()),
            3,
        )
    }

    #[test]
    fn twelve_pushes_flush_ten_then_hold_two() {
        let mut buffer = BatchBuffer::new();
        let mut flushed = Vec::new();
        for i in 0..12 {
            let action = buffer.push(envelope(i), 10);
            if i == 0 || i == 10 {
                assert_eq!(action, BatchPush::StartTimer);
            }
            if action == BatchPush::Flush {
                flushed.push(buffer.take());
            }
        }
        flushed.push(buffer.take());

        let sizes: Vec<_> = flushed.iter().map(Vec::len).collect();
        assert_eq!(sizes, [10, 2]);
        assert_eq!(flushed[1][0].message_id.as_str(), "m-10");
    }

    #[test]
    fn single_envelope_is_sent_plain() {
        let text = encode_batch(&[envelope(1)]).unwrap();
        let value: Value = sonic_rs::from_str(&text).unwrap();
        assert_eq!(value.get("type").and_then(|v| v.as_str()), Some("status"));
        assert_eq!(value.get("messageId").and_then(|v| v.as_str()), Some("m-1"));
    }

    #[test]
    fn multiple_envelopes_are_wrapped() {
        let text = encode_batch(&[envelope(1), envelope(2)]).unwrap();
        let frame: WireFrame = sonic_rs::from_str(&text).unwrap();
        assert_eq!(frame.kind, BATCH);
        let ids: Vec<_> = frame
            .messages
            .unwrap()
            .into_iter()
            .map(|m| m.message_id.unwrap().to_string())
            .collect();
        assert_eq!(ids, ["m-1", "m-2"]);
        assert!(encode_batch(&[]).is_err());
    }

    #[test]
    fn large_frames_compress_and_round_trip() {
        let text = format!("{{\"type\":\"log\",\"payload\":\"{}\"}}", "a".repeat(4096));
        let frame = compress_frame(text.clone(), 1024, 6);
        let WsFrame::Binary(bytes) = frame else {
            panic!("expected binary frame");
        };
        assert!(bytes.len() < text.len());
        assert_eq!(decompress_frame(&bytes).unwrap(), text.as_bytes());
    }

    #[test]
    fn small_or_incompressible_frames_stay_text() {
        assert!(matches!(
            compress_frame("{}".to_string(), 1024, 6),
            WsFrame::Text(_)
        ));
        // Already-random data does not shrink under gzip.
        let noise: String = (0..64).map(|i| char::from(b'!' + ((i * 37) % 90) as u8)).collect();
        assert!(matches!(compress_frame(noise, 0, 9), WsFrame::Text(_)));
        assert_eq!(decompress_frame(b"{\"a\":1}").unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn tuning_tightens_as_quality_drops() {
        let base = Duration::from_millis(100);
        let excellent = BatchTuning::for_quality(10, base, 1024, Some(NetworkQuality::Excellent));
        let poor = BatchTuning::for_quality(10, base, 1024, Some(NetworkQuality::Poor));
        assert_eq!(excellent.max_batch_size, 10);
        assert_eq!(poor.max_batch_size, 2);
        assert!(poor.compression_threshold < excellent.compression_threshold);
        assert!(poor.compression_level > excellent.compression_level);
        assert_eq!(
            BatchTuning::for_quality(1, base, 1024, Some(NetworkQuality::Poor)).max_batch_size,
            1
        );
    }
}
