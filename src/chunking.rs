//! Payload fragmentation with paced, strictly sequential delivery.
//!
//! Printers reassemble fragments by arrival order, so fragments are written
//! one at a time and each write must complete before the next starts.

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::{BleConfig, ClassicConfig};
use crate::error::{Error, Result};

/// ATT header bytes subtracted from the MTU to get the write payload size.
pub const ATT_WRITE_OVERHEAD: usize = 3;

/// Fragment size limit and pacing for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingPolicy {
    max_fragment_bytes: usize,
    inter_fragment_delay: Duration,
}

impl ChunkingPolicy {
    /// Create a policy. The fragment size must be positive.
    pub fn new(max_fragment_bytes: usize, inter_fragment_delay: Duration) -> Result<Self> {
        if max_fragment_bytes == 0 {
            return Err(Error::InvalidParameter {
                name: "max_fragment_bytes".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(Self {
            max_fragment_bytes,
            inter_fragment_delay,
        })
    }

    /// Policy for a Classic socket.
    pub fn classic(config: &ClassicConfig) -> Result<Self> {
        Self::new(config.buffer_size, config.fragment_delay)
    }

    /// Policy for a BLE link with the given MTU.
    pub fn for_ble_mtu(mtu: u16, config: &BleConfig) -> Result<Self> {
        let max = usize::from(mtu).saturating_sub(ATT_WRITE_OVERHEAD);
        Self::new(max, config.fragment_delay)
    }

    /// Largest fragment in bytes.
    pub fn max_fragment_bytes(&self) -> usize {
        self.max_fragment_bytes
    }

    /// Pause between consecutive fragments.
    pub fn inter_fragment_delay(&self) -> Duration {
        self.inter_fragment_delay
    }

    /// Check if a payload of `len` bytes must be split.
    pub fn needs_chunking(&self, len: usize) -> bool {
        len > self.max_fragment_bytes
    }

    /// Number of fragments a payload of `len` bytes produces.
    pub fn fragment_count(&self, len: usize) -> usize {
        len.div_ceil(self.max_fragment_bytes)
    }

    /// Lazily split `payload` into in-order fragments.
    pub fn fragments<'a>(&self, payload: &'a [u8]) -> Fragments<'a> {
        Fragments {
            payload,
            size: self.max_fragment_bytes,
            offset: 0,
            index: 0,
        }
    }
}

/// One slice of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    /// Position in the fragment sequence.
    pub index: usize,
    /// Offset of the first byte within the payload.
    pub offset: usize,
    /// The bytes.
    pub bytes: &'a [u8],
}

impl Fragment<'_> {
    /// Byte range within the payload.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.bytes.len()
    }
}

/// Iterator over the fragments of a payload.
#[derive(Debug, Clone)]
pub struct Fragments<'a> {
    payload: &'a [u8],
    size: usize,
    offset: usize,
    index: usize,
}

impl<'a> Iterator for Fragments<'a> {
    type Item = Fragment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let start = self.offset;
        let end = (start + self.size).min(self.payload.len());
        let fragment = Fragment {
            index: self.index,
            offset: start,
            bytes: &self.payload[start..end],
        };
        self.offset = end;
        self.index += 1;
        Some(fragment)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.payload.len() - self.offset).div_ceil(self.size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Fragments<'_> {}

/// Something that accepts one fragment at a time.
///
/// `write_fragment` returns once the fragment is acknowledged (BLE) or
/// flushed (Classic).
#[async_trait]
pub trait FragmentSink: Send {
    /// Write one fragment.
    async fn write_fragment(&mut self, fragment: &[u8]) -> Result<()>;
}

/// Write `payload` through `sink` fragment by fragment.
///
/// Stops at the first failure; the remaining fragments are not sent.
/// Cancellation interrupts both the pacing delay and a pending fragment. Returns the number of
/// fragments written.
pub async fn write_fragments<S>(
    policy: &ChunkingPolicy,
    payload: &[u8],
    cancel: &CancellationToken,
    sink: &mut S,
) -> Result<usize>
where
    S: FragmentSink + ?Sized,
{
    let total = policy.fragment_count(payload.len());
    let mut written = 0;

    for fragment in policy.fragments(payload) {
        if cancel.is_cancelled() {
            return Err(Error::NotConnected);
        }

        if fragment.index > 0 && !policy.inter_fragment_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::NotConnected),
                _ = tokio::time::sleep(policy.inter_fragment_delay) => {}
            }
        }

        trace!(
            "Writing fragment {}/{} ({} bytes)",
            fragment.index + 1,
            total,
            fragment.bytes.len()
        );

        // A stalled write must not outlive the session.
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::NotConnected),
            result = sink.write_fragment(fragment.bytes) => {
                result.map_err(|e| Error::WriteFailed {
                    reason: format!("fragment {} of {}: {}", fragment.index + 1, total, e),
                })?;
            }
        }
        written += 1;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingSink {
        fragments: Vec<Vec<u8>>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl FragmentSink for RecordingSink {
        async fn write_fragment(&mut self, fragment: &[u8]) -> Result<()> {
            if self.fail_at == Some(self.fragments.len()) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe closed",
                )));
            }
            self.fragments.push(fragment.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_2600_bytes_by_1024() {
        let policy = ChunkingPolicy::new(1024, Duration::ZERO).unwrap();
        let payload: Vec<u8> = (0..2600u32).map(|i| i as u8).collect();

        let fragments: Vec<_> = policy.fragments(&payload).collect();
        let sizes: Vec<_> = fragments.iter().map(|f| f.bytes.len()).collect();
        let ranges: Vec<_> = fragments.iter().map(|f| f.range()).collect();

        assert_eq!(sizes, vec![1024, 1024, 552]);
        assert_eq!(ranges, vec![0..1024, 1024..2048, 2048..2600]);
        assert_eq!(policy.fragments(&payload).len(), 3);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(ChunkingPolicy::new(0, Duration::ZERO).is_err());
        assert!(ChunkingPolicy::for_ble_mtu(3, &BleConfig::default()).is_err());
    }

    #[test]
    fn test_ble_policy_from_mtu() {
        let policy = ChunkingPolicy::for_ble_mtu(23, &BleConfig::default()).unwrap();
        assert_eq!(policy.max_fragment_bytes(), 20);
        assert!(!policy.needs_chunking(20));
        assert!(policy.needs_chunking(21));
    }

    #[test]
    fn test_empty_payload_has_no_fragments() {
        let policy = ChunkingPolicy::new(16, Duration::ZERO).unwrap();
        assert_eq!(policy.fragments(&[]).count(), 0);
        assert_eq!(policy.fragment_count(0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_fragments_paces() {
        let policy = ChunkingPolicy::new(4, Duration::from_millis(10)).unwrap();
        let mut sink = RecordingSink::default();
        let start = tokio::time::Instant::now();

        let written = write_fragments(&policy, b"abcdefghij", &CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        assert_eq!(written, 3);
        assert_eq!(
            sink.fragments,
            vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]
        );
        assert_eq!(start.elapsed(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_write_fragments_aborts_on_error() {
        let policy = ChunkingPolicy::new(2, Duration::ZERO).unwrap();
        let mut sink = RecordingSink {
            fail_at: Some(1),
            ..Default::default()
        };

        let result = write_fragments(&policy, b"aabbcc", &CancellationToken::new(), &mut sink).await;

        assert!(matches!(result, Err(Error::WriteFailed { .. })));
        assert_eq!(sink.fragments, vec![b"aa".to_vec()]);
    }

    #[tokio::test]
    async fn test_write_fragments_honours_cancellation() {
        let policy = ChunkingPolicy::new(2, Duration::ZERO).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = RecordingSink::default();

        let result = write_fragments(&policy, b"aabb", &cancel, &mut sink).await;

        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(sink.fragments.is_empty());
    }

    struct StalledSink;

    #[async_trait]
    impl FragmentSink for StalledSink {
        async fn write_fragment(&mut self, _fragment: &[u8]) -> Result<()> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_stalled_fragment() {
        let policy = ChunkingPolicy::new(2, Duration::ZERO).unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = write_fragments(&policy, b"aabb", &cancel, &mut StalledSink).await;

        assert!(matches!(result, Err(Error::NotConnected)));
    }

    proptest! {
        #[test]
        fn prop_fragments_cover_payload(len in 0usize..5000, size in 1usize..1500) {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let policy = ChunkingPolicy::new(size, Duration::ZERO).unwrap();

            let mut expected_start = 0;
            let mut joined = Vec::with_capacity(len);
            for fragment in policy.fragments(&payload) {
                prop_assert_eq!(fragment.offset, expected_start);
                prop_assert!(!fragment.bytes.is_empty());
                prop_assert!(fragment.bytes.len() <= size);
                expected_start = fragment.range().end;
                joined.extend_from_slice(fragment.bytes);
            }
            prop_assert_eq!(expected_start, len);
            prop_assert_eq!(&joined, &payload);
            prop_assert_eq!(policy.fragments(&payload).count(), policy.fragment_count(len));
        }
    }
}
