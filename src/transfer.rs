//! Chunked image transfer.
//!
//! An image plane is split into `chunk_size` slices and each slice is sent
//! as one `WRITE_IMG` frame:
//!
//! ```text
//! ┌──────┬─────────────────────────┬──────────────────────┐
//! │ 0x30 │ plane nibble | cont.    │ up to chunk_size     │
//! │      │ 0x0F/0x00 | 0x00/0xF0   │ image bytes          │
//! └──────┴─────────────────────────┴──────────────────────┘
//! ```
//!
//! The first chunk of a plane has continuation bits `0x0`, all later
//! chunks `0xF`, so the peripheral knows when a new plane begins. Delivery
//! modes follow the [`InterleavePolicy`]. The first failed write aborts the
//! plane; there is no resume, the caller resends the whole image.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use epd_link::transfer::{Plane, TransferJob};
//!
//! let job = TransferJob::new(Bytes::from(vec![0u8; 1000]), Plane::BlackWhite, 20, 3).unwrap();
//! assert_eq!(job.chunk_size(), 18);
//! assert_eq!(job.chunk_count(), 56);
//! assert_eq!(job.confirmed_writes(), 14);
//!
//! let tags: Vec<u8> = job.chunks().take(2).map(|c| c.tag).collect();
//! assert_eq!(tags, vec![0x0F, 0xFF]);
//! ```

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::connection::CommandChannel;
use crate::error::{EpdError, Result};
use crate::interleave::{InterleavePolicy, WriteMode};
use crate::protocol::{build_image_chunk, tag, ColorMode, CHUNK_OVERHEAD};

/// One color channel of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    /// Black/white plane.
    BlackWhite,
    /// Red plane of a three-color image.
    Red,
    /// Packed four-color plane.
    Color,
}

impl Plane {
    /// Low nibble of the chunk tag.
    #[inline]
    pub fn nibble(self) -> u8 {
        match self {
            Plane::BlackWhite => tag::PLANE_BW,
            Plane::Red | Plane::Color => tag::PLANE_COLOR,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Plane::BlackWhite => "bw",
            Plane::Red => "red",
            Plane::Color => "color",
        }
    }
}

/// One plane's worth of work for the engine.
#[derive(Debug, Clone)]
pub struct TransferJob {
    payload: Bytes,
    plane: Plane,
    mtu: usize,
    chunk_size: usize,
    interleave_budget: usize,
}

impl TransferJob {
    /// Create a job for a link with message ceiling `mtu`. Chunks carry
    /// `mtu - 2` image bytes each.
    ///
    /// # Errors
    ///
    /// `InvalidTransfer` if `mtu` leaves no room for image bytes.
    pub fn new(
        payload: Bytes,
        plane: Plane,
        mtu: usize,
        interleave_budget: usize,
    ) -> Result<Self> {
        if mtu <= CHUNK_OVERHEAD {
            return Err(EpdError::InvalidTransfer(format!(
                "MTU {} leaves no room for image data",
                mtu
            )));
        }
        Ok(Self {
            payload,
            plane,
            mtu,
            chunk_size: mtu - CHUNK_OVERHEAD,
            interleave_budget,
        })
    }

    /// Use smaller chunks than the MTU allows.
    ///
    /// # Errors
    ///
    /// `InvalidTransfer` if `chunk_size` is zero or a chunk frame would
    /// exceed the MTU.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        let max = self.mtu - CHUNK_OVERHEAD;
        if chunk_size == 0 || chunk_size > max {
            return Err(EpdError::InvalidTransfer(format!(
                "chunk size {} outside 1..={} for MTU {}",
                chunk_size, max, self.mtu
            )));
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    #[inline]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    #[inline]
    pub fn plane(&self) -> Plane {
        self.plane
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn interleave_budget(&self) -> usize {
        self.interleave_budget
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Number of chunks: ⌈len / chunk_size⌉.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.payload.len().div_ceil(self.chunk_size)
    }

    /// Confirmed writes the interleave policy will issue for this job.
    pub fn confirmed_writes(&self) -> usize {
        InterleavePolicy::confirmed_count(self.chunk_count(), self.interleave_budget)
    }

    /// Iterate the tagged chunks (zero-copy slices of the payload).
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            job: self,
            offset: 0,
            index: 0,
        }
    }
}

/// A tagged slice of a plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChunk {
    pub index: usize,
    pub tag: u8,
    pub data: Bytes,
}

impl ImageChunk {
    /// The complete `WRITE_IMG` frame.
    pub fn frame(&self) -> Bytes {
        build_image_chunk(self.tag, &self.data)
    }
}

/// Iterator over the chunks of a [`TransferJob`].
pub struct Chunks<'a> {
    job: &'a TransferJob,
    offset: usize,
    index: usize,
}

impl Iterator for Chunks<'_> {
    type Item = ImageChunk;

    fn next(&mut self) -> Option<ImageChunk> {
        let len = self.job.payload.len();
        if self.offset >= len {
            return None;
        }
        let end = (self.offset + self.job.chunk_size).min(len);
        let chunk = ImageChunk {
            index: self.index,
            tag: tag::for_chunk(self.job.plane.nibble(), self.index),
            data: self.job.payload.slice(self.offset..end),
        };
        self.offset = end;
        self.index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.job.chunk_count() - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Progress after one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub plane: Plane,
    /// 1-based index of the chunk just written.
    pub chunk: usize,
    pub total: usize,
    /// Time since the plane started.
    pub elapsed: Duration,
}

/// Outcome of one completed plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub plane: Plane,
    pub chunks: usize,
    pub confirmed_writes: usize,
    pub bytes: usize,
    pub elapsed: Duration,
}

/// Outcome of a full multi-plane image push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReport {
    pub planes: Vec<TransferReport>,
    pub elapsed: Duration,
}

/// The planes of one encoded image, in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePlanes {
    planes: Vec<(Plane, Bytes)>,
}

impl ImagePlanes {
    /// Split an encoded image by color mode.
    ///
    /// Three-color images carry the bw plane in the first half and the red
    /// plane in the second (the split is at ⌊len/2⌋).
    pub fn split(mode: ColorMode, data: Bytes) -> Self {
        let planes = match mode {
            ColorMode::BlackWhite => vec![(Plane::BlackWhite, data)],
            ColorMode::FourColor => vec![(Plane::Color, data)],
            ColorMode::ThreeColor => {
                let half = data.len() / 2;
                vec![
                    (Plane::BlackWhite, data.slice(..half)),
                    (Plane::Red, data.slice(half..)),
                ]
            }
        };
        Self { planes }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Plane, Bytes)> {
        self.planes.iter()
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }
}

impl IntoIterator for ImagePlanes {
    type Item = (Plane, Bytes);
    type IntoIter = std::vec::IntoIter<(Plane, Bytes)>;

    fn into_iter(self) -> Self::IntoIter {
        self.planes.into_iter()
    }
}

/// Send one plane over `channel`.
///
/// Liveness is checked before every chunk; a dead link or failed write
/// stops the loop immediately and no later chunk is sent. `on_progress` is
/// called after each chunk and must not block.
pub async fn transmit<F>(
    channel: &CommandChannel,
    job: &TransferJob,
    mut on_progress: F,
) -> Result<TransferReport>
where
    F: FnMut(TransferProgress),
{
    let start = Instant::now();
    let total = job.chunk_count();
    let mut policy = InterleavePolicy::new(job.interleave_budget);
    let mut confirmed_writes = 0;

    tracing::info!(
        "Sending {} plane: {} bytes in {} chunks of {} (interleave {}, {} confirmed)",
        job.plane.name(),
        job.payload.len(),
        total,
        job.chunk_size,
        job.interleave_budget,
        job.confirmed_writes()
    );

    for chunk in job.chunks() {
        if !channel.is_alive() {
            tracing::warn!(
                "Link dropped before {} chunk {}/{}",
                job.plane.name(),
                chunk.index + 1,
                total
            );
            return Err(EpdError::Disconnected);
        }

        let mode = policy.next_mode();
        if let Err(e) = channel.write(&chunk.frame(), mode).await {
            tracing::error!(
                "{} chunk {}/{} failed: {}",
                job.plane.name(),
                chunk.index + 1,
                total,
                e
            );
            return Err(e);
        }
        if mode == WriteMode::Confirmed {
            confirmed_writes += 1;
        }

        on_progress(TransferProgress {
            plane: job.plane,
            chunk: chunk.index + 1,
            total,
            elapsed: start.elapsed(),
        });
    }

    let report = TransferReport {
        plane: job.plane,
        chunks: total,
        confirmed_writes,
        bytes: job.payload.len(),
        elapsed: start.elapsed(),
    };
    tracing::info!(
        "{} plane done in {:?} ({} confirmed writes)",
        job.plane.name(),
        report.elapsed,
        report.confirmed_writes
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use crate::config::{DEFAULT_COMMAND_UUID, DEFAULT_SERVICE_UUID};
    use crate::transport::{
        CharacteristicHandle, MemoryTransport, PeripheralScript, Transport,
    };

    async fn connected(script: PeripheralScript) -> (MemoryTransport, CommandChannel) {
        let transport = MemoryTransport::with_script(script);
        let device = transport.request_device(DEFAULT_SERVICE_UUID).await.unwrap();
        transport.connect(&device).await.unwrap();
        let channel = CommandChannel::new(
            Arc::new(transport.clone()),
            CharacteristicHandle {
                service: DEFAULT_SERVICE_UUID,
                uuid: DEFAULT_COMMAND_UUID,
            },
            Arc::new(AtomicBool::new(true)),
        );
        (transport, channel)
    }

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    #[test]
    fn test_unusable_mtu_rejected() {
        for mtu in [0, 1, CHUNK_OVERHEAD] {
            let result = TransferJob::new(pattern(10), Plane::BlackWhite, mtu, 1);
            assert!(matches!(result, Err(EpdError::InvalidTransfer(_))), "mtu {}", mtu);
        }
        let job = TransferJob::new(pattern(10), Plane::BlackWhite, 3, 1).unwrap();
        assert_eq!(job.chunk_size(), 1);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let result = TransferJob::new(pattern(10), Plane::BlackWhite, 20, 1)
            .unwrap()
            .with_chunk_size(0);
        assert!(matches!(result, Err(EpdError::InvalidTransfer(_))));
    }

    #[test]
    fn test_chunk_size_capped_by_mtu() {
        let job = TransferJob::new(pattern(10), Plane::BlackWhite, 20, 1).unwrap();
        assert_eq!(job.chunk_size(), 18);

        let smaller = job.clone().with_chunk_size(18).unwrap();
        assert_eq!(smaller.chunk_size(), 18);

        let oversize = job.with_chunk_size(19);
        assert!(matches!(oversize, Err(EpdError::InvalidTransfer(_))));
    }

    #[test]
    fn test_confirmed_writes_matches_transmit_plan() {
        let job = TransferJob::new(pattern(1000), Plane::BlackWhite, 20, 3).unwrap();
        assert_eq!(job.confirmed_writes(), 14);

        let every = TransferJob::new(pattern(1000), Plane::BlackWhite, 20, 0).unwrap();
        assert_eq!(every.confirmed_writes(), 56);
    }

    #[test]
    fn test_chunk_count_and_reassembly() {
        for len in [0usize, 1, 17, 18, 19, 1000] {
            for size in [1usize, 7, 18, 244] {
                let payload = pattern(len);
                let job = TransferJob::new(payload.clone(), Plane::Red, 246, 0)
                    .and_then(|job| job.with_chunk_size(size))
                    .unwrap();
                let chunks: Vec<_> = job.chunks().collect();

                assert_eq!(chunks.len(), len.div_ceil(size));
                assert_eq!(job.chunks().len(), chunks.len());
                let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.to_vec()).collect();
                assert_eq!(joined, payload.to_vec());
                assert!(chunks.iter().all(|c| c.data.len() <= size));
            }
        }
    }

    #[test]
    fn test_tags_first_then_continuation() {
        let job = TransferJob::new(pattern(100), Plane::Color, 12, 0).unwrap();
        let tags: Vec<u8> = job.chunks().map(|c| c.tag).collect();
        assert_eq!(tags[0], 0x00);
        assert!(tags[1..].iter().all(|&t| t == 0xF0));
    }

    #[test]
    fn test_chunk_frame_layout() {
        let job = TransferJob::new(pattern(5), Plane::BlackWhite, 5, 0).unwrap();
        let frames: Vec<Bytes> = job.chunks().map(|c| c.frame()).collect();
        assert_eq!(&frames[0][..], &[0x30, 0x0F, 0, 1, 2]);
        assert_eq!(&frames[1][..], &[0x30, 0xFF, 3, 4]);
    }

    #[test]
    fn test_split_three_color() {
        let planes = ImagePlanes::split(ColorMode::ThreeColor, pattern(11));
        let planes: Vec<_> = planes.into_iter().collect();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0].0, Plane::BlackWhite);
        assert_eq!(planes[0].1.len(), 5);
        assert_eq!(planes[1].0, Plane::Red);
        assert_eq!(planes[1].1.len(), 6);
    }

    #[test]
    fn test_split_single_plane_modes() {
        let bw = ImagePlanes::split(ColorMode::BlackWhite, pattern(4));
        assert_eq!(bw.len(), 1);
        assert_eq!(bw.iter().next().unwrap().0, Plane::BlackWhite);

        let four = ImagePlanes::split(ColorMode::FourColor, pattern(4));
        assert_eq!(four.iter().next().unwrap().0.nibble(), 0x00);
    }

    #[tokio::test]
    async fn test_transmit_1000_bytes_budget_3() {
        let (transport, channel) = connected(PeripheralScript::default()).await;
        let job = TransferJob::new(pattern(1000), Plane::BlackWhite, 20, 3).unwrap();

        let mut progress = Vec::new();
        let report = transmit(&channel, &job, |p| progress.push(p)).await.unwrap();

        assert_eq!(report.chunks, 56);
        assert_eq!(report.confirmed_writes, 14);
        assert_eq!(report.confirmed_writes, job.confirmed_writes());
        assert_eq!(report.bytes, 1000);

        let writes = transport.image_chunks();
        assert_eq!(writes.len(), 56);
        assert_eq!(writes[0].data[1], 0x0F);
        assert_eq!(writes[1].data[1], 0xFF);
        for (i, write) in writes.iter().enumerate() {
            let expected = if i % 4 == 3 {
                WriteMode::Confirmed
            } else {
                WriteMode::Unconfirmed
            };
            assert_eq!(write.mode, expected, "chunk {}", i);
        }

        assert_eq!(progress.len(), 56);
        assert_eq!(progress.last().unwrap().chunk, 56);
        assert_eq!(progress.last().unwrap().total, 56);
    }

    #[tokio::test]
    async fn test_transmit_aborts_on_first_failure() {
        let (transport, channel) = connected(PeripheralScript {
            fail_image_chunk: Some(29),
            ..PeripheralScript::default()
        })
        .await;
        let job = TransferJob::new(pattern(1000), Plane::BlackWhite, 20, 3).unwrap();

        let result = transmit(&channel, &job, |_| {}).await;
        assert!(matches!(result, Err(EpdError::WriteFailed(_))));
        // chunks 1..=29 went through, chunk 30 failed, 31..=56 never sent
        assert_eq!(transport.image_chunks().len(), 29);
    }

    #[tokio::test]
    async fn test_transmit_stops_on_dead_link() {
        let (transport, channel) = connected(PeripheralScript::default()).await;
        let job = TransferJob::new(pattern(100), Plane::BlackWhite, 12, 0).unwrap();

        let dead = channel.clone();
        let result = transmit(&channel, &job, |p| {
            if p.chunk == 3 {
                dead.mark_dead();
            }
        })
        .await;

        assert!(matches!(result, Err(EpdError::Disconnected)));
        assert_eq!(transport.image_chunks().len(), 3);
    }

    #[tokio::test]
    async fn test_transmit_empty_payload() {
        let (transport, channel) = connected(PeripheralScript::default()).await;
        let job = TransferJob::new(Bytes::new(), Plane::BlackWhite, 20, 3).unwrap();
        let report = transmit(&channel, &job, |_| {}).await.unwrap();
        assert_eq!(report.chunks, 0);
        assert!(transport.writes().is_empty());
    }
}
