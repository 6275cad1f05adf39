//! Buffered, compressing output stream.

use std::sync::Arc;

use tracing::debug;
use weft_proto::{Compressor, WireEncode};

use super::ObjectSink;
use crate::network::{Connection, Node};

/// One packet's worth of stream data, handed to a [`DataSink`].
#[derive(Debug, Clone, Copy)]
pub struct DataPacket<'a> {
    /// Fragment number; restarts at zero for every enable or resend.
    pub sequence: u32,
    /// Compressor name, zero when `chunks` are raw bytes.
    pub compressor: u32,
    /// Uncompressed size of the payload.
    pub data_size: u64,
    pub chunks: &'a [&'a [u8]],
    pub last: bool,
}

/// Where a [`DataOStream`] puts its packets.
pub trait DataSink {
    /// Encode `packet` and send it on every connection.
    fn send_data(&mut self, connections: &[Connection], packet: DataPacket<'_>);

    /// Whether there is anyone to send to.
    fn is_active(&self, connections: &[Connection]) -> bool {
        !connections.is_empty()
    }
}

/// How much of the buffered data the cached compression result covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionState {
    Uncompressed,
    /// The pending tail is compressed.
    Partial,
    /// The whole buffer is compressed.
    Complete,
    /// Compression would not shrink the data.
    Uncompressible,
}

/// One packet of a resend, with its compressed form if that is smaller.
struct SavedFragment {
    start: usize,
    end: usize,
    compressed: Option<Vec<Vec<u8>>>,
}

/// Serializes values into data packets.
///
/// Writes are buffered. Once more than `buffer_size` bytes are pending, the
/// next write first sends them as a non-final packet. [`disable`] sends the
/// final packet. With saving enabled the whole buffer is kept, so that
/// [`resend`] can replay it to late joiners in packets of at most
/// `buffer_size` bytes.
///
/// [`disable`]: DataOStream::disable
/// [`resend`]: DataOStream::resend
pub struct DataOStream<S: DataSink = ObjectSink> {
    sink: S,
    buffer: Vec<u8>,
    buffer_start: usize,
    buffer_size: usize,
    compressor: Option<&'static dyn Compressor>,
    state: CompressionState,
    compressed: Vec<Vec<u8>>,
    connections: Vec<Connection>,
    saved: Vec<SavedFragment>,
    enabled: bool,
    data_sent: bool,
    save: bool,
    sequence: u32,
}

impl<S: DataSink> DataOStream<S> {
    pub fn new(sink: S, buffer_size: usize, compressor: Option<&'static dyn Compressor>) -> Self {
        Self {
            sink,
            buffer: Vec::new(),
            buffer_start: 0,
            buffer_size,
            compressor,
            state: CompressionState::Uncompressed,
            compressed: Vec::new(),
            connections: Vec::new(),
            saved: Vec::new(),
            enabled: false,
            data_sent: false,
            save: false,
            sequence: 0,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Start a new stream to `connections`.
    ///
    /// # Panics
    ///
    /// Panics if the stream is already enabled.
    pub fn enable(&mut self, connections: Vec<Connection>) {
        assert!(!self.enabled, "data stream enabled twice");
        self.buffer.clear();
        self.buffer_start = 0;
        self.state = CompressionState::Uncompressed;
        self.compressed.clear();
        self.saved.clear();
        self.connections = connections;
        self.data_sent = false;
        self.sequence = 0;
        self.enabled = true;
    }

    /// Keep the whole buffer after sending, for [`resend`](Self::resend).
    pub fn enable_save(&mut self) {
        self.save = true;
    }

    /// # Panics
    ///
    /// Panics if data was already written in the current stream.
    pub fn disable_save(&mut self) {
        assert!(
            !self.enabled || (!self.data_sent && self.buffer.is_empty()),
            "cannot disable saving after data has been written"
        );
        self.save = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether anything was written since the last enable, even if nobody
    /// was listening.
    pub fn has_sent_data(&self) -> bool {
        self.data_sent
    }

    /// Serialized bytes kept by a saving stream.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn compression_state(&self) -> CompressionState {
        self.state
    }

    /// Append one value.
    ///
    /// # Panics
    ///
    /// Panics if the stream is not enabled.
    pub fn write<T: WireEncode + ?Sized>(&mut self, value: &T) {
        self.before_write();
        value.encode(&mut self.buffer);
    }

    /// Append raw bytes without a length prefix.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.before_write();
        self.buffer.extend_from_slice(data);
    }

    fn before_write(&mut self) {
        assert!(self.enabled, "write to a disabled data stream");
        if self.buffer.len() - self.buffer_start > self.buffer_size {
            self.flush();
        }
    }

    /// Send the pending bytes as a non-final packet.
    pub fn flush(&mut self) {
        assert!(self.enabled, "flush of a disabled data stream");
        let (start, end) = (self.buffer_start, self.buffer.len());
        if self.sink.is_active(&self.connections) {
            self.state = CompressionState::Uncompressed;
            self.compress(start, end, CompressionState::Partial);
            self.send(start, end, false);
        }
        self.data_sent = true;
        self.reset_buffer();
    }

    /// Send the final packet and end the stream.
    ///
    /// A stream that never received data sends nothing.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        let len = self.buffer.len();
        if self.data_sent {
            if self.sink.is_active(&self.connections) {
                let start = self.buffer_start;
                self.state = CompressionState::Uncompressed;
                self.compress(start, len, CompressionState::Partial);
                // Always sent, so receivers see the end of the stream.
                self.send(start, len, true);
            }
        } else if len > 0 {
            self.data_sent = true;
            if self.sink.is_active(&self.connections) {
                self.state = CompressionState::Uncompressed;
                self.compress(0, len, CompressionState::Complete);
                self.send(0, len, true);
            }
        }

        self.enabled = false;
        self.connections.clear();
        if !self.save {
            self.buffer.clear();
            self.buffer_start = 0;
        }
    }

    /// Replay the saved buffer to `connections`.
    ///
    /// The buffer goes out in packets of at most `buffer_size` bytes, the
    /// last one final. Each packet is compressed on the first resend after
    /// [`disable`](Self::disable), independent of how the streamed tail
    /// compressed, and reused by later resends.
    ///
    /// # Panics
    ///
    /// Panics if the stream is enabled or not saving.
    pub fn resend(&mut self, connections: Vec<Connection>) {
        assert!(!self.enabled, "resend of an enabled data stream");
        assert!(self.save, "resend needs a saving data stream");
        if !self.sink.is_active(&connections) {
            return;
        }
        if self.saved.is_empty() {
            self.split_saved();
        }

        let compressor = self.compressor.map_or(0, |c| c.name() as u32);
        let count = self.saved.len();
        for (sequence, fragment) in self.saved.iter().enumerate() {
            let (compressor, chunks): (u32, Vec<&[u8]>) = match &fragment.compressed {
                Some(chunks) => (compressor, chunks.iter().map(Vec::as_slice).collect()),
                None if fragment.start == fragment.end => (0, Vec::new()),
                None => (0, vec![&self.buffer[fragment.start..fragment.end]]),
            };
            self.sink.send_data(
                &connections,
                DataPacket {
                    sequence: sequence as u32,
                    compressor,
                    data_size: (fragment.end - fragment.start) as u64,
                    chunks: &chunks,
                    last: sequence + 1 == count,
                },
            );
        }
    }

    fn split_saved(&mut self) {
        let len = self.buffer.len();
        let step = self.buffer_size.max(1);
        let mut start = 0;
        loop {
            let end = (start + step).min(len);
            let compressed = self.compress_range(start, end);
            self.saved.push(SavedFragment { start, end, compressed });
            if end == len {
                break;
            }
            start = end;
        }

        self.state = if self.saved.iter().any(|f| f.compressed.is_some()) {
            CompressionState::Complete
        } else if self.compressor.is_some() && len > 0 {
            CompressionState::Uncompressible
        } else {
            CompressionState::Uncompressed
        };
    }

    /// Compressed form of `buffer[start..end]`, if it is smaller.
    fn compress_range(&self, start: usize, end: usize) -> Option<Vec<Vec<u8>>> {
        let compressor = self.compressor?;
        if start == end {
            return None;
        }
        match compressor.compress(&self.buffer[start..end]) {
            Ok(chunks) => {
                let size: usize = chunks.iter().map(Vec::len).sum();
                (size < end - start).then_some(chunks)
            }
            Err(e) => {
                debug!(error = %e, compressor = %compressor.name(), "Compression failed, sending raw");
                None
            }
        }
    }

    fn reset_buffer(&mut self) {
        if self.save {
            self.buffer_start = self.buffer.len();
        } else {
            self.buffer.clear();
            self.buffer_start = 0;
        }
    }

    fn compress(&mut self, start: usize, end: usize, result: CompressionState) {
        if self.compressor.is_none() || start == end {
            self.state = CompressionState::Uncompressed;
            return;
        }
        match self.compress_range(start, end) {
            Some(chunks) => {
                self.compressed = chunks;
                self.state = result;
            }
            None => {
                self.state = CompressionState::Uncompressible;
                self.compressed.clear();
            }
        }
    }

    fn send(&mut self, start: usize, end: usize, last: bool) {
        let compressed = matches!(
            self.state,
            CompressionState::Partial | CompressionState::Complete
        );
        let (compressor, chunks): (u32, Vec<&[u8]>) = match self.compressor {
            Some(c) if compressed => (c.name() as u32, self.compressed.iter().map(Vec::as_slice).collect()),
            _ if start == end => (0, Vec::new()),
            _ => (0, vec![&self.buffer[start..end]]),
        };
        self.sink.send_data(
            &self.connections,
            DataPacket {
                sequence: self.sequence,
                compressor,
                data_size: (end - start) as u64,
                chunks: &chunks,
                last,
            },
        );
        self.sequence += 1;
    }
}

/// Connections reaching `nodes`, one per distinct connection.
///
/// With more than one receiver, nodes sharing a multicast group are reached
/// through their common multicast connection.
pub fn gather_connections(nodes: &[Arc<Node>]) -> Vec<Connection> {
    let use_multicast = nodes.len() > 1;
    let mut connections: Vec<Connection> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let connection = if use_multicast {
            node.multicast().or_else(|| node.connection())
        } else {
            node.connection()
        };
        let Some(connection) = connection else {
            debug!(node = %node.id(), "No connection to node");
            continue;
        };
        if !connections.contains(&connection) {
            connections.push(connection);
        }
    }
    connections
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stream::DataIStream;
    use weft_proto::CompressorName;
    use weft_proto::compressor::{decompress_chunks, lookup};

    /// A sink that keeps every packet, decompressed.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub packets: Vec<(u32, bool, Vec<u8>)>,
        pub compressed_packets: usize,
    }

    impl DataSink for RecordingSink {
        fn send_data(&mut self, _connections: &[Connection], packet: DataPacket<'_>) {
            if packet.compressor != 0 {
                self.compressed_packets += 1;
            }
            let data = decompress_chunks(packet.compressor, packet.chunks, packet.data_size as usize)
                .unwrap();
            self.packets.push((packet.sequence, packet.last, data));
        }

        fn is_active(&self, _connections: &[Connection]) -> bool {
            true
        }
    }

    impl RecordingSink {
        pub fn reader(&self) -> DataIStream {
            DataIStream::from_fragments(self.packets.iter().map(|(_, _, d)| d.clone()).collect())
        }
    }

    fn rle() -> Option<&'static dyn Compressor> {
        lookup(CompressorName::Rle).unwrap()
    }

    // ========================================================================
    // Packetization
    // ========================================================================

    #[test]
    fn test_small_stream_is_one_final_packet() {
        let mut os = DataOStream::new(RecordingSink::default(), 1024, None);
        os.enable(Vec::new());
        os.write(&7u32);
        os.write("seven");
        os.disable();
        assert!(os.has_sent_data());
        let packets = &os.sink().packets;
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, 0);
        assert!(packets[0].1);
    }

    #[test]
    fn test_large_stream_splits_into_sequential_packets() {
        let mut os = DataOStream::new(RecordingSink::default(), 16, None);
        os.enable(Vec::new());
        for i in 0..20u64 {
            os.write(&i);
        }
        os.disable();
        let packets = &os.sink().packets;
        assert!(packets.len() > 2);
        for (i, (sequence, last, _)) in packets.iter().enumerate() {
            assert_eq!(*sequence as usize, i);
            assert_eq!(*last, i == packets.len() - 1);
        }

        let mut is = os.sink().reader();
        for i in 0..20u64 {
            assert_eq!(is.read::<u64>(), i);
        }
        assert!(!is.has_data());
    }

    #[test]
    fn test_empty_stream_sends_nothing() {
        let mut os = DataOStream::new(RecordingSink::default(), 16, None);
        os.enable(Vec::new());
        os.disable();
        assert!(!os.has_sent_data());
        assert!(os.sink().packets.is_empty());
    }

    // ========================================================================
    // Compression
    // ========================================================================

    #[test]
    fn test_compressed_round_trip_is_identical() {
        let payload = vec![0u8; 4000];
        let mut os = DataOStream::new(RecordingSink::default(), 100_000, rle());
        os.enable(Vec::new());
        os.write(&payload);
        os.write(&0xdead_beefu32);
        os.disable();
        assert_eq!(os.sink().compressed_packets, 1);

        let mut is = os.sink().reader();
        assert_eq!(is.read::<Vec<u8>>(), payload);
        assert_eq!(is.read::<u32>(), 0xdead_beef);
    }

    #[test]
    fn test_uncompressible_data_goes_raw() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let mut os = DataOStream::new(RecordingSink::default(), 100_000, rle());
        os.enable(Vec::new());
        os.write_bytes(&payload);
        os.disable();
        assert_eq!(os.compression_state(), CompressionState::Uncompressible);
        assert_eq!(os.sink().compressed_packets, 0);
        assert_eq!(os.sink().packets[0].2, payload);
    }

    // ========================================================================
    // Save and resend
    // ========================================================================

    #[test]
    fn test_resend_replays_whole_buffer_once_compressed() {
        let mut os = DataOStream::new(RecordingSink::default(), 1024, rle());
        os.enable_save();
        os.enable(Vec::new());
        for _ in 0..10 {
            os.write(&0u64);
        }
        os.disable();
        assert_eq!(os.sink().packets.len(), 1);
        assert_eq!(os.buffer().len(), 80);

        os.resend(Vec::new());
        os.resend(Vec::new());
        assert_eq!(os.compression_state(), CompressionState::Complete);
        let packets = &os.sink().packets;
        assert_eq!(packets.len(), 3);
        assert_eq!(os.sink().compressed_packets, 3);
        for (sequence, last, data) in &packets[1..] {
            assert_eq!(*sequence, 0);
            assert!(*last);
            assert_eq!(data.len(), 80);
        }
    }

    #[test]
    fn test_resend_splits_large_buffer_by_flush_size() {
        let mut os = DataOStream::new(RecordingSink::default(), 100, rle());
        os.enable_save();
        os.enable(Vec::new());
        for _ in 0..40 {
            os.write(&0u64);
        }
        os.disable();
        let streamed = os.sink().packets.len();
        assert!(streamed > 1);
        assert_eq!(os.buffer().len(), 320);

        os.resend(Vec::new());
        let resent = &os.sink().packets[streamed..];
        assert_eq!(resent.len(), 4);
        let mut replayed = Vec::new();
        for (i, (sequence, last, data)) in resent.iter().enumerate() {
            assert_eq!(*sequence as usize, i);
            assert_eq!(*last, i == 3);
            assert!(data.len() <= 100);
            replayed.extend_from_slice(data);
        }
        assert_eq!(replayed, os.buffer());

        // The second resend reuses the fragments.
        os.resend(Vec::new());
        assert_eq!(os.sink().packets.len(), streamed + 8);
        assert_eq!(os.sink().packets[streamed + 4].0, 0);
    }

    #[test]
    fn test_resend_compresses_after_uncompressible_tail() {
        let noise: Vec<u8> = (0..=255u8).collect();
        let mut os = DataOStream::new(RecordingSink::default(), 100_000, rle());
        os.enable_save();
        os.enable(Vec::new());
        os.write_bytes(&[0u8; 4000]);
        os.flush();
        os.write_bytes(&noise);
        os.disable();
        assert_eq!(os.compression_state(), CompressionState::Uncompressible);
        assert_eq!(os.sink().compressed_packets, 1);

        os.resend(Vec::new());
        assert_eq!(os.compression_state(), CompressionState::Complete);
        assert_eq!(os.sink().compressed_packets, 2);
        let (sequence, last, data) = os.sink().packets.last().unwrap();
        assert_eq!(*sequence, 0);
        assert!(*last);
        assert_eq!(data.len(), 4256);
        assert_eq!(&data[4000..], noise.as_slice());
    }

    #[test]
    #[should_panic(expected = "write to a disabled data stream")]
    fn test_write_when_disabled_panics() {
        let mut os = DataOStream::new(RecordingSink::default(), 8, None);
        os.write(&1u8);
    }
}
