// Splits host buffers into transport stream packets with absolute positions

use super::packet::{PacketError, SYNC_BYTE, TS_PACKET_SIZE};
use slice_of_array::prelude::*;

/// Wire packet layout, as announced by the `packetsize` caps field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketSize {
    /// Plain 188 byte packets.
    #[default]
    Ts,
    /// 192 byte M2TS packets with a 4 byte timecode prefix.
    M2ts,
    /// 204 byte DVB packets with a 16 byte Reed-Solomon suffix.
    Dvb,
}

impl PacketSize {
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            188 => Some(PacketSize::Ts),
            192 => Some(PacketSize::M2ts),
            204 => Some(PacketSize::Dvb),
            _ => None,
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            PacketSize::Ts => TS_PACKET_SIZE,
            PacketSize::M2ts => 192,
            PacketSize::Dvb => 204,
        }
    }

    /// Offset of the sync byte within a wire packet.
    pub const fn sync_offset(self) -> usize {
        match self {
            PacketSize::M2ts => 4,
            PacketSize::Ts | PacketSize::Dvb => 0,
        }
    }
}

/// Reassembles packets across buffer boundaries.
///
/// Every emitted packet is tagged with the absolute stream position of its
/// first wire byte. Bytes skipped while hunting for sync still advance the
/// position, so positions always refer to the byte stream as delivered.
#[derive(Debug)]
pub struct Framer {
    size: PacketSize,
    pending: Vec<u8>,
    next: u64,
    in_sync: bool,
}

impl Framer {
    pub fn new(size: PacketSize) -> Self {
        Self {
            size,
            pending: Vec::with_capacity(size.bytes()),
            next: 0,
            in_sync: true,
        }
    }

    /// Changing the packet layout drops any partial packet.
    pub fn set_packet_size(&mut self, size: PacketSize) {
        if size != self.size {
            self.size = size;
            self.discont();
        }
    }

    /// Absolute position of the next byte to be pushed.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Rebase the stream position; pending bytes no longer line up and are dropped.
    pub fn set_position(&mut self, position: u64) {
        self.discont();
        self.next = position;
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn discont(&mut self) {
        self.pending.clear();
        self.in_sync = true;
    }

    /// Feeds `data` and calls `f` for every complete packet, or once per
    /// sync loss with the error and the position where it was detected.
    pub fn push<F>(&mut self, data: &[u8], mut f: F)
    where
        F: FnMut(Result<&[u8; TS_PACKET_SIZE], PacketError>, u64),
    {
        let size = self.size.bytes();
        let mut data = data;
        let mut position = self.next;
        self.next += data.len() as u64;

        if !self.pending.is_empty() {
            let need = size - self.pending.len();
            if data.len() < need {
                self.pending.extend_from_slice(data);
                return;
            }

            let start = position - self.pending.len() as u64;
            self.pending.extend_from_slice(&data[..need]);

            if self.pending[self.size.sync_offset()] == SYNC_BYTE {
                let pending = std::mem::take(&mut self.pending);
                self.emit(&pending, start, &mut f);
                self.pending = pending;
                self.pending.clear();
                data = &data[need..];
                position += need as u64;
            } else {
                // Lost sync inside the carried-over bytes, rescan them with the rest.
                let mut joined = std::mem::take(&mut self.pending);
                joined.extend_from_slice(&data[need..]);
                let consumed = self.scan(&joined, start, &mut f);
                joined.drain(..consumed);
                self.pending = joined;
                return;
            }
        }

        let consumed = self.scan(data, position, &mut f);
        self.pending.extend_from_slice(&data[consumed..]);
    }

    /// Emits all complete packets in `data` and returns the number of bytes
    /// consumed; the remainder is a candidate partial packet.
    fn scan<F>(&mut self, data: &[u8], base: u64, f: &mut F) -> usize
    where
        F: FnMut(Result<&[u8; TS_PACKET_SIZE], PacketError>, u64),
    {
        let size = self.size.bytes();
        let sync = self.size.sync_offset();
        let mut offset = 0;

        while data.len() - offset >= size {
            let rest = &data[offset..];

            // While hunting, a candidate only counts if the next packet
            // starts with a sync byte too, unless the buffer ends first.
            let confirmed = self.in_sync
                || rest
                    .get(sync + size)
                    .map_or(true, |&b| b == SYNC_BYTE);
            if rest[sync] == SYNC_BYTE && confirmed {
                self.emit(&rest[..size], base + offset as u64, f);
                offset += size;
                continue;
            }

            if self.in_sync {
                self.in_sync = false;
                f(Err(PacketError::Sync(rest[sync])), base + offset as u64);
            }

            match rest[sync + 1..].iter().position(|&b| b == SYNC_BYTE) {
                Some(skip) => offset += skip + 1,
                None => return data.len() - sync,
            }
        }

        offset
    }

    fn emit<F>(&mut self, wire: &[u8], position: u64, f: &mut F)
    where
        F: FnMut(Result<&[u8; TS_PACKET_SIZE], PacketError>, u64),
    {
        let sync = self.size.sync_offset();
        self.in_sync = true;
        f(
            Ok(SliceArrayExt::as_array(&wire[sync..sync + TS_PACKET_SIZE])),
            position,
        );
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(PacketSize::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::packet::tests::payload_packet;
    use itertools::Itertools;
    use pretty_assertions::assert_eq;

    fn collect(framer: &mut Framer, data: &[u8]) -> Vec<(Result<u16, PacketError>, u64)> {
        let mut out = vec![];
        framer.push(data, |frame, position| {
            let pid = frame.map(|packet| (u16::from(packet[1] & 0x1f) << 8) | u16::from(packet[2]));
            out.push((pid, position));
        });
        out
    }

    fn stream(pids: impl IntoIterator<Item = u16>) -> Vec<u8> {
        pids.into_iter().flat_map(payload_packet).collect()
    }

    #[test]
    fn aligned_buffer() {
        let mut framer = Framer::default();
        let frames = collect(&mut framer, &stream([1, 2, 3]));

        assert_eq!(frames, vec![(Ok(1), 0), (Ok(2), 188), (Ok(3), 376)]);
        assert_eq!(framer.pending(), 0);
        assert_eq!(framer.position(), 564);
    }

    #[test]
    fn packets_split_across_buffers() {
        let data = stream(1..=4);
        let mut framer = Framer::default();

        let frames = data
            .chunks(100)
            .flat_map(|chunk| collect(&mut framer, chunk))
            .collect_vec();

        assert_eq!(
            frames,
            vec![(Ok(1), 0), (Ok(2), 188), (Ok(3), 376), (Ok(4), 564)]
        );
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn m2ts_and_dvb_layouts() {
        let mut m2ts = vec![];
        let mut dvb = vec![];
        for pid in [7, 8] {
            m2ts.extend_from_slice(&[0xaa; 4]);
            m2ts.extend_from_slice(&payload_packet(pid));
            dvb.extend_from_slice(&payload_packet(pid));
            dvb.extend_from_slice(&[0xbb; 16]);
        }

        let mut framer = Framer::new(PacketSize::M2ts);
        assert_eq!(collect(&mut framer, &m2ts), vec![(Ok(7), 0), (Ok(8), 192)]);

        let mut framer = Framer::new(PacketSize::Dvb);
        assert_eq!(collect(&mut framer, &dvb), vec![(Ok(7), 0), (Ok(8), 204)]);
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut data = stream([1]);
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(&stream([2, 3]));

        let mut framer = Framer::default();
        let frames = collect(&mut framer, &data);

        assert_eq!(
            frames,
            vec![
                (Ok(1), 0),
                (Err(PacketError::Sync(0)), 188),
                (Ok(2), 198),
                (Ok(3), 386),
            ]
        );
    }

    #[test]
    fn ignores_sync_byte_inside_garbage() {
        let mut data = stream([1]);
        data.extend_from_slice(&[0, 0, SYNC_BYTE, 0, 0]);
        data.extend_from_slice(&stream([2, 3]));

        let mut framer = Framer::default();
        let frames = collect(&mut framer, &data);

        assert_eq!(
            frames,
            vec![
                (Ok(1), 0),
                (Err(PacketError::Sync(0)), 188),
                (Ok(2), 193),
                (Ok(3), 381),
            ]
        );
    }

    #[test]
    fn resyncs_inside_carried_bytes() {
        let mut data = vec![0u8; 50];
        data.extend_from_slice(&stream([5, 6]));

        let mut framer = Framer::default();
        let mut frames = collect(&mut framer, &data[..30]);
        frames.extend(collect(&mut framer, &data[30..]));

        assert_eq!(
            frames,
            vec![(Err(PacketError::Sync(0)), 0), (Ok(5), 50), (Ok(6), 238)]
        );
    }

    #[test]
    fn rebase_drops_partial_packet() {
        let data = stream([1, 2]);
        let mut framer = Framer::default();

        assert_eq!(collect(&mut framer, &data[..200]), vec![(Ok(1), 0)]);
        assert_eq!(framer.pending(), 12);

        framer.set_position(10_000);
        assert_eq!(framer.pending(), 0);
        assert_eq!(collect(&mut framer, &data), vec![(Ok(1), 10_000), (Ok(2), 10_188)]);
    }
}
