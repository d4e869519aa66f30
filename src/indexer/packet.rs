// MPEG-TS packet header and adaptation field parsing

use bitstream_io::{BigEndian, BitRead, BitReader, FromBitStream};
use gst::ClockTime;
use std::{fmt, io};
use thiserror::Error;

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

/// Number of 27 MHz ticks after which a raw PCR wraps around (2^33 * 300).
pub const PCR_WRAP: u64 = (1 << 33) * 300;

/// A point on the 27 MHz program clock.
///
/// Values read from the wire are bounded by [`PCR_WRAP`]; values stored in
/// the index are unwrapped onto a 64 bit timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pcr(u64);

impl Pcr {
    pub const HZ: u64 = 27_000_000;
    pub const ZERO: Pcr = Pcr(0);

    pub const fn from_ticks(ticks: u64) -> Self {
        Pcr(ticks)
    }

    pub const fn ticks(self) -> u64 {
        self.0
    }

    pub fn from_clock_time(time: ClockTime) -> Self {
        let ticks = time.nseconds() as u128 * 27 / 1000;
        Pcr(ticks.min(u64::MAX as u128) as u64)
    }

    pub fn to_clock_time(self) -> ClockTime {
        ClockTime::from_nseconds((self.0 as u128 * 1000 / 27) as u64)
    }

    pub fn saturating_sub(self, other: Pcr) -> Pcr {
        Pcr(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Pcr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} ticks)", self.to_clock_time(), self.0)
    }
}

/// Reasons a packet cannot be inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet is {0} bytes, expected {TS_PACKET_SIZE}")]
    Size(usize),
    #[error("sync byte mismatch, found {0:#04x}")]
    Sync(u8),
    #[error("transport error indicator is set")]
    TransportError,
    #[error("adaptation field of {0} bytes overruns the packet")]
    AdaptationField(usize),
    #[error("packet header is truncated")]
    Truncated,
}

impl From<io::Error> for PacketError {
    fn from(_: io::Error) -> Self {
        PacketError::Truncated
    }
}

/// The fixed 4 byte transport packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub tei: bool,
    pub pusi: bool,
    pub pid: u16,
    /// Adaptation field control.
    pub afc: u8,
}

impl FromBitStream for PacketHeader {
    type Error = PacketError;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error>
    where
        Self: Sized,
    {
        let sync = r.read_to::<u8>()?;
        if sync != SYNC_BYTE {
            return Err(PacketError::Sync(sync));
        }

        let tei = r.read_bit()?;
        let pusi = r.read_bit()?;
        r.skip(1)?; // transport priority
        let pid = r.read::<13, u16>()?;
        r.skip(2)?; // scrambling control
        let afc = r.read::<2, u8>()?;
        r.skip(4)?; // continuity counter

        Ok(PacketHeader {
            tei,
            pusi,
            pid,
            afc,
        })
    }
}

/// Read-only view over the 188 byte TS portion of a packet.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    data: &'a [u8; TS_PACKET_SIZE],
    header: PacketHeader,
}

impl<'a> Packet<'a> {
    /// Validates the size, sync byte and transport error indicator.
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        let data: &[u8; TS_PACKET_SIZE] = data
            .try_into()
            .map_err(|_| PacketError::Size(data.len()))?;

        let header = BitReader::endian(&data[..4], BigEndian).parse::<PacketHeader>()?;
        if header.tei {
            return Err(PacketError::TransportError);
        }

        Ok(Self { data, header })
    }

    pub fn pid(&self) -> u16 {
        self.header.pid
    }

    pub fn has_adaptation_field(&self) -> bool {
        self.header.afc & 0b10 != 0
    }

    /// Returns `None` when the packet has no adaptation field or an empty
    /// one (single stuffing byte).
    pub fn adaptation_field(&self) -> Result<Option<AdaptationField>, PacketError> {
        if !self.has_adaptation_field() {
            return Ok(None);
        }

        let len = usize::from(self.data[4]);
        if len == 0 {
            return Ok(None);
        }
        let field = self
            .data
            .get(5..5 + len)
            .ok_or(PacketError::AdaptationField(len))?;

        BitReader::endian(field, BigEndian)
            .parse::<AdaptationField>()
            .map(Some)
            .map_err(|_| PacketError::AdaptationField(len))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdaptationField {
    pub discontinuity: bool,
    pub random_access: bool,
    /// Raw program clock reference in 27 MHz ticks, below [`PCR_WRAP`].
    pub pcr: Option<u64>,
}

impl FromBitStream for AdaptationField {
    type Error = io::Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error>
    where
        Self: Sized,
    {
        let discontinuity = r.read_bit()?;
        let random_access = r.read_bit()?;
        r.skip(1)?; // elementary stream priority
        let pcr_present = r.read_bit()?;
        r.skip(4)?;

        let pcr = if pcr_present {
            let base = r.read::<33, u64>()?;
            r.skip(6)?;
            let ext = r.read::<9, u64>()?;
            Some(base * 300 + ext % 300)
        } else {
            None
        };

        Ok(AdaptationField {
            discontinuity,
            random_access,
            pcr,
        })
    }
}
