// Transport stream time-shift indexing core

pub mod framer;
pub mod index;
pub mod packet;
pub mod tsindexer;

pub use framer::{Framer, PacketSize};
pub use index::{Bounds, Index, IndexEntry, OrderError};
pub use packet::{
    AdaptationField, Packet, PacketError, PacketHeader, Pcr, PCR_WRAP, SYNC_BYTE, TS_PACKET_SIZE,
};
pub use tsindexer::{Anomaly, IndexStats, IndexerConfig, PacketOutcome, TsIndexer};

use once_cell::sync::Lazy;

pub(crate) static CAT: Lazy<gst::DebugCategory> = Lazy::new(|| {
    gst::DebugCategory::new(
        "tsindex",
        gst::DebugColorFlags::empty(),
        Some("Transport stream PCR index"),
    )
});
