// PCR tracking and thread-safe ownership of the time-shift index

use super::{
    index::{Bounds, Index, IndexEntry, OrderError},
    packet::{Packet, PacketError, Pcr, PCR_WRAP},
    CAT,
};
use gst::ClockTime;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex, RwLock,
};
use thiserror::Error;

pub const DEFAULT_SAMPLING_INTERVAL: ClockTime = ClockTime::from_mseconds(100);
pub const DEFAULT_MAX_SPAN: ClockTime = ClockTime::from_seconds(3600);
pub const DEFAULT_MAX_ENTRIES: usize = 65_536;
pub const DEFAULT_PCR_DISCONTINUITY_THRESHOLD: ClockTime = ClockTime::from_seconds(1);
pub const DEFAULT_RESYNC_COUNT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    /// Minimum PCR distance between two indexed points.
    pub sampling_interval: ClockTime,
    /// Oldest entries are evicted once the index covers more than this. Zero is unbounded.
    pub max_span: ClockTime,
    /// Zero is unbounded.
    pub max_entries: usize,
    /// Largest forward PCR step accepted without a discontinuity flag. Zero
    /// accepts any forward step shorter than half the PCR wrap period.
    pub pcr_discontinuity_threshold: ClockTime,
    /// PID whose PCR drives the index, or the first PCR PID seen.
    pub pcr_pid: Option<u16>,
    /// Consecutive, mutually consistent anomalous PCRs after which the
    /// stream is considered to have moved to a new timeline. Zero never resyncs.
    pub resync_count: u32,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            max_span: DEFAULT_MAX_SPAN,
            max_entries: DEFAULT_MAX_ENTRIES,
            pcr_discontinuity_threshold: DEFAULT_PCR_DISCONTINUITY_THRESHOLD,
            pcr_pid: None,
            resync_count: DEFAULT_RESYNC_COUNT,
        }
    }
}

impl IndexerConfig {
    pub fn bounds(&self) -> Bounds {
        Bounds {
            max_entries: self.max_entries,
            max_span: Pcr::from_clock_time(self.max_span),
        }
    }

    fn threshold_ticks(&self) -> u64 {
        match Pcr::from_clock_time(self.pcr_discontinuity_threshold).ticks() {
            0 => PCR_WRAP / 2 - 1,
            ticks => ticks.min(PCR_WRAP / 2 - 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Anomaly {
    #[error("PCR went backwards by {0}")]
    Backwards(ClockTime),
    #[error("PCR jumped forward by {0}")]
    Jump(ClockTime),
    #[error("stream position {position} does not follow {last}")]
    PositionRegressed { position: u64, last: u64 },
}

/// What happened to a packet on the indexing side. The packet itself is
/// never affected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    Indexed(IndexEntry),
    /// Valid PCR, but too close to the last indexed point.
    Sampled,
    NoPcr,
    /// PCR on a PID other than the reference one.
    OtherPid,
    Malformed(PacketError),
    Anomaly(Anomaly),
    /// The index failed its ordering check and was reset.
    Dropped(OrderError),
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub entries: usize,
    pub earliest: Option<IndexEntry>,
    pub latest: Option<IndexEntry>,
    pub packets: u64,
    pub malformed: u64,
    pub anomalies: u64,
    pub resets: u64,
    /// Bumped every time the index starts a new timeline.
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct PcrClock {
    raw: u64,
    unwrapped: u64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    raw: u64,
    run: u32,
}

enum Step {
    Accept(Pcr),
    Restart,
    Reject(Anomaly),
}

/// Data path state, only touched while ingesting.
#[derive(Debug, Default)]
struct Ingest {
    config: IndexerConfig,
    pcr_pid: Option<u16>,
    clock: Option<PcrClock>,
    last_indexed: Option<Pcr>,
    last_position: Option<u64>,
    candidate: Option<Candidate>,
}

/// Forward distance from `from` to `to` on the wrapping PCR clock.
fn forward_step(from: u64, to: u64) -> u64 {
    (to + PCR_WRAP - from) % PCR_WRAP
}

impl Ingest {
    fn classify(&self, raw: u64) -> Step {
        let Some(clock) = self.clock else {
            return Step::Restart;
        };

        let forward = forward_step(clock.raw, raw);
        if forward <= self.config.threshold_ticks() {
            return Step::Accept(Pcr::from_ticks(clock.unwrapped + forward));
        }

        let backward = forward_step(raw, clock.raw);
        if backward < forward {
            Step::Reject(Anomaly::Backwards(Pcr::from_ticks(backward).to_clock_time()))
        } else {
            Step::Reject(Anomaly::Jump(Pcr::from_ticks(forward).to_clock_time()))
        }
    }

    /// Tracks runs of anomalous PCRs that agree with each other.
    fn note_candidate(&mut self, raw: u64) -> u32 {
        let threshold = self.config.threshold_ticks();
        let run = match self.candidate {
            Some(candidate) if forward_step(candidate.raw, raw) <= threshold => candidate.run + 1,
            _ => 1,
        };
        self.candidate = Some(Candidate { raw, run });
        run
    }

    fn start_timeline(&mut self, raw: u64) -> Pcr {
        self.clock = Some(PcrClock { raw, unwrapped: raw });
        self.candidate = None;
        self.last_indexed = None;
        Pcr::from_ticks(raw)
    }

    fn reset_timeline(&mut self) {
        self.clock = None;
        self.candidate = None;
        self.last_indexed = None;
    }
}

#[derive(Debug, Default)]
struct Counters {
    packets: AtomicU64,
    malformed: AtomicU64,
    anomalies: AtomicU64,
    resets: AtomicU64,
    generation: AtomicU64,
}

/// Builds a PCR -> byte position index from passthrough traffic.
///
/// Packets are fed from a single data path thread through [`on_packet`];
/// [`lookup`], [`reset`] and [`stats`] may be called from any thread. The
/// index is `None` while stopped. Locks are always taken in the order
/// ingest, then index, and the index write lock is only held to push and
/// evict a finished entry.
///
/// [`on_packet`]: TsIndexer::on_packet
/// [`lookup`]: TsIndexer::lookup
/// [`reset`]: TsIndexer::reset
/// [`stats`]: TsIndexer::stats
#[derive(Debug, Default)]
pub struct TsIndexer {
    ingest: Mutex<Ingest>,
    index: RwLock<Option<Index>>,
    running: AtomicBool,
    counters: Counters,
}

impl TsIndexer {
    pub fn new(config: IndexerConfig) -> Self {
        let indexer = Self::default();
        indexer.set_config(config);
        indexer
    }

    /// Applies to subsequent packets; tightened bounds evict right away.
    /// Moving off the PCR PID currently in use starts over, and `None`
    /// selects the next PCR PID seen.
    pub fn set_config(&self, config: IndexerConfig) {
        let mut ingest = self.ingest.lock().unwrap();

        if config.pcr_pid != ingest.config.pcr_pid {
            if self.is_running() && ingest.pcr_pid.is_some() && ingest.pcr_pid != config.pcr_pid {
                gst::info!(
                    CAT,
                    "PCR PID changed from {:?} to {:?}, restarting index",
                    ingest.pcr_pid,
                    config.pcr_pid
                );
                self.clear_index(&mut ingest);
                ingest.last_position = None;
            }
            ingest.pcr_pid = config.pcr_pid;
        }

        let bounds = config.bounds();
        ingest.config = config;

        if let Some(index) = self.index.write().unwrap().as_mut() {
            let evicted = index.set_bounds(bounds);
            if evicted > 0 {
                gst::debug!(CAT, "Evicted {} entries after bounds change", evicted);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Creates an empty index. No-op when already running.
    pub fn start(&self) {
        let mut ingest = self.ingest.lock().unwrap();
        let mut index = self.index.write().unwrap();
        if index.is_some() {
            return;
        }

        *index = Some(Index::new(ingest.config.bounds()));
        ingest.reset_timeline();
        ingest.last_position = None;
        ingest.pcr_pid = ingest.config.pcr_pid;

        self.counters.packets.store(0, Ordering::Relaxed);
        self.counters.malformed.store(0, Ordering::Relaxed);
        self.counters.anomalies.store(0, Ordering::Relaxed);
        self.counters.resets.store(0, Ordering::Relaxed);
        self.counters.generation.fetch_add(1, Ordering::Relaxed);
        self.running.store(true, Ordering::Release);

        gst::debug!(CAT, "Started");
    }

    /// Discards the index once in-flight lookups have released it. No-op
    /// when already stopped.
    pub fn stop(&self) {
        let _ingest = self.ingest.lock().unwrap();
        self.running.store(false, Ordering::Release);

        if let Some(index) = self.index.write().unwrap().take() {
            gst::debug!(CAT, "Stopped, discarding {} entries", index.len());
        }
    }

    /// Forgets every entry and the PCR history so no stale entry is ever
    /// matched against a new timeline.
    pub fn reset(&self) {
        let mut ingest = self.ingest.lock().unwrap();
        if !self.is_running() {
            return;
        }

        self.clear_index(&mut ingest);
        ingest.last_position = None;
        ingest.pcr_pid = ingest.config.pcr_pid;
    }

    /// Inspects one 188 byte packet found at `position` in the stream.
    pub fn on_packet(&self, data: &[u8], position: u64) -> PacketOutcome {
        if !self.is_running() {
            return PacketOutcome::Stopped;
        }
        self.counters.packets.fetch_add(1, Ordering::Relaxed);

        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(err) => return self.record_malformed(err, position),
        };

        let af = match packet.adaptation_field() {
            Ok(Some(af)) => af,
            Ok(None) => return PacketOutcome::NoPcr,
            Err(err) => return self.record_malformed(err, position),
        };
        let Some(raw) = af.pcr else {
            return PacketOutcome::NoPcr;
        };
        let raw = raw % PCR_WRAP;
        let pid = packet.pid();

        let mut ingest = self.ingest.lock().unwrap();

        match ingest.pcr_pid {
            Some(reference) if reference != pid => return PacketOutcome::OtherPid,
            Some(_) => (),
            None => {
                gst::info!(CAT, "Using PID {:#06x} as PCR reference", pid);
                ingest.pcr_pid = Some(pid);
            }
        }

        if let Some(last) = ingest.last_position.filter(|&last| position <= last) {
            return self.record_anomaly(Anomaly::PositionRegressed { position, last }, pid);
        }

        let step = if af.discontinuity {
            Step::Restart
        } else {
            ingest.classify(raw)
        };

        let pcr = match step {
            Step::Accept(pcr) => {
                ingest.candidate = None;
                pcr
            }
            Step::Restart => {
                if ingest.clock.is_some() {
                    gst::debug!(CAT, "PCR discontinuity at {}, restarting index", position);
                    self.clear_index(&mut ingest);
                }
                ingest.start_timeline(raw)
            }
            Step::Reject(anomaly) => {
                let resync_count = ingest.config.resync_count;
                if resync_count == 0 || ingest.note_candidate(raw) < resync_count {
                    return self.record_anomaly(anomaly, pid);
                }

                match (anomaly, ingest.clock) {
                    // Gap in the signal, the timeline goes on past it.
                    (Anomaly::Jump(gap), Some(clock)) => {
                        gst::info!(
                            CAT,
                            "PCR resumed {} later at {}, keeping index",
                            gap,
                            position
                        );
                        ingest.candidate = None;
                        Pcr::from_ticks(clock.unwrapped + forward_step(clock.raw, raw))
                    }
                    _ => {
                        gst::warning!(
                            CAT,
                            "PCR moved to a new timeline without discontinuity flag at {}, restarting index",
                            position
                        );
                        self.clear_index(&mut ingest);
                        ingest.start_timeline(raw)
                    }
                }
            }
        };

        ingest.clock = Some(PcrClock {
            raw,
            unwrapped: pcr.ticks(),
        });
        ingest.last_position = Some(position);

        let interval = Pcr::from_clock_time(ingest.config.sampling_interval);
        let due = ingest
            .last_indexed
            .map_or(true, |last| pcr > last && pcr.saturating_sub(last) >= interval);
        if !due {
            return PacketOutcome::Sampled;
        }

        self.append(
            &mut ingest,
            IndexEntry {
                pcr,
                position,
                pid,
                random_access: af.random_access,
            },
        )
    }

    /// Records a packet the framer could not deliver intact.
    pub fn record_malformed(&self, err: PacketError, position: u64) -> PacketOutcome {
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
        gst::debug!(CAT, "Malformed packet at {}: {}", position, err);
        PacketOutcome::Malformed(err)
    }

    /// Latest entry at or before `target`, `None` if nothing that old is
    /// retained.
    pub fn lookup(&self, target: Pcr) -> Option<IndexEntry> {
        self.index.read().unwrap().as_ref()?.lookup(target)
    }

    pub fn lookup_time(&self, target: ClockTime) -> Option<IndexEntry> {
        self.lookup(Pcr::from_clock_time(target))
    }

    /// Like [`lookup_time`](TsIndexer::lookup_time), with `target` counted
    /// from the first PCR of the current timeline.
    pub fn lookup_stream_time(&self, target: ClockTime) -> Option<IndexEntry> {
        let guard = self.index.read().unwrap();
        let index = guard.as_ref()?;
        let origin = index.origin()?;

        let pcr = origin
            .ticks()
            .saturating_add(Pcr::from_clock_time(target).ticks());
        index.lookup(Pcr::from_ticks(pcr))
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.index
            .read()
            .unwrap()
            .as_ref()
            .map(|index| index.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> IndexStats {
        let (entries, earliest, latest) = match self.index.read().unwrap().as_ref() {
            Some(index) => (index.len(), index.first().copied(), index.last().copied()),
            None => (0, None, None),
        };

        IndexStats {
            entries,
            earliest,
            latest,
            packets: self.counters.packets.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            anomalies: self.counters.anomalies.load(Ordering::Relaxed),
            resets: self.counters.resets.load(Ordering::Relaxed),
            generation: self.counters.generation.load(Ordering::Relaxed),
        }
    }

    fn record_anomaly(&self, anomaly: Anomaly, pid: u16) -> PacketOutcome {
        self.counters.anomalies.fetch_add(1, Ordering::Relaxed);
        gst::warning!(CAT, "Not indexing PCR on PID {:#06x}: {}", pid, anomaly);
        PacketOutcome::Anomaly(anomaly)
    }

    fn clear_index(&self, ingest: &mut Ingest) {
        ingest.reset_timeline();
        if let Some(index) = self.index.write().unwrap().as_mut() {
            index.clear();
        }
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
        self.counters.generation.fetch_add(1, Ordering::Relaxed);
    }

    fn append(&self, ingest: &mut Ingest, entry: IndexEntry) -> PacketOutcome {
        let mut guard = self.index.write().unwrap();
        let Some(index) = guard.as_mut() else {
            return PacketOutcome::Stopped;
        };

        match index.push(entry) {
            Ok(evicted) => {
                debug_assert!(index.is_ordered());
                drop(guard);
                ingest.last_indexed = Some(entry.pcr);
                gst::trace!(
                    CAT,
                    "Indexed {} at {} (evicted {})",
                    entry.pcr,
                    entry.position,
                    evicted
                );
                PacketOutcome::Indexed(entry)
            }
            Err(err) => {
                if cfg!(debug_assertions) {
                    panic!("index ordering violated: {err}");
                }

                index.clear();
                drop(guard);
                ingest.reset_timeline();
                self.counters.resets.fetch_add(1, Ordering::Relaxed);
                self.counters.generation.fetch_add(1, Ordering::Relaxed);
                gst::error!(CAT, "Index ordering violated, index reset: {}", err);
                PacketOutcome::Dropped(err)
            }
        }
    }
}
