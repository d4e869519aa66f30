use crate::indexer::{
    tsindexer::{
        DEFAULT_MAX_ENTRIES, DEFAULT_MAX_SPAN, DEFAULT_PCR_DISCONTINUITY_THRESHOLD,
        DEFAULT_SAMPLING_INTERVAL,
    },
    Framer, IndexerConfig, PacketSize, TsIndexer,
};
use glib::subclass::{prelude::*, types::ObjectSubclass, Signal};
use gst::{
    debug, info, prelude::*,
    subclass::{prelude::*, ElementMetadata},
    BufferRef, ClockTime, FlowError, FlowSuccess, PadDirection, PadPresence, PadTemplate,
};
use gst_base::subclass::{prelude::*, BaseTransformMode};
use once_cell::sync::Lazy;
use std::sync::Mutex;

const DEFAULT_PCR_PID: i32 = -1;
const MAX_PID: i32 = 0x1ffe;

static CAT: Lazy<gst::DebugCategory> = Lazy::new(|| {
    gst::DebugCategory::new(
        "timeshifttsindexer",
        gst::DebugColorFlags::empty(),
        Some("MPEG-TS time-shift indexer"),
    )
});

pub struct TimeShiftTsIndexer {
    props: Mutex<Properties>,
    indexer: TsIndexer,
    state: Mutex<Option<State>>,
}

#[derive(Clone)]
struct Properties {
    sampling_interval: ClockTime,
    max_index_span: ClockTime,
    max_index_entries: u32,
    pcr_discontinuity_threshold: ClockTime,
    pcr_pid: i32,
}

struct State {
    framer: Framer,
}

impl Properties {
    fn config(&self) -> IndexerConfig {
        IndexerConfig {
            sampling_interval: self.sampling_interval,
            max_span: self.max_index_span,
            max_entries: self.max_index_entries as usize,
            pcr_discontinuity_threshold: self.pcr_discontinuity_threshold,
            pcr_pid: u16::try_from(self.pcr_pid).ok(),
            ..Default::default()
        }
    }
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            max_index_span: DEFAULT_MAX_SPAN,
            max_index_entries: DEFAULT_MAX_ENTRIES as u32,
            pcr_discontinuity_threshold: DEFAULT_PCR_DISCONTINUITY_THRESHOLD,
            pcr_pid: DEFAULT_PCR_PID,
        }
    }
}

impl Default for TimeShiftTsIndexer {
    fn default() -> Self {
        let props = Properties::default();
        let indexer = TsIndexer::new(props.config());

        Self {
            props: Mutex::new(props),
            indexer,
            state: Mutex::new(None),
        }
    }
}

/// Reads the optional `packetsize` field, plain 188 byte packets if absent.
fn packet_size_from_caps(caps: &gst::CapsRef) -> Result<PacketSize, gst::LoggableError> {
    let s = caps
        .structure(0)
        .ok_or_else(|| gst::loggable_error!(CAT, "Empty caps"))?;

    if !s.has_field("packetsize") {
        return Ok(PacketSize::default());
    }

    let bytes = s
        .get::<i32>("packetsize")
        .map_err(|_| gst::loggable_error!(CAT, "Invalid packetsize field"))?;

    usize::try_from(bytes)
        .ok()
        .and_then(PacketSize::from_bytes)
        .ok_or_else(|| gst::loggable_error!(CAT, "Unsupported packet size {}", bytes))
}

impl TimeShiftTsIndexer {
    fn update_config(&self, props: &Properties) {
        self.indexer.set_config(props.config());
    }

    fn index_buffer(&self, buf: &BufferRef) {
        let map = match buf.map_readable() {
            Ok(map) => map,
            Err(_) => {
                gst::warning!(CAT, imp: self, "Failed to map buffer readable, not indexing");
                return;
            }
        };

        let mut state_guard = self.state.lock().unwrap();
        let Some(state) = state_guard.as_mut() else {
            return;
        };

        if buf.flags().contains(gst::BufferFlags::DISCONT) && state.framer.pending() > 0 {
            debug!(
                CAT,
                imp: self,
                "Discont, dropping {} pending bytes",
                state.framer.pending()
            );
            state.framer.discont();
        }

        let offset = buf.offset();
        if offset != gst::ffi::GST_BUFFER_OFFSET_NONE {
            let expected = state.framer.position();
            if offset < expected {
                info!(
                    CAT,
                    imp: self,
                    "Stream offset went back from {} to {}, restarting index",
                    expected,
                    offset
                );
                self.indexer.reset();
                state.framer.set_position(offset);
            } else if offset > expected {
                debug!(
                    CAT,
                    imp: self,
                    "Skipped {} bytes of stream",
                    offset - expected
                );
                state.framer.set_position(offset);
            }
        }

        let indexer = &self.indexer;
        state.framer.push(map.as_slice(), |frame, position| {
            match frame {
                Ok(packet) => indexer.on_packet(packet, position),
                Err(err) => indexer.record_malformed(err, position),
            };
        });
    }

    fn reset_index(&self) {
        self.indexer.reset();
        if let Some(state) = self.state.lock().unwrap().as_mut() {
            state.framer.discont();
        }
        debug!(CAT, imp: self, "Index reset");
    }

    fn lookup(&self, time: ClockTime) -> Option<u64> {
        let entry = self.indexer.lookup_time(time);
        debug!(CAT, imp: self, "Lookup {} -> {:?}", time, entry);
        entry.map(|entry| entry.position)
    }

    /// Stream time starts at the first PCR of the current timeline.
    fn convert_stream_time(&self, time: ClockTime) -> Option<u64> {
        let entry = self.indexer.lookup_stream_time(time);
        debug!(CAT, imp: self, "Convert stream time {} -> {:?}", time, entry);
        entry.map(|entry| entry.position)
    }

    fn stats(&self) -> gst::Structure {
        let stats = self.indexer.stats();

        let mut s = gst::Structure::builder("timeshift-index-stats")
            .field("entries", stats.entries as u64)
            .field("packets", stats.packets)
            .field("malformed", stats.malformed)
            .field("anomalies", stats.anomalies)
            .field("resets", stats.resets)
            .field("generation", stats.generation)
            .build();

        if let Some(earliest) = stats.earliest {
            s.set("earliest-time", earliest.time().nseconds());
            s.set("earliest-offset", earliest.position);
        }
        if let Some(latest) = stats.latest {
            s.set("latest-time", latest.time().nseconds());
            s.set("latest-offset", latest.position);
        }

        s
    }
}

#[glib::object_subclass]
impl ObjectSubclass for TimeShiftTsIndexer {
    const NAME: &'static str = "GstTimeShiftTsIndexer";
    type Type = super::TimeShiftTsIndexer;
    type ParentType = gst_base::BaseTransform;
}

impl ObjectImpl for TimeShiftTsIndexer {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: Lazy<Vec<glib::ParamSpec>> = Lazy::new(|| {
            vec![
                glib::ParamSpecUInt64::builder("sampling-interval")
                    .nick("Sampling interval")
                    .blurb("Minimum PCR time (in ns) between two indexed points")
                    .default_value(DEFAULT_SAMPLING_INTERVAL.nseconds())
                    .mutable_playing()
                    .build(),
                glib::ParamSpecUInt64::builder("max-index-span")
                    .nick("Maximum index span")
                    .blurb("Time (in ns) covered by the index before the oldest entries are evicted, 0 = unlimited")
                    .default_value(DEFAULT_MAX_SPAN.nseconds())
                    .mutable_playing()
                    .build(),
                glib::ParamSpecUInt::builder("max-index-entries")
                    .nick("Maximum index entries")
                    .blurb("Number of entries kept before the oldest are evicted, 0 = unlimited")
                    .default_value(DEFAULT_MAX_ENTRIES as u32)
                    .mutable_playing()
                    .build(),
                glib::ParamSpecUInt64::builder("pcr-discontinuity-threshold")
                    .nick("PCR discontinuity threshold")
                    .blurb("Largest PCR step (in ns) accepted without a discontinuity flag, 0 = any")
                    .default_value(DEFAULT_PCR_DISCONTINUITY_THRESHOLD.nseconds())
                    .mutable_playing()
                    .build(),
                glib::ParamSpecInt::builder("pcr-pid")
                    .nick("PCR PID")
                    .blurb("PID carrying the reference PCR, -1 = first PID seen with a PCR")
                    .minimum(-1)
                    .maximum(MAX_PID)
                    .default_value(DEFAULT_PCR_PID)
                    .mutable_playing()
                    .build(),
                glib::ParamSpecBoxed::builder::<gst::Structure>("stats")
                    .nick("Statistics")
                    .blurb("Index statistics")
                    .read_only()
                    .build(),
            ]
        });

        PROPERTIES.as_ref()
    }

    fn signals() -> &'static [Signal] {
        static SIGNALS: Lazy<Vec<Signal>> = Lazy::new(|| {
            vec![
                /*
                 * Resolves a PCR time (in ns) to the byte offset of the latest
                 * indexed packet at or before it, -1 if no longer available.
                 */
                Signal::builder("lookup")
                    .param_types([u64::static_type()])
                    .return_type::<i64>()
                    .action()
                    .class_handler(|_, args| {
                        let element = args[0]
                            .get::<super::TimeShiftTsIndexer>()
                            .expect("signal arg");
                        let time = args[1].get::<u64>().expect("signal arg");
                        let position = element.imp().lookup(ClockTime::from_nseconds(time));

                        Some(
                            position
                                .and_then(|position| i64::try_from(position).ok())
                                .unwrap_or(-1)
                                .to_value(),
                        )
                    })
                    .build(),
                Signal::builder("reset")
                    .action()
                    .class_handler(|_, args| {
                        let element = args[0]
                            .get::<super::TimeShiftTsIndexer>()
                            .expect("signal arg");
                        element.imp().reset_index();

                        None
                    })
                    .build(),
            ]
        });

        SIGNALS.as_ref()
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        let mut props = self.props.lock().unwrap();

        match pspec.name() {
            "sampling-interval" => {
                let interval = ClockTime::from_nseconds(value.get().expect("type checked upstream"));
                info!(
                    CAT,
                    imp: self,
                    "Changing sampling-interval from {} to {}",
                    props.sampling_interval,
                    interval
                );
                props.sampling_interval = interval;
            }
            "max-index-span" => {
                let span = ClockTime::from_nseconds(value.get().expect("type checked upstream"));
                info!(
                    CAT,
                    imp: self,
                    "Changing max-index-span from {} to {}",
                    props.max_index_span,
                    span
                );
                props.max_index_span = span;
            }
            "max-index-entries" => {
                let entries = value.get().expect("type checked upstream");
                info!(
                    CAT,
                    imp: self,
                    "Changing max-index-entries from {} to {}",
                    props.max_index_entries,
                    entries
                );
                props.max_index_entries = entries;
            }
            "pcr-discontinuity-threshold" => {
                let threshold = ClockTime::from_nseconds(value.get().expect("type checked upstream"));
                info!(
                    CAT,
                    imp: self,
                    "Changing pcr-discontinuity-threshold from {} to {}",
                    props.pcr_discontinuity_threshold,
                    threshold
                );
                props.pcr_discontinuity_threshold = threshold;
            }
            "pcr-pid" => {
                let pid = value.get().expect("type checked upstream");
                info!(
                    CAT,
                    imp: self,
                    "Changing pcr-pid from {} to {}",
                    props.pcr_pid,
                    pid
                );
                props.pcr_pid = pid;
            }
            _ => unimplemented!(),
        }

        self.update_config(&props);
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        match pspec.name() {
            "sampling-interval" => {
                let props = self.props.lock().unwrap();
                props.sampling_interval.nseconds().to_value()
            }
            "max-index-span" => {
                let props = self.props.lock().unwrap();
                props.max_index_span.nseconds().to_value()
            }
            "max-index-entries" => {
                let props = self.props.lock().unwrap();
                props.max_index_entries.to_value()
            }
            "pcr-discontinuity-threshold" => {
                let props = self.props.lock().unwrap();
                props.pcr_discontinuity_threshold.nseconds().to_value()
            }
            "pcr-pid" => {
                let props = self.props.lock().unwrap();
                props.pcr_pid.to_value()
            }
            "stats" => self.stats().to_value(),
            _ => unimplemented!(),
        }
    }
}

impl GstObjectImpl for TimeShiftTsIndexer {}

impl ElementImpl for TimeShiftTsIndexer {
    fn metadata() -> Option<&'static ElementMetadata> {
        static ELEMENT_METADATA: Lazy<ElementMetadata> = Lazy::new(|| {
            ElementMetadata::new(
                "MPEG-TS time-shift indexer",
                "Filter/Analyzer/Video",
                "Index PCR timestamps to stream offsets for time-shift playback",
                "gst-plugin-timeshift contributors",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [PadTemplate] {
        static PAD_TEMPLATES: Lazy<Vec<PadTemplate>> = Lazy::new(|| {
            let caps = gst::Caps::builder("video/mpegts")
                .field("systemstream", true)
                .build();

            let src_pad_template =
                PadTemplate::new("src", PadDirection::Src, PadPresence::Always, &caps).unwrap();

            let sink_pad_template =
                PadTemplate::new("sink", PadDirection::Sink, PadPresence::Always, &caps).unwrap();

            vec![src_pad_template, sink_pad_template]
        });

        PAD_TEMPLATES.as_ref()
    }
}

impl BaseTransformImpl for TimeShiftTsIndexer {
    const MODE: BaseTransformMode = BaseTransformMode::AlwaysInPlace;
    const PASSTHROUGH_ON_SAME_CAPS: bool = true;
    const TRANSFORM_IP_ON_PASSTHROUGH: bool = true;

    fn start(&self) -> Result<(), gst::ErrorMessage> {
        *self.state.lock().unwrap() = Some(State {
            framer: Framer::default(),
        });
        self.indexer.start();
        info!(CAT, imp: self, "Started");

        Ok(())
    }

    fn stop(&self) -> Result<(), gst::ErrorMessage> {
        self.indexer.stop();
        let _ = self.state.lock().unwrap().take();
        info!(CAT, imp: self, "Stopped");

        Ok(())
    }

    fn set_caps(&self, incaps: &gst::Caps, _outcaps: &gst::Caps) -> Result<(), gst::LoggableError> {
        let size = packet_size_from_caps(incaps)?;
        debug!(CAT, imp: self, "Using {} byte packets", size.bytes());

        if let Some(state) = self.state.lock().unwrap().as_mut() {
            state.framer.set_packet_size(size);
        }

        Ok(())
    }

    fn sink_event(&self, event: gst::Event) -> bool {
        use gst::EventView;

        match event.view() {
            EventView::FlushStop(_) | EventView::StreamStart(_) => self.reset_index(),
            _ => (),
        }

        self.parent_sink_event(event)
    }

    fn query(&self, direction: PadDirection, query: &mut gst::QueryRef) -> bool {
        if direction == PadDirection::Src {
            if let gst::QueryViewMut::Convert(q) = query.view_mut() {
                let (src_val, dest_fmt) = q.get();

                if let (gst::GenericFormattedValue::Time(Some(time)), gst::Format::Bytes) =
                    (src_val, dest_fmt)
                {
                    if let Some(position) = self.convert_stream_time(time) {
                        q.set(time, gst::format::Bytes::from_u64(position));
                        return true;
                    }
                }
            }
        }

        BaseTransformImplExt::parent_query(self, direction, query)
    }

    fn transform_ip(&self, buf: &mut BufferRef) -> Result<FlowSuccess, FlowError> {
        self.index_buffer(buf);
        Ok(FlowSuccess::Ok)
    }

    fn transform_ip_passthrough(&self, buf: &gst::Buffer) -> Result<FlowSuccess, FlowError> {
        self.index_buffer(buf);
        Ok(FlowSuccess::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn caps(s: &str) -> gst::Caps {
        gst::init().unwrap();
        gst::Caps::from_str(s).unwrap()
    }

    #[test]
    fn packet_size_negotiation() {
        assert_eq!(
            packet_size_from_caps(&caps("video/mpegts,systemstream=true")).unwrap(),
            PacketSize::Ts
        );
        assert_eq!(
            packet_size_from_caps(&caps("video/mpegts,systemstream=true,packetsize=192")).unwrap(),
            PacketSize::M2ts
        );
        assert_eq!(
            packet_size_from_caps(&caps("video/mpegts,packetsize=204")).unwrap(),
            PacketSize::Dvb
        );
        assert!(packet_size_from_caps(&caps("video/mpegts,packetsize=100")).is_err());
        assert!(packet_size_from_caps(&caps("video/mpegts,packetsize=(string)big")).is_err());
    }

    #[test]
    fn properties_map_to_config() {
        let props = Properties {
            pcr_pid: 0x100,
            max_index_entries: 0,
            ..Default::default()
        };
        let config = props.config();

        assert_eq!(config.pcr_pid, Some(0x100));
        assert_eq!(config.max_entries, 0);
        assert_eq!(Properties::default().config().pcr_pid, None);
        assert_eq!(
            Properties::default().config().sampling_interval,
            ClockTime::from_mseconds(100)
        );
    }
}
