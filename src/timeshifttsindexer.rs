mod imp;

use gst::prelude::*;

glib::wrapper! {
    pub struct TimeShiftTsIndexer(ObjectSubclass<imp::TimeShiftTsIndexer>) @extends gst_base::BaseTransform, gst::Element, gst::Object;
}

pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "timeshifttsindexer",
        gst::Rank::NONE,
        TimeShiftTsIndexer::static_type(),
    )
}
