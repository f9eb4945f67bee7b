/// Initialise the native backend. Call once at startup before building graphs;
/// a no-op when only the simulated backend is compiled in.
pub fn init() -> anyhow::Result<()> {
    #[cfg(feature = "gstreamer")]
    gst::init()?;
    Ok(())
}

pub mod buffer;
pub mod capture;
pub mod context;
pub mod encoder;
pub mod error;
pub mod graph;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod pipeline;
pub mod registry;
pub mod sample;
pub mod sim;
