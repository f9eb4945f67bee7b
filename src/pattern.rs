//! Synthetic capture input for running without hardware.

use std::sync::Arc;
use std::time::Duration;

use kvm_bus::buffer::Buffer;
use kvm_bus::capture::CaptureSettings;
use kvm_bus::sim::SimGraph;
use tokio_util::sync::CancellationToken;

/// Audio chunk length
const AUDIO_PERIOD: Duration = Duration::from_millis(20);

/// Presentation time of frame `index`, saturating instead of wrapping.
fn frame_pts(period: Duration, index: u64) -> Duration {
    let nanos = period.as_nanos().saturating_mul(index as u128);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

fn frame_layout(settings: &CaptureSettings) -> (usize, Duration) {
    match settings {
        CaptureSettings::Video(v) => {
            // NV12: full-size luma plane plus half-size interleaved chroma
            let size = v.width as usize * v.height as usize * 3 / 2;
            (size, Duration::from_secs(1) / v.framerate.max(1))
        }
        CaptureSettings::Audio(a) => {
            let bytes_per_sample = if a.format.starts_with("S16") { 2 } else { 4 };
            let samples = a.sample_rate as u128 * AUDIO_PERIOD.as_millis() / 1000;
            let size = samples as usize * a.channels as usize * bytes_per_sample;
            (size, AUDIO_PERIOD)
        }
    }
}

/// Emit a moving test pattern into `graph` at the capture rate until cancelled
/// or the graph stops accepting frames.
pub fn spawn(graph: Arc<SimGraph>, settings: CaptureSettings, cancel: CancellationToken) {
    let (size, period) = frame_layout(&settings);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let mut index: u64 = 0;
        let mut accepted = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let fill = (index % 256) as u8;
            let frame = Buffer::builder(vec![fill; size])
                .pts(frame_pts(period, index))
                .duration(period)
                .build();
            index += 1;

            if graph.emit(frame) {
                accepted = true;
            } else if accepted {
                // graph went back to null
                break;
            }
        }
        log::debug!("test pattern for {} stopped after {} frames", settings.device(), index);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bus::capture::{
        AudioCaptureMode, AudioCaptureSettings, VideoCaptureMode, VideoCaptureSettings,
    };

    #[test]
    fn test_frame_layout() {
        let video = CaptureSettings::Video(VideoCaptureSettings {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            framerate: 25,
            mode: VideoCaptureMode::XRaw,
        });
        assert_eq!(frame_layout(&video), (460_800, Duration::from_millis(40)));

        let audio = CaptureSettings::Audio(AudioCaptureSettings {
            device: "hw:0".to_string(),
            sample_rate: 48000,
            channels: 2,
            format: "S16LE".to_string(),
            mode: AudioCaptureMode::XRaw,
        });
        assert_eq!(frame_layout(&audio), (3840, AUDIO_PERIOD));

        let huge = CaptureSettings::Video(VideoCaptureSettings {
            device: "/dev/video0".to_string(),
            width: 65536,
            height: 65536,
            framerate: 30,
            mode: VideoCaptureMode::XRaw,
        });
        assert_eq!(frame_layout(&huge).0, 65536usize * 65536 * 3 / 2);
    }

    #[test]
    fn test_frame_pts_past_u32_index() {
        let period = Duration::from_millis(40);
        let index = u32::MAX as u64 + 2;
        assert_eq!(frame_pts(period, index), Duration::from_millis(40 * index));
        assert_eq!(frame_pts(period, u64::MAX), Duration::from_nanos(u64::MAX));
    }
}
