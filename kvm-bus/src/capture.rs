use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    buffer::Buffer,
    context::MediaContext,
    encoder::Encoder,
    error::PipelineError,
    pipeline::{EosHandler, FailureHandler, PipelineController, PipelineOptions, PipelineState},
    sample::MediaType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCaptureMode {
    /// Device delivers JPEG frames, decoded in hardware to NV12
    Mjpeg,
    /// Device delivers raw frames, converted to NV12
    XRaw,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCaptureMode {
    XRaw,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCaptureSettings {
    /// e.g. /dev/video0
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub mode: VideoCaptureMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioCaptureSettings {
    /// ALSA device, e.g. hw:0
    pub device: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// "S16LE", "F32LE", etc.
    pub format: String,
    pub mode: AudioCaptureMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureSettings {
    Video(VideoCaptureSettings),
    Audio(AudioCaptureSettings),
}

impl CaptureSettings {
    pub fn media_type(&self) -> MediaType {
        match self {
            CaptureSettings::Video(_) => MediaType::Video,
            CaptureSettings::Audio(_) => MediaType::Audio,
        }
    }

    pub fn device(&self) -> &str {
        match self {
            CaptureSettings::Video(v) => &v.device,
            CaptureSettings::Audio(a) => &a.device,
        }
    }

    /// Graph description ending in an `appsink` named "appsink".
    pub fn describe(&self) -> Result<String, PipelineError> {
        if self.device().is_empty() {
            return Err(PipelineError::InvalidSettings(
                "capture device is empty".to_string(),
            ));
        }

        match self {
            CaptureSettings::Video(v) => {
                if v.width == 0 || v.height == 0 || v.framerate == 0 {
                    return Err(PipelineError::InvalidSettings(format!(
                        "invalid video format {}x{}@{}",
                        v.width, v.height, v.framerate
                    )));
                }
                match v.mode {
                    VideoCaptureMode::Mjpeg => Ok(format!(
                        "v4l2src device={} ! image/jpeg, width={}, height={}, framerate={}/1 ! jpegparse ! mppjpegdec ! video/x-raw, format=NV12 ! appsink name=appsink",
                        v.device, v.width, v.height, v.framerate
                    )),
                    VideoCaptureMode::XRaw => Ok(format!(
                        "v4l2src device={} ! video/x-raw, width={}, height={}, framerate={}/1 ! videoconvert ! video/x-raw, format=NV12 ! appsink name=appsink",
                        v.device, v.width, v.height, v.framerate
                    )),
                    VideoCaptureMode::Unknown => Err(PipelineError::UnsupportedCaptureMode(
                        format!("{:?}", v.mode),
                    )),
                }
            }
            CaptureSettings::Audio(a) => {
                if a.sample_rate == 0 || a.channels == 0 || a.format.is_empty() {
                    return Err(PipelineError::InvalidSettings(format!(
                        "invalid audio format rate={} channels={} format={:?}",
                        a.sample_rate, a.channels, a.format
                    )));
                }
                match a.mode {
                    AudioCaptureMode::XRaw => Ok(format!(
                        "alsasrc device={} ! audio/x-raw, rate={}, format={}, layout=interleaved, channels={} ! audioconvert ! appsink name=appsink",
                        a.device, a.sample_rate, a.format, a.channels
                    )),
                    AudioCaptureMode::Unknown => Err(PipelineError::UnsupportedCaptureMode(
                        format!("{:?}", a.mode),
                    )),
                }
            }
        }
    }
}

/// Capture graph (v4l2 or alsa) whose raw frames fan out to registered encoders.
pub struct CaptureSource {
    settings: CaptureSettings,
    pipeline: Arc<PipelineController>,
}

impl CaptureSource {
    pub fn new(ctx: &Arc<MediaContext>, settings: CaptureSettings) -> anyhow::Result<Self> {
        Self::build(ctx, settings, PipelineOptions::new())
    }

    /// Like `new`, with a callback for when the device ends the stream on its own.
    pub fn with_eos_handler(
        ctx: &Arc<MediaContext>,
        settings: CaptureSettings,
        on_eos: EosHandler,
    ) -> anyhow::Result<Self> {
        Self::build(ctx, settings, PipelineOptions::new().with_eos_handler(on_eos))
    }

    fn build(
        ctx: &Arc<MediaContext>,
        settings: CaptureSettings,
        options: PipelineOptions,
    ) -> anyhow::Result<Self> {
        let kind = match settings {
            CaptureSettings::Video(_) => "v4l2",
            CaptureSettings::Audio(_) => "alsa",
        };
        // checked before the backend allocates anything
        let description = settings.describe()?;
        let graph = ctx.backend().parse_launch(&description).map_err(|e| {
            anyhow::anyhow!("failed to create {} capturer {}: {:#}", kind, settings.device(), e)
        })?;

        let label = format!("{} {}", kind, settings.device());
        let pipeline = PipelineController::new(
            ctx,
            graph,
            &label,
            settings.media_type(),
            options.with_output_stage("appsink"),
        )?;
        log::debug!("{} graph: {}", pipeline.prefix(), description);

        Ok(Self { settings, pipeline })
    }

    pub fn capture_settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn media_type(&self) -> MediaType {
        self.settings.media_type()
    }

    pub fn pipeline(&self) -> &Arc<PipelineController> {
        &self.pipeline
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }

    pub fn start(&self) -> anyhow::Result<()> {
        self.pipeline.start()
    }

    pub async fn stop(&self) {
        self.pipeline.stop().await
    }

    pub fn add_encoder(&self, encoder: Arc<dyn Encoder>) -> bool {
        self.pipeline.add_encoder(encoder)
    }

    pub fn remove_encoder(&self, encoder: &Arc<dyn Encoder>) -> bool {
        self.pipeline.remove_encoder(encoder)
    }

    pub fn set_failure_handler(&self, handler: FailureHandler) {
        self.pipeline.set_failure_handler(handler)
    }

    /// Fan a unit out as if the graph had produced it.
    pub fn send_buffer(&self, buffer: &Buffer) -> usize {
        self.pipeline.send_buffer(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;

    fn video_settings(mode: VideoCaptureMode) -> CaptureSettings {
        CaptureSettings::Video(VideoCaptureSettings {
            device: "/dev/video0".to_string(),
            width: 1920,
            height: 1080,
            framerate: 30,
            mode,
        })
    }

    #[test]
    fn test_mjpeg_description() {
        let desc = video_settings(VideoCaptureMode::Mjpeg).describe().unwrap();
        assert_eq!(
            desc,
            "v4l2src device=/dev/video0 ! image/jpeg, width=1920, height=1080, framerate=30/1 ! jpegparse ! mppjpegdec ! video/x-raw, format=NV12 ! appsink name=appsink"
        );
    }

    #[test]
    fn test_audio_description() {
        let settings = CaptureSettings::Audio(AudioCaptureSettings {
            device: "hw:0".to_string(),
            sample_rate: 48000,
            channels: 2,
            format: "S16LE".to_string(),
            mode: AudioCaptureMode::XRaw,
        });
        assert_eq!(
            settings.describe().unwrap(),
            "alsasrc device=hw:0 ! audio/x-raw, rate=48000, format=S16LE, layout=interleaved, channels=2 ! audioconvert ! appsink name=appsink"
        );
        assert_eq!(settings.media_type(), MediaType::Audio);
    }

    #[test]
    fn test_unknown_mode_fails_before_allocating() {
        let backend = SimBackend::new();
        let ctx = Arc::new(MediaContext::new(backend.clone()));
        let err = CaptureSource::new(&ctx, video_settings(VideoCaptureMode::Unknown))
            .err()
            .unwrap();
        assert!(matches!(
            crate::error::kind(&err),
            Some(PipelineError::UnsupportedCaptureMode(_))
        ));
        assert!(backend.graphs().is_empty());
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut settings = video_settings(VideoCaptureMode::XRaw);
        if let CaptureSettings::Video(v) = &mut settings {
            v.height = 0;
        }
        let err = settings.describe().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_settings_retrievable() {
        let backend = SimBackend::new();
        let ctx = Arc::new(MediaContext::new(backend.clone()));
        let settings = video_settings(VideoCaptureMode::Mjpeg);
        let source = CaptureSource::new(&ctx, settings.clone()).unwrap();
        assert_eq!(source.capture_settings(), &settings);
        assert_eq!(source.media_type(), MediaType::Video);
        assert_eq!(source.state(), PipelineState::Created);
        assert_eq!(backend.graphs().len(), 1);
    }

    #[test]
    fn test_settings_from_json() {
        let settings: CaptureSettings = serde_json::from_str(
            r#"{"kind":"video","device":"/dev/video2","width":1280,"height":720,"framerate":60,"mode":"mjpeg"}"#,
        )
        .unwrap();
        assert_eq!(settings.device(), "/dev/video2");

        let unknown: CaptureSettings = serde_json::from_str(
            r#"{"kind":"video","device":"/dev/video2","width":1280,"height":720,"framerate":60,"mode":"h264"}"#,
        )
        .unwrap();
        assert!(matches!(
            unknown.describe(),
            Err(PipelineError::UnsupportedCaptureMode(_))
        ));
    }
}
