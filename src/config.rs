use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use kvm_bus::capture::{
    AudioCaptureMode, AudioCaptureSettings, CaptureSettings, VideoCaptureMode,
    VideoCaptureSettings,
};
use kvm_bus::context::Timeouts;
use kvm_bus::encoder::{Codec, EncoderSettings};
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "MINI_KVM_CONFIG";

/// One capture device and the encoder profiles fed from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    pub capture: CaptureSettings,
    #[serde(default)]
    pub profiles: Vec<EncoderSettings>,
}

impl MediaConfig {
    fn default_video() -> Self {
        let options = [
            ("rc-mode", "vbr"),
            ("max-pending", "4"),
            ("header-mode", "each-idr"),
            ("gop", "60"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<BTreeMap<_, _>>();

        Self {
            capture: CaptureSettings::Video(VideoCaptureSettings {
                device: "/dev/video0".to_string(),
                width: 1920,
                height: 1080,
                framerate: 30,
                mode: VideoCaptureMode::Mjpeg,
            }),
            profiles: vec![EncoderSettings {
                options,
                ..EncoderSettings::new("out", Codec::HevcMpp, 2_000_000, 30)
            }],
        }
    }

    fn default_audio() -> Self {
        Self {
            capture: CaptureSettings::Audio(AudioCaptureSettings {
                device: "hw:0".to_string(),
                sample_rate: 48000,
                channels: 2,
                format: "S16LE".to_string(),
                mode: AudioCaptureMode::XRaw,
            }),
            profiles: vec![EncoderSettings::new("audio", Codec::Opus, 64_000, 0)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub poll_interval_ms: u64,
    pub stop_ms: u64,
    pub encoder_stop_ms: u64,
    pub startup_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let t = Timeouts::default();
        Self {
            poll_interval_ms: t.poll_interval.as_millis() as u64,
            stop_ms: t.stop.as_millis() as u64,
            encoder_stop_ms: t.encoder_stop.as_millis() as u64,
            startup_ms: t.startup.as_millis() as u64,
        }
    }
}

impl From<TimeoutConfig> for Timeouts {
    fn from(c: TimeoutConfig) -> Self {
        Timeouts {
            poll_interval: Duration::from_millis(c.poll_interval_ms),
            stop: Duration::from_millis(c.stop_ms),
            encoder_stop: Duration::from_millis(c.encoder_stop_ms),
            startup: Duration::from_millis(c.startup_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvmConfig {
    pub video: MediaConfig,
    pub audio_enabled: bool,
    pub audio: MediaConfig,
    /// Capacity of the shared encoded-sample queue
    pub output_queue: usize,
    pub timeouts: TimeoutConfig,
}

impl Default for KvmConfig {
    fn default() -> Self {
        Self {
            video: MediaConfig::default_video(),
            audio_enabled: false,
            audio: MediaConfig::default_audio(),
            output_queue: 100,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl KvmConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: KvmConfig = serde_json::from_str(json)?;
        if config.output_queue == 0 {
            anyhow::bail!("output_queue must be positive");
        }
        if config.timeouts.poll_interval_ms == 0 {
            anyhow::bail!("timeouts.poll_interval_ms must be positive");
        }
        Ok(config)
    }

    /// Capture sources to open, video first.
    pub fn media(&self) -> Vec<&MediaConfig> {
        let mut media = vec![&self.video];
        if self.audio_enabled {
            media.push(&self.audio);
        }
        media
    }
}

/// Read the file named by `MINI_KVM_CONFIG`, or use the built-in defaults.
pub fn load() -> anyhow::Result<KvmConfig> {
    let Ok(path) = std::env::var(CONFIG_ENV) else {
        log::info!("{} not set, using default config", CONFIG_ENV);
        return Ok(KvmConfig::default());
    };
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path))?;
    KvmConfig::from_json(&json).with_context(|| format!("invalid config {}", path))
}
