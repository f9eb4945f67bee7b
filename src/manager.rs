use std::sync::Arc;

use kvm_bus::capture::CaptureSource;
use kvm_bus::context::MediaContext;
use kvm_bus::encoder::{EncoderSettings, FrameEncoder};
use kvm_bus::pipeline::FailureHandler;
use kvm_bus::registry::ConcurrentMap;
use kvm_bus::sample::SampleSender;

/// Running encoder profiles fed from one capture source, keyed by profile name.
pub struct EncoderManager {
    ctx: Arc<MediaContext>,
    capture: Arc<CaptureSource>,
    output: SampleSender,
    encoders: ConcurrentMap<String, Arc<FrameEncoder>>,
    on_failure: Option<FailureHandler>,
}

impl EncoderManager {
    pub fn new(ctx: &Arc<MediaContext>, capture: Arc<CaptureSource>, output: SampleSender) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            capture,
            output,
            encoders: ConcurrentMap::new(),
            on_failure: None,
        }
    }

    /// Installed on every encoder added afterwards.
    pub fn with_failure_handler(mut self, handler: FailureHandler) -> Self {
        self.on_failure = Some(handler);
        self
    }

    pub fn capture(&self) -> &Arc<CaptureSource> {
        &self.capture
    }

    pub fn profiles(&self) -> Vec<String> {
        let mut names = self.encoders.keys();
        names.sort();
        names
    }

    /// Build, start and register an encoder for `settings`.
    pub async fn add_profile(&self, settings: EncoderSettings) -> anyhow::Result<Arc<FrameEncoder>> {
        let name = settings.name.clone();
        if self.encoders.contains_key(&name) {
            return Err(anyhow::anyhow!("profile {} already exists", name));
        }

        let encoder = FrameEncoder::new(
            &self.ctx,
            settings,
            self.capture.capture_settings(),
            self.output.clone(),
        )?;
        if let Some(handler) = self.on_failure.as_ref() {
            encoder.set_failure_handler(Arc::clone(handler));
        }

        let (_, existed) = self.encoders.get_or_insert(name.clone(), Arc::clone(&encoder));
        if existed {
            encoder.stop().await;
            return Err(anyhow::anyhow!("profile {} already exists", name));
        }

        if let Err(e) = encoder.start().await {
            self.encoders.remove(&name);
            encoder.stop().await;
            return Err(e.context(format!("failed to start profile {}", name)));
        }
        self.capture.add_encoder(encoder.clone());
        log::info!("profile {} added, total {}", name, self.encoders.len());
        Ok(encoder)
    }

    /// Deregister and stop a profile. Returns false if it was not running.
    pub async fn remove_profile(&self, name: &str) -> bool {
        let Some(encoder) = self.encoders.remove(&name.to_string()) else {
            return false;
        };
        let as_dyn: Arc<dyn kvm_bus::encoder::Encoder> = encoder.clone();
        self.capture.remove_encoder(&as_dyn);
        encoder.stop().await;
        log::info!("profile {} removed, total {}", name, self.encoders.len());
        true
    }

    /// Ask every profile for a keyframe, e.g. when a new viewer joins.
    pub async fn request_keyframes(&self) {
        let requests = self.encoders.values().into_iter().map(|encoder| async move {
            if let Err(e) = encoder.request_keyframe().await {
                log::warn!("keyframe request for {} failed: {:#}", encoder.name(), e);
            }
        });
        futures::future::join_all(requests).await;
    }

    pub async fn stop_all(&self) {
        for name in self.profiles() {
            self.remove_profile(&name).await;
        }
    }
}
