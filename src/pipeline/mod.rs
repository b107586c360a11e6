use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use crate::settings::{CodecKind, OutputKind, Settings, TransformKind};
use crate::timebase::TimeBase;

pub mod supervisor;

/// Process exit status of a pipeline session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean drain: end-of-stream reached, trailers written
    Success,
    /// Rejected before any resource was created
    ConfigError,
    /// A codec/device/output could not be opened
    InitError,
    /// I/O failed beyond retry while streaming
    RuntimeError,
    /// Cancelled externally
    Cancelled,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::ConfigError => 2,
            ExitStatus::InitError => 3,
            ExitStatus::RuntimeError => 4,
            ExitStatus::Cancelled => 5,
        }
    }
}

/// Frozen, validated session configuration handed to the stages.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub id: Uuid,
    pub main_input: String,
    pub backup_input: Option<String>,
    pub io_timeout: Duration,
    pub failover_grace: Duration,
    pub transform: TransformConfig,
    pub renditions: Vec<RenditionConfig>,
    pub use_gpu: bool,
    /// Session frame rate; GOP length is its integer value
    pub framerate: TimeBase,
    pub quality: QualityConfig,
    pub outputs: Vec<OutputConfig>,
}

#[derive(Debug, Clone)]
pub enum TransformConfig {
    None,
    Composite(CompositeConfig),
    Segmentation(SegmentationConfig),
}

#[derive(Debug, Clone)]
pub struct CompositeConfig {
    pub canvas_w: i32,
    pub canvas_h: i32,
    pub main_index: usize,
    pub framerate: TimeBase,
}

#[derive(Debug, Clone)]
pub struct SegmentationConfig {
    pub model_path: Option<PathBuf>,
    pub in_w: usize,
    pub in_h: usize,
    pub threshold: f32,
    pub alpha: f32,
    pub threads: usize,
}

#[derive(Debug, Clone)]
pub struct RenditionConfig {
    pub id: Uuid,
    pub index: usize,
    pub width: i32,
    pub height: i32,
    pub bitrate: i64,
    pub preset: String,
    pub codec: CodecKind,
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub enabled: bool,
    pub cadence: Duration,
    pub window: usize,
    pub pass_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub url: String,
    pub kind: OutputKind,
}

impl PipelineConfig {
    /// Freeze a validated [Settings] into the runtime configuration.
    pub fn from_settings(s: &Settings) -> Result<Self> {
        s.validate()?;
        let transform = match s.transform.kind {
            TransformKind::None => TransformConfig::None,
            TransformKind::Composite => {
                let c = &s.transform.composite;
                TransformConfig::Composite(CompositeConfig {
                    canvas_w: c.canvas_w as i32,
                    canvas_h: c.canvas_h as i32,
                    main_index: c.main_index,
                    framerate: c.framerate.parse()?,
                })
            }
            TransformKind::Segmentation => {
                let g = &s.transform.segmentation;
                TransformConfig::Segmentation(SegmentationConfig {
                    model_path: if g.model_path.is_empty() {
                        None
                    } else {
                        Some(PathBuf::from(&g.model_path))
                    },
                    in_w: g.in_w as usize,
                    in_h: g.in_h as usize,
                    threshold: g.threshold,
                    alpha: g.alpha,
                    threads: g.threads,
                })
            }
        };
        Ok(Self {
            id: Uuid::new_v4(),
            main_input: s.main_input.clone(),
            backup_input: s.backup_input.clone(),
            io_timeout: Duration::from_micros(s.io_timeout_us.max(0) as u64),
            failover_grace: Duration::from_millis(s.failover_grace_ms),
            transform,
            renditions: s
                .encoders
                .iter()
                .enumerate()
                .map(|(index, e)| RenditionConfig {
                    id: Uuid::new_v4(),
                    index,
                    width: e.width as i32,
                    height: e.height as i32,
                    bitrate: e.bitrate as i64,
                    preset: e.preset.clone(),
                    codec: e.codec,
                })
                .collect(),
            use_gpu: s.encoder.use_gpu,
            framerate: s.encoder.framerate.parse()?,
            quality: QualityConfig {
                enabled: s.quality.enabled,
                cadence: Duration::from_millis(s.quality.cadence_ms),
                window: s.quality.window.max(1),
                pass_threshold: s.quality.pass_threshold,
            },
            outputs: s
                .outputs
                .iter()
                .map(|o| OutputConfig {
                    url: o.url.clone(),
                    kind: o.kind,
                })
                .collect(),
        })
    }
}

/// Records the first fatal stream error raised by any stage, so the
/// supervisor can report a runtime failure after the threads join.
#[derive(Default)]
pub struct FaultSlot {
    first: Mutex<Option<String>>,
}

impl FaultSlot {
    pub fn raise(&self, msg: impl Into<String>) {
        let mut slot = self.first.lock().expect("fault lock poisoned");
        if slot.is_none() {
            *slot = Some(msg.into());
        }
    }

    pub fn get(&self) -> Option<String> {
        self.first.lock().expect("fault lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{EncoderCommonSettings, OutputSettings, RenditionSettings};

    fn base_settings() -> Settings {
        Settings {
            main_input: "clip.mp4".into(),
            backup_input: None,
            io_timeout_us: 1_500_000,
            failover_grace_ms: 5_000,
            transform: Default::default(),
            encoders: vec![RenditionSettings {
                width: 1920,
                height: 1080,
                bitrate: 20_000_000,
                preset: "fast".into(),
                codec: CodecKind::H265,
            }],
            encoder: EncoderCommonSettings {
                use_gpu: false,
                framerate: "30/1".into(),
            },
            quality: Default::default(),
            outputs: vec![OutputSettings {
                url: "out.ts".into(),
                kind: OutputKind::File,
            }],
        }
    }

    #[test]
    fn freezes_valid_settings() {
        let cfg = PipelineConfig::from_settings(&base_settings()).unwrap();
        assert_eq!(cfg.renditions.len(), 1);
        assert_eq!(cfg.renditions[0].index, 0);
        assert_eq!(cfg.framerate, TimeBase::new(30, 1));
        assert_eq!(cfg.io_timeout, Duration::from_micros(1_500_000));
        assert!(matches!(cfg.transform, TransformConfig::None));
    }

    #[test]
    fn rejects_invalid_settings() {
        let mut s = base_settings();
        s.encoders.clear();
        assert!(PipelineConfig::from_settings(&s).is_err());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::ConfigError.code(), 2);
        assert_eq!(ExitStatus::InitError.code(), 3);
        assert_eq!(ExitStatus::RuntimeError.code(), 4);
        assert_eq!(ExitStatus::Cancelled.code(), 5);
    }

    #[test]
    fn fault_slot_keeps_first() {
        let f = FaultSlot::default();
        assert!(f.get().is_none());
        f.raise("first");
        f.raise("second");
        assert_eq!(f.get().as_deref(), Some("first"));
    }
}
