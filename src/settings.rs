use anyhow::{bail, Context, Result};
use config::Config;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::timebase::TimeBase;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// URL or path of the primary source
    pub main_input: String,

    /// Optional failover source
    #[serde(default)]
    pub backup_input: Option<String>,

    /// Interrupt threshold for blocking I/O, microseconds
    #[serde(default = "default_io_timeout_us")]
    pub io_timeout_us: i64,

    /// How long to keep retrying sources after the last successful read
    #[serde(default = "default_failover_grace_ms")]
    pub failover_grace_ms: u64,

    #[serde(default)]
    pub transform: TransformSettings,

    /// Output renditions, one encoder each
    pub encoders: Vec<RenditionSettings>,

    #[serde(default)]
    pub encoder: EncoderCommonSettings,

    #[serde(default)]
    pub quality: QualitySettings,

    /// One output per rendition, same order
    pub outputs: Vec<OutputSettings>,
}

fn default_io_timeout_us() -> i64 {
    1_500_000
}

fn default_failover_grace_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    #[default]
    None,
    Composite,
    Segmentation,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransformSettings {
    #[serde(default)]
    pub kind: TransformKind,
    #[serde(default)]
    pub composite: CompositeSettings,
    #[serde(default)]
    pub segmentation: SegmentationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeSettings {
    #[serde(default = "default_canvas_w")]
    pub canvas_w: u32,
    #[serde(default = "default_canvas_h")]
    pub canvas_h: u32,
    /// Which input slot fills the main region (0..=3)
    #[serde(default)]
    pub main_index: usize,
    #[serde(default = "default_composite_framerate")]
    pub framerate: String,
}

fn default_canvas_w() -> u32 {
    3840
}

fn default_canvas_h() -> u32 {
    2160
}

fn default_composite_framerate() -> String {
    "60/1".to_string()
}

impl Default for CompositeSettings {
    fn default() -> Self {
        Self {
            canvas_w: default_canvas_w(),
            canvas_h: default_canvas_h(),
            main_index: 0,
            framerate: default_composite_framerate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationSettings {
    /// Path to the model; empty means heuristic mask only
    #[serde(default)]
    pub model_path: String,
    #[serde(default = "default_seg_dim")]
    pub in_w: u32,
    #[serde(default = "default_seg_dim")]
    pub in_h: u32,
    /// Mask threshold in [0,1]
    #[serde(default = "default_seg_threshold")]
    pub threshold: f32,
    /// Overlay opacity in [0,1]
    #[serde(default = "default_seg_alpha")]
    pub alpha: f32,
    #[serde(default = "default_seg_threads")]
    pub threads: usize,
}

fn default_seg_dim() -> u32 {
    192
}

fn default_seg_threshold() -> f32 {
    0.5
}

fn default_seg_alpha() -> f32 {
    0.35
}

fn default_seg_threads() -> usize {
    1
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            in_w: default_seg_dim(),
            in_h: default_seg_dim(),
            threshold: default_seg_threshold(),
            alpha: default_seg_alpha(),
            threads: default_seg_threads(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    H264,
    H265,
    Av1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenditionSettings {
    pub width: u32,
    pub height: u32,
    /// Bits per second
    pub bitrate: u64,
    #[serde(default = "default_preset")]
    pub preset: String,
    pub codec: CodecKind,
}

fn default_preset() -> String {
    "fast".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderCommonSettings {
    /// Prefer hardware encoders/decoders
    #[serde(default)]
    pub use_gpu: bool,
    /// Rational frames per second; also determines GOP length
    #[serde(default = "default_framerate")]
    pub framerate: String,
}

fn default_framerate() -> String {
    "30/1".to_string()
}

impl Default for EncoderCommonSettings {
    fn default() -> Self {
        Self {
            use_gpu: false,
            framerate: default_framerate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySettings {
    #[serde(default)]
    pub enabled: bool,
    /// At most one probe per key packet per this period
    #[serde(default = "default_quality_cadence_ms")]
    pub cadence_ms: u64,
    /// Scores per emitted window average
    #[serde(default = "default_quality_window")]
    pub window: usize,
    #[serde(default = "default_quality_pass")]
    pub pass_threshold: f64,
}

fn default_quality_cadence_ms() -> u64 {
    4_000
}

fn default_quality_window() -> usize {
    10
}

fn default_quality_pass() -> f64 {
    90.0
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cadence_ms: default_quality_cadence_ms(),
            window: default_quality_window(),
            pass_threshold: default_quality_pass(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    File,
    Srt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub url: String,
    pub kind: OutputKind,
}

impl Settings {
    /// Load from a YAML file with `APP_` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("APP"))
            .build()?;
        Ok(builder.try_deserialize()?)
    }

    /// Reject configurations the pipeline cannot run. All checks happen
    /// before any codec or I/O resource is touched.
    pub fn validate(&self) -> Result<()> {
        if self.main_input.trim().is_empty() {
            bail!("main_input is required");
        }
        if self.encoders.is_empty() {
            bail!("at least one encoder rendition is required");
        }
        if self.outputs.len() != self.encoders.len() {
            bail!(
                "outputs ({}) must match encoder renditions ({})",
                self.outputs.len(),
                self.encoders.len()
            );
        }
        for (i, enc) in self.encoders.iter().enumerate() {
            if enc.width == 0 || enc.height == 0 {
                bail!("encoder[{i}]: zero dimension");
            }
            if enc.width % 2 != 0 || enc.height % 2 != 0 {
                bail!("encoder[{i}]: dimensions must be even for 4:2:0 output");
            }
            if enc.bitrate == 0 {
                bail!("encoder[{i}]: zero bitrate");
            }
        }
        self.encoder
            .framerate
            .parse::<TimeBase>()
            .context("encoder.framerate")?;
        for (i, out) in self.outputs.iter().enumerate() {
            if out.url.trim().is_empty() {
                bail!("output[{i}]: empty url");
            }
            if out.kind == OutputKind::Srt {
                let url = Url::parse(&out.url).with_context(|| format!("output[{i}].url"))?;
                if url.scheme() != "srt" {
                    bail!("output[{i}]: srt output requires an srt:// url");
                }
            }
        }
        match self.transform.kind {
            TransformKind::Composite => {
                let c = &self.transform.composite;
                if c.canvas_w == 0 || c.canvas_h == 0 || c.canvas_w % 2 != 0 || c.canvas_h % 2 != 0
                {
                    bail!("composite: canvas dimensions must be non-zero and even");
                }
                if c.main_index > 3 {
                    bail!("composite: main_index must be 0..=3");
                }
                c.framerate
                    .parse::<TimeBase>()
                    .context("composite.framerate")?;
            }
            TransformKind::Segmentation => {
                let s = &self.transform.segmentation;
                if s.in_w < 16 || s.in_h < 16 {
                    bail!("segmentation: model input must be at least 16x16");
                }
                if !(0.0..=1.0).contains(&s.threshold) {
                    bail!("segmentation: threshold must be in [0,1]");
                }
                if !(0.0..=1.0).contains(&s.alpha) {
                    bail!("segmentation: alpha must be in [0,1]");
                }
            }
            TransformKind::None => {}
        }
        if self.quality.enabled && self.quality.window == 0 {
            bail!("quality: window must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(yaml: &str) -> Result<Settings> {
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f.flush().unwrap();
        Settings::load(f.path().to_str().unwrap())
    }

    const MINIMAL: &str = r#"
main_input: "clip.mp4"
encoders:
  - { width: 1920, height: 1080, bitrate: 20000000, codec: h265 }
outputs:
  - { url: "out.ts", kind: file }
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let s = parse(MINIMAL).unwrap();
        assert_eq!(s.io_timeout_us, 1_500_000);
        assert_eq!(s.transform.kind, TransformKind::None);
        assert_eq!(s.encoders[0].preset, "fast");
        assert_eq!(s.encoder.framerate, "30/1");
        assert_eq!(s.transform.segmentation.in_w, 192);
        assert!((s.transform.segmentation.alpha - 0.35).abs() < 1e-6);
        s.validate().unwrap();
    }

    #[test]
    fn rejects_missing_outputs() {
        let s = parse(
            r#"
main_input: "clip.mp4"
encoders:
  - { width: 1920, height: 1080, bitrate: 1000, codec: h264 }
outputs: []
"#,
        )
        .unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_odd_dimensions() {
        let s = parse(
            r#"
main_input: "clip.mp4"
encoders:
  - { width: 1921, height: 1080, bitrate: 1000, codec: h264 }
outputs:
  - { url: "out.ts", kind: file }
"#,
        )
        .unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_bad_segmentation_alpha() {
        let s = parse(
            r#"
main_input: "clip.mp4"
transform:
  kind: segmentation
  segmentation: { alpha: 1.5 }
encoders:
  - { width: 640, height: 360, bitrate: 1000, codec: h264 }
outputs:
  - { url: "out.ts", kind: file }
"#,
        )
        .unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_bad_framerate() {
        let s = parse(
            r#"
main_input: "clip.mp4"
encoder: { framerate: "abc" }
encoders:
  - { width: 640, height: 360, bitrate: 1000, codec: h264 }
outputs:
  - { url: "out.ts", kind: file }
"#,
        )
        .unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_srt_output_with_other_scheme() {
        let s = parse(
            r#"
main_input: "clip.mp4"
encoders:
  - { width: 640, height: 360, bitrate: 1000, codec: h264 }
outputs:
  - { url: "udp://host:9000", kind: srt }
"#,
        )
        .unwrap();
        assert!(s.validate().is_err());
    }
}
