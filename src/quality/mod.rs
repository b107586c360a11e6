use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use ffmpeg_sys_next::AVPixelFormat::AV_PIX_FMT_YUV420P;
use ffmpeg_sys_next::{
    av_mallocz, avcodec_alloc_context3, avcodec_find_decoder, avcodec_free_context, avcodec_open2,
    avcodec_receive_frame, avcodec_send_packet, AVCodecContext, AVCodecID,
    AV_INPUT_BUFFER_PADDING_SIZE,
};
use log::{debug, error, info, warn};

use crate::hwaccel::transfer_to_sw;
use crate::media::{MediaFrame, MediaPacket};
use crate::pipeline::QualityConfig;
use crate::scale::Scaler;
use crate::utils::av_err;

pub mod nal;

/// Full-reference quality metric: `eval(reference, distorted)` in [0,100].
pub trait QualityMetric: Send {
    fn eval(&mut self, reference: &MediaFrame, distorted: &MediaFrame) -> Result<f64>;
}

/// Luma PSNR mapped into the metric range: identical pictures score 100,
/// anything at or below 0 dB scores 0.
pub struct Psnr;

impl QualityMetric for Psnr {
    fn eval(&mut self, reference: &MediaFrame, distorted: &MediaFrame) -> Result<f64> {
        if reference.format() != AV_PIX_FMT_YUV420P as i32
            || distorted.format() != AV_PIX_FMT_YUV420P as i32
        {
            bail!("metric requires yuv420p input");
        }
        if reference.width() != distorted.width() || reference.height() != distorted.height() {
            bail!("reference and distorted dimensions differ");
        }
        let (w, h) = (reference.width() as usize, reference.height() as usize);
        let mse = mse_plane(
            reference.plane(0, h),
            reference.linesize(0),
            distorted.plane(0, h),
            distorted.linesize(0),
            w,
            h,
        );
        Ok(psnr_score(mse))
    }
}

/// Mean squared error between two planes.
pub(crate) fn mse_plane(
    a: &[u8],
    a_stride: usize,
    b: &[u8],
    b_stride: usize,
    w: usize,
    h: usize,
) -> f64 {
    let mut sum = 0u64;
    for y in 0..h {
        for x in 0..w {
            let d = a[y * a_stride + x] as i64 - b[y * b_stride + x] as i64;
            sum += (d * d) as u64;
        }
    }
    sum as f64 / (w * h) as f64
}

/// PSNR in dB clamped into [0,100]; zero error saturates at 100.
pub(crate) fn psnr_score(mse: f64) -> f64 {
    if mse <= 0.0 {
        return 100.0;
    }
    let psnr = 10.0 * (255.0f64 * 255.0 / mse).log10();
    psnr.clamp(0.0, 100.0)
}

/// Atomic per-rendition score accumulator emitting a windowed average every
/// `window` scores.
pub struct ScoreWindow {
    window: u64,
    pass_threshold: f64,
    sum_milli: AtomicU64,
    count: AtomicU64,
    window_sum_milli: AtomicU64,
    window_count: AtomicU64,
}

impl ScoreWindow {
    pub fn new(window: usize, pass_threshold: f64) -> Self {
        Self {
            window: window.max(1) as u64,
            pass_threshold,
            sum_milli: AtomicU64::new(0),
            count: AtomicU64::new(0),
            window_sum_milli: AtomicU64::new(0),
            window_count: AtomicU64::new(0),
        }
    }

    /// Record one score; returns `Some((average, pass))` when this score
    /// completes a window.
    pub fn record(&self, score: f64) -> Option<(f64, bool)> {
        let milli = (score.clamp(0.0, 100.0) * 1000.0).round() as u64;
        self.sum_milli.fetch_add(milli, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let wsum = self.window_sum_milli.fetch_add(milli, Ordering::Relaxed) + milli;
        let wcount = self.window_count.fetch_add(1, Ordering::Relaxed) + 1;
        if wcount < self.window {
            return None;
        }
        self.window_sum_milli.store(0, Ordering::Relaxed);
        self.window_count.store(0, Ordering::Relaxed);
        let avg = wsum as f64 / 1000.0 / wcount as f64;
        Some((avg, avg >= self.pass_threshold))
    }

    /// Lifetime (sum, count).
    pub fn totals(&self) -> (f64, u64) {
        (
            self.sum_milli.load(Ordering::Relaxed) as f64 / 1000.0,
            self.count.load(Ordering::Relaxed),
        )
    }
}

/// Per-rendition quality probe riding the encoded path.
///
/// Holds a secondary decoder initialized from the encoder's parameters.
/// Fires on key packets, at most once per cadence; the reference picture is
/// handed over by the encode stage just before submission and consumed
/// unconditionally at the end of an evaluation.
pub struct QualityProbe {
    rendition: usize,
    dec_ctx: *mut AVCodecContext,
    codec_id: AVCodecID,
    width: i32,
    height: i32,
    metric: Box<dyn QualityMetric>,
    scaler: Scaler,
    cadence: Duration,
    last_eval: Option<Instant>,
    pending: Option<MediaFrame>,
    eval_lock: Arc<Mutex<()>>,
    scores: ScoreWindow,
}

unsafe impl Send for QualityProbe {}

impl QualityProbe {
    /// Build the secondary decoder from the (already opened) encoder
    /// context, carrying its extradata so container-level headers are not
    /// required.
    pub fn new(rendition: usize, enc_ctx: *mut AVCodecContext, cfg: &QualityConfig) -> Result<Self> {
        unsafe {
            let codec_id = (*enc_ctx).codec_id;
            let dec = avcodec_find_decoder(codec_id);
            if dec.is_null() {
                bail!("no decoder for quality probe");
            }
            let mut ctx = avcodec_alloc_context3(dec);
            if ctx.is_null() {
                bail!("failed to allocate probe decoder context");
            }
            if !(*enc_ctx).extradata.is_null() && (*enc_ctx).extradata_size > 0 {
                let size = (*enc_ctx).extradata_size as usize;
                let buf = av_mallocz(size + AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
                if buf.is_null() {
                    avcodec_free_context(&mut ctx);
                    bail!("failed to allocate probe extradata");
                }
                ptr::copy_nonoverlapping((*enc_ctx).extradata, buf, size);
                (*ctx).extradata = buf;
                (*ctx).extradata_size = size as i32;
            }
            (*ctx).time_base = (*enc_ctx).time_base;
            (*ctx).thread_count = 1;
            let ret = avcodec_open2(ctx, dec, ptr::null_mut());
            if ret < 0 {
                avcodec_free_context(&mut ctx);
                bail!("failed to open probe decoder: {}", av_err(ret));
            }
            Ok(Self {
                rendition,
                dec_ctx: ctx,
                codec_id,
                width: (*enc_ctx).width,
                height: (*enc_ctx).height,
                metric: Box::new(Psnr),
                scaler: Scaler::new(),
                cadence: cfg.cadence,
                last_eval: None,
                pending: None,
                eval_lock: Arc::new(Mutex::new(())),
                scores: ScoreWindow::new(cfg.window, cfg.pass_threshold),
            })
        }
    }

    /// Whether the cadence allows another evaluation.
    pub fn due(&self) -> bool {
        match self.last_eval {
            None => true,
            Some(at) => at.elapsed() >= self.cadence,
        }
    }

    /// 4:2:0 picture at encoder resolution, cloning when already conformant.
    fn normalize(&mut self, frame: &MediaFrame) -> Result<MediaFrame> {
        let sw;
        let frame = if frame.is_hw() {
            sw = transfer_to_sw(frame)?;
            &sw
        } else {
            frame
        };
        if frame.format() == AV_PIX_FMT_YUV420P as i32
            && frame.width() == self.width
            && frame.height() == self.height
        {
            frame.clone_ref()
        } else {
            self.scaler
                .process(frame, self.width, self.height, AV_PIX_FMT_YUV420P)
        }
    }

    /// Stash the reference clone for the picture about to be encoded.
    pub fn set_reference(&mut self, frame: &MediaFrame) {
        match self.normalize(frame) {
            Ok(reference) => self.pending = Some(reference),
            Err(e) => warn!("quality[{}]: reference clone failed: {e:#}", self.rendition),
        }
    }

    /// Feed an output packet; evaluates when it is a key packet and a
    /// reference is pending. The reference is consumed either way the
    /// evaluation goes.
    pub fn on_packet(&mut self, pkt: &MediaPacket) {
        if !pkt.is_key() {
            return;
        }
        let Some(reference) = self.pending.take() else {
            return;
        };
        let serialized = self.eval_lock.clone();
        let _serialized = serialized.lock().expect("probe lock poisoned");

        if self.codec_id == AVCodecID::AV_CODEC_ID_HEVC {
            if let Some(t) = nal::hevc_first_vcl_nal_type(pkt.data()) {
                debug!(
                    "quality[{}]: nal={} ({})",
                    self.rendition,
                    t,
                    nal::hevc_slice_kind(t)
                );
            }
        }

        let score = match self.decode_and_score(&reference, pkt) {
            Ok(score) => score,
            Err(e) => {
                debug!("quality[{}]: probe skipped: {e:#}", self.rendition);
                return;
            }
        };
        self.last_eval = Some(Instant::now());
        if let Some((avg, pass)) = self.scores.record(score) {
            info!(
                "quality[{}]: window average {:.2}, pass={}",
                self.rendition, avg, pass
            );
        }
    }

    fn decode_and_score(&mut self, reference: &MediaFrame, pkt: &MediaPacket) -> Result<f64> {
        let ret = unsafe { avcodec_send_packet(self.dec_ctx, pkt.as_ptr() as *const _) };
        if ret < 0 {
            bail!("probe decoder send failed: {}", av_err(ret));
        }
        let distorted = MediaFrame::alloc()?;
        let ret = unsafe { avcodec_receive_frame(self.dec_ctx, distorted.as_ptr()) };
        if ret < 0 {
            bail!("probe decoder produced no picture: {}", av_err(ret));
        }
        let distorted = self.normalize(&distorted)?;
        match self.metric.eval(reference, &distorted) {
            Ok(score) => Ok(score),
            Err(e) => {
                error!("quality[{}]: metric failed: {e:#}", self.rendition);
                Err(e)
            }
        }
    }
}

impl Drop for QualityProbe {
    fn drop(&mut self) {
        unsafe {
            avcodec_free_context(&mut self.dec_ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_planes_score_100() {
        let a = vec![42u8; 64];
        assert_eq!(mse_plane(&a, 8, &a, 8, 8, 8), 0.0);
        assert_eq!(psnr_score(0.0), 100.0);
    }

    #[test]
    fn off_by_one_everywhere() {
        let a = vec![100u8; 64];
        let b = vec![101u8; 64];
        let mse = mse_plane(&a, 8, &b, 8, 8, 8);
        assert_eq!(mse, 1.0);
        let score = psnr_score(mse);
        assert!((score - 48.13).abs() < 0.01, "score {score}");
    }

    #[test]
    fn metric_rejects_dimension_mismatch() {
        let a = MediaFrame::alloc_video(AV_PIX_FMT_YUV420P, 32, 16).unwrap();
        let b = MediaFrame::alloc_video(AV_PIX_FMT_YUV420P, 16, 16).unwrap();
        assert!(Psnr.eval(&a, &b).is_err());
    }

    #[test]
    fn window_emits_every_k_scores() {
        let w = ScoreWindow::new(3, 90.0);
        assert!(w.record(95.0).is_none());
        assert!(w.record(92.0).is_none());
        let (avg, pass) = w.record(89.0).unwrap();
        assert!((avg - 92.0).abs() < 1e-9);
        assert!(pass);

        // next window starts fresh
        assert!(w.record(10.0).is_none());
        assert!(w.record(10.0).is_none());
        let (avg, pass) = w.record(10.0).unwrap();
        assert!((avg - 10.0).abs() < 1e-9);
        assert!(!pass);

        let (sum, count) = w.totals();
        assert_eq!(count, 6);
        assert!((sum - (95.0 + 92.0 + 89.0 + 30.0)).abs() < 1e-6);
    }

    #[test]
    fn scores_clamp_into_range() {
        let w = ScoreWindow::new(1, 90.0);
        let (avg, _) = w.record(250.0).unwrap();
        assert_eq!(avg, 100.0);
        let (avg, _) = w.record(-5.0).unwrap();
        assert_eq!(avg, 0.0);
    }
}
