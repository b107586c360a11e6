use anyhow::Result;
use ffmpeg_sys_next::AVPixelFormat::{AV_PIX_FMT_GRAY8, AV_PIX_FMT_RGB24, AV_PIX_FMT_YUV420P};
use log::{info, warn};

use crate::hwaccel::transfer_to_sw;
use crate::media::{DecodedFrame, MediaFrame};
use crate::pipeline::SegmentationConfig;
use crate::scale::Scaler;

/// Overlay color blended over masked pixels: pure green, BT.601.
const OVERLAY_Y: u8 = 150;
const OVERLAY_U: u8 = 44;
const OVERLAY_V: u8 = 21;

/// Per-frame binary segmentation backend.
///
/// Input is CHW float32 RGB in [0,1]; output is a row-major h*w mask in
/// [0,1]. A backend failure or a shape mismatch makes the caller fall back
/// to the heuristic mask.
pub trait SegmentationModel: Send {
    fn run(&mut self, chw: &[f32], h: usize, w: usize) -> Result<Vec<f32>>;
}

#[cfg(feature = "onnx")]
pub mod onnx {
    use std::path::Path;

    use anyhow::{bail, Result};
    use ort::session::Session;
    use ort::value::Value;

    use super::SegmentationModel;

    /// ONNX Runtime backed segmentation session.
    pub struct OrtModel {
        session: Session,
    }

    impl OrtModel {
        pub fn load(path: &Path, threads: usize) -> Result<Self> {
            let session = Session::builder()?
                .with_intra_threads(threads.max(1))?
                .commit_from_file(path)?;
            Ok(Self { session })
        }
    }

    impl SegmentationModel for OrtModel {
        fn run(&mut self, chw: &[f32], h: usize, w: usize) -> Result<Vec<f32>> {
            let input = Value::from_array(([1usize, 3, h, w], chw.to_vec()))?;
            let outputs = self.session.run(ort::inputs![input]?)?;
            let (shape, data) = outputs[0].try_extract_raw_tensor::<f32>()?;
            if shape.len() < 2 {
                bail!("model output rank {} too small", shape.len());
            }
            let oh = shape[shape.len() - 2] as usize;
            let ow = shape[shape.len() - 1] as usize;
            if oh != h || ow != w {
                bail!("model output {}x{} does not match input {}x{}", ow, oh, w, h);
            }
            Ok(data[..h * w].to_vec())
        }
    }
}

/// Stage 3 variant: translucent overlay over pixels the mask marks as
/// foreground. Output is always planar 4:2:0.
pub struct SegmentOverlay {
    in_w: usize,
    in_h: usize,
    threshold: f32,
    alpha: f32,
    model: Option<Box<dyn SegmentationModel>>,
    to_yuv: Scaler,
    to_rgb: Scaler,
    mask_up: Scaler,
    chw: Vec<f32>,
}

impl SegmentOverlay {
    pub fn new(cfg: &SegmentationConfig) -> Result<Self> {
        let model: Option<Box<dyn SegmentationModel>> = match &cfg.model_path {
            Some(path) => {
                #[cfg(feature = "onnx")]
                {
                    match onnx::OrtModel::load(path, cfg.threads) {
                        Ok(m) => {
                            info!("segmentation model loaded from {}", path.display());
                            Some(Box::new(m))
                        }
                        Err(e) => {
                            warn!(
                                "segmentation model {} unavailable ({e:#}); using heuristic mask",
                                path.display()
                            );
                            None
                        }
                    }
                }
                #[cfg(not(feature = "onnx"))]
                {
                    warn!(
                        "built without onnx support, ignoring model {}; using heuristic mask",
                        path.display()
                    );
                    None
                }
            }
            None => None,
        };
        if model.is_none() {
            info!("segmentation running with heuristic mask");
        }
        Ok(Self {
            in_w: cfg.in_w,
            in_h: cfg.in_h,
            threshold: cfg.threshold.clamp(0.0, 1.0),
            alpha: cfg.alpha.clamp(0.0, 1.0),
            model,
            to_yuv: Scaler::new(),
            to_rgb: Scaler::new(),
            mask_up: Scaler::new(),
            chw: vec![0.0; 3 * cfg.in_w * cfg.in_h],
        })
    }

    pub fn apply(&mut self, input: DecodedFrame) -> Result<DecodedFrame> {
        let frame = if input.frame.is_hw() {
            transfer_to_sw(&input.frame)?
        } else {
            input.frame
        };
        // the blend reads and writes 4:2:0 planes directly
        let src = if frame.format() == AV_PIX_FMT_YUV420P as i32 {
            frame
        } else {
            self.to_yuv
                .process(&frame, frame.width(), frame.height(), AV_PIX_FMT_YUV420P)?
        };
        let (w, h) = (src.width(), src.height());

        let rgb = self
            .to_rgb
            .process(&src, self.in_w as i32, self.in_h as i32, AV_PIX_FMT_RGB24)?;
        rgb_to_chw(
            rgb.plane(0, self.in_h),
            rgb.linesize(0),
            self.in_w,
            self.in_h,
            &mut self.chw,
        );

        let mask = match &mut self.model {
            Some(model) => match model.run(&self.chw, self.in_h, self.in_w) {
                Ok(m) if m.len() == self.in_w * self.in_h => m,
                Ok(m) => {
                    warn!(
                        "segmentation mask length {} != {}, using heuristic",
                        m.len(),
                        self.in_w * self.in_h
                    );
                    heuristic_mask(&self.chw, self.in_h, self.in_w)
                }
                Err(e) => {
                    warn!("segmentation inference failed ({e:#}), using heuristic");
                    heuristic_mask(&self.chw, self.in_h, self.in_w)
                }
            },
            None => heuristic_mask(&self.chw, self.in_h, self.in_w),
        };

        // mask floats -> GRAY8 at model size, then bilinear upsample
        let mut small = MediaFrame::alloc_video(AV_PIX_FMT_GRAY8, self.in_w as i32, self.in_h as i32)?;
        let stride = small.linesize(0);
        let plane = small.plane_mut(0, self.in_h);
        for y in 0..self.in_h {
            for x in 0..self.in_w {
                let v = mask[y * self.in_w + x].clamp(0.0, 1.0);
                plane[y * stride + x] = (v * 255.0).round() as u8;
            }
        }
        let big = self.mask_up.process(&small, w, h, AV_PIX_FMT_GRAY8)?;

        let mut out = MediaFrame::alloc_video(AV_PIX_FMT_YUV420P, w, h)?;
        out.copy_props_from(&src)?;
        out.set_pts(src.pts());
        out.set_time_base(src.time_base());
        out.set_duration(src.duration());

        let (cw, ch) = ((w / 2) as usize, (h / 2) as usize);
        let (out_s0, out_s1, out_s2) = (out.linesize(0), out.linesize(1), out.linesize(2));
        blend_luma(
            src.plane(0, h as usize),
            src.linesize(0),
            out.plane_mut(0, h as usize),
            out_s0,
            big.plane(0, h as usize),
            big.linesize(0),
            w as usize,
            h as usize,
            self.threshold,
            self.alpha,
        );
        blend_chroma(
            src.plane(1, ch),
            src.linesize(1),
            out.plane_mut(1, ch),
            out_s1,
            big.plane(0, h as usize),
            big.linesize(0),
            cw,
            ch,
            self.threshold,
            self.alpha,
            OVERLAY_U,
        );
        blend_chroma(
            src.plane(2, ch),
            src.linesize(2),
            out.plane_mut(2, ch),
            out_s2,
            big.plane(0, h as usize),
            big.linesize(0),
            cw,
            ch,
            self.threshold,
            self.alpha,
            OVERLAY_V,
        );

        Ok(DecodedFrame {
            frame: out,
            src_index: input.src_index,
        })
    }
}

/// RGB24 rows into planar CHW floats in [0,1].
pub(crate) fn rgb_to_chw(rgb: &[u8], stride: usize, w: usize, h: usize, chw: &mut [f32]) {
    let n = w * h;
    debug_assert!(chw.len() >= 3 * n);
    for y in 0..h {
        let row = &rgb[y * stride..y * stride + 3 * w];
        for x in 0..w {
            chw[y * w + x] = row[3 * x] as f32 / 255.0;
            chw[n + y * w + x] = row[3 * x + 1] as f32 / 255.0;
            chw[2 * n + y * w + x] = row[3 * x + 2] as f32 / 255.0;
        }
    }
}

/// Otsu's threshold over an 8-bit luminance plane: the level maximizing
/// between-class variance.
pub(crate) fn otsu_threshold(luma: &[u8]) -> u8 {
    let mut hist = [0u64; 256];
    for &v in luma {
        hist[v as usize] += 1;
    }
    let total = luma.len() as f64;
    if total == 0.0 {
        return 0;
    }
    let sum_all: f64 = hist
        .iter()
        .enumerate()
        .map(|(v, &c)| v as f64 * c as f64)
        .sum();

    let mut best_t = 0u8;
    let mut best_var = 0.0f64;
    let mut w0 = 0.0f64;
    let mut sum0 = 0.0f64;
    for t in 0..256 {
        w0 += hist[t] as f64;
        if w0 == 0.0 {
            continue;
        }
        let w1 = total - w0;
        if w1 == 0.0 {
            break;
        }
        sum0 += t as f64 * hist[t] as f64;
        let m0 = sum0 / w0;
        let m1 = (sum_all - sum0) / w1;
        let var = w0 * w1 * (m0 - m1) * (m0 - m1);
        if var > best_var {
            best_var = var;
            best_t = t as u8;
        }
    }
    best_t
}

/// YCbCr skin-color window (8-bit, BT.601).
fn is_skin(cb: f32, cr: f32) -> bool {
    (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}

/// Heuristic foreground mask: Otsu-on-luminance OR skin color, followed by a
/// 3x3 dilation. If fewer than n/200 pixels come out positive, the luminance
/// threshold is halved once and the pass repeats.
pub(crate) fn heuristic_mask(chw: &[f32], h: usize, w: usize) -> Vec<f32> {
    let n = w * h;
    let (r, g, b) = (&chw[..n], &chw[n..2 * n], &chw[2 * n..3 * n]);

    let mut luma = vec![0u8; n];
    for i in 0..n {
        let y = (0.299 * r[i] + 0.587 * g[i] + 0.114 * b[i]) * 255.0;
        luma[i] = y.round().clamp(0.0, 255.0) as u8;
    }
    let otsu = otsu_threshold(&luma);

    let classify = |thr: u8| -> (Vec<f32>, usize) {
        let mut mask = vec![0.0f32; n];
        let mut positive = 0usize;
        for i in 0..n {
            let cb = (-0.168_736 * r[i] - 0.331_264 * g[i] + 0.5 * b[i]) * 255.0 + 128.0;
            let cr = (0.5 * r[i] - 0.418_688 * g[i] - 0.081_312 * b[i]) * 255.0 + 128.0;
            if luma[i] > thr || is_skin(cb, cr) {
                mask[i] = 1.0;
                positive += 1;
            }
        }
        (mask, positive)
    };

    let (mut mask, positive) = classify(otsu);
    if positive < n / 200 {
        let (relaxed, relaxed_positive) = classify(otsu / 2);
        if relaxed_positive > positive {
            mask = relaxed;
        }
    }
    dilate3x3(&mask, h, w)
}

/// Binary 3x3 dilation.
pub(crate) fn dilate3x3(mask: &[f32], h: usize, w: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let y0 = y.saturating_sub(1);
            let y1 = (y + 1).min(h - 1);
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(w - 1);
            'probe: for ny in y0..=y1 {
                for nx in x0..=x1 {
                    if mask[ny * w + nx] > 0.0 {
                        out[y * w + x] = 1.0;
                        break 'probe;
                    }
                }
            }
        }
    }
    out
}

/// Soft blend weight: 0 below the threshold, ramping linearly to `alpha` at
/// mask value 1.
pub(crate) fn soft_alpha(m: f32, thr: f32, alpha: f32) -> f32 {
    if thr >= 1.0 {
        return if m >= 1.0 { alpha } else { 0.0 };
    }
    alpha * ((m - thr) / (1.0 - thr)).max(0.0)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn blend_luma(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    mask: &[u8],
    mask_stride: usize,
    w: usize,
    h: usize,
    thr: f32,
    alpha: f32,
) {
    for y in 0..h {
        for x in 0..w {
            let m = mask[y * mask_stride + x] as f32 / 255.0;
            let a = soft_alpha(m, thr, alpha);
            let s = src[y * src_stride + x] as f32;
            dst[y * dst_stride + x] = ((1.0 - a) * s + a * OVERLAY_Y as f32).round() as u8;
        }
    }
}

/// Chroma blend at half resolution; the mask weight for each chroma sample
/// is the average of its 2x2 luma-resolution block.
#[allow(clippy::too_many_arguments)]
pub(crate) fn blend_chroma(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    mask: &[u8],
    mask_stride: usize,
    cw: usize,
    ch: usize,
    thr: f32,
    alpha: f32,
    overlay: u8,
) {
    for y in 0..ch {
        for x in 0..cw {
            let mx = x * 2;
            let my = y * 2;
            let sum = mask[my * mask_stride + mx] as u32
                + mask[my * mask_stride + mx + 1] as u32
                + mask[(my + 1) * mask_stride + mx] as u32
                + mask[(my + 1) * mask_stride + mx + 1] as u32;
            let m = sum as f32 / (255.0 * 4.0);
            let a = soft_alpha(m, thr, alpha);
            let s = src[y * src_stride + x] as f32;
            dst[y * dst_stride + x] = ((1.0 - a) * s + a * overlay as f32).round() as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otsu_separates_bimodal_distribution() {
        let mut luma = vec![10u8; 500];
        luma.extend(std::iter::repeat(200u8).take(500));
        let t = otsu_threshold(&luma);
        assert!(t >= 10 && t < 200, "threshold {t}");
    }

    #[test]
    fn black_frame_produces_empty_mask() {
        let (w, h) = (16, 16);
        let chw = vec![0.0f32; 3 * w * h];
        let mask = heuristic_mask(&chw, h, w);
        assert!(mask.iter().all(|&m| m == 0.0));
    }

    #[test]
    fn bright_subject_is_masked() {
        let (w, h) = (16, 16);
        let mut chw = vec![0.0f32; 3 * w * h];
        let n = w * h;
        // bright white square in the middle of a dark frame
        for y in 6..10 {
            for x in 6..10 {
                chw[y * w + x] = 1.0;
                chw[n + y * w + x] = 1.0;
                chw[2 * n + y * w + x] = 1.0;
            }
        }
        let mask = heuristic_mask(&chw, h, w);
        assert_eq!(mask[8 * w + 8], 1.0);
        assert_eq!(mask[0], 0.0);
        // dilation extends the square by one pixel
        assert_eq!(mask[5 * w + 5], 1.0);
        assert_eq!(mask[4 * w + 4], 0.0);
    }

    #[test]
    fn skin_tone_is_masked_regardless_of_otsu() {
        let (w, h) = (16, 16);
        let mut chw = vec![0.0f32; 3 * w * h];
        let n = w * h;
        // uniform skin tone: Otsu cannot separate a uniform image, the skin
        // predicate still fires
        for i in 0..n {
            chw[i] = 0.8; // R
            chw[n + i] = 0.55; // G
            chw[2 * n + i] = 0.45; // B
        }
        let mask = heuristic_mask(&chw, h, w);
        assert!(mask.iter().all(|&m| m == 1.0));
    }

    #[test]
    fn dilation_grows_single_pixel() {
        let (w, h) = (5, 5);
        let mut mask = vec![0.0f32; w * h];
        mask[2 * w + 2] = 1.0;
        let out = dilate3x3(&mask, h, w);
        for y in 1..=3 {
            for x in 1..=3 {
                assert_eq!(out[y * w + x], 1.0);
            }
        }
        assert_eq!(out[0], 0.0);
        assert_eq!(out[4 * w + 4], 0.0);
    }

    #[test]
    fn soft_alpha_ramp() {
        let thr = 0.5;
        let alpha = 0.35;
        assert_eq!(soft_alpha(0.2, thr, alpha), 0.0);
        assert_eq!(soft_alpha(0.5, thr, alpha), 0.0);
        assert!((soft_alpha(0.75, thr, alpha) - alpha / 2.0).abs() < 1e-6);
        assert!((soft_alpha(1.0, thr, alpha) - alpha).abs() < 1e-6);
    }

    #[test]
    fn zero_mask_blend_is_bit_exact() {
        let (w, h) = (8, 4);
        let src: Vec<u8> = (0..w * h).map(|i| (i * 7 % 251) as u8).collect();
        let mut dst = vec![0u8; w * h];
        let mask = vec![0u8; w * h];
        blend_luma(&src, w, &mut dst, w, &mask, w, w, h, 0.5, 0.35);
        assert_eq!(src, dst);
    }

    #[test]
    fn full_mask_blends_toward_overlay() {
        let (w, h) = (4, 2);
        let src = vec![0u8; w * h];
        let mut dst = vec![0u8; w * h];
        let mask = vec![255u8; w * h];
        blend_luma(&src, w, &mut dst, w, &mask, w, w, h, 0.5, 1.0);
        assert!(dst.iter().all(|&v| v == OVERLAY_Y));
    }

    #[test]
    fn chroma_uses_2x2_block_average() {
        // 2x2 luma block half-on: average mask 0.5, at thr 0 and alpha 1
        // the blend weight is 0.5
        let mask = vec![255u8, 0, 0, 255];
        let src_u = vec![128u8];
        let mut dst_u = vec![0u8];
        blend_chroma(&src_u, 1, &mut dst_u, 1, &mask, 2, 1, 1, 0.0, 1.0, OVERLAY_U);
        let expect_u = (0.5 * 128.0 + 0.5 * OVERLAY_U as f32).round() as u8;
        assert_eq!(dst_u[0], expect_u);
    }

    #[test]
    fn rgb_rows_convert_to_chw() {
        let (w, h) = (2, 1);
        let rgb = vec![255u8, 0, 0, 0, 255, 0];
        let mut chw = vec![0.0f32; 3 * w * h];
        rgb_to_chw(&rgb, 6, w, h, &mut chw);
        assert_eq!(chw[0], 1.0); // R of pixel 0
        assert_eq!(chw[1], 0.0); // R of pixel 1
        assert_eq!(chw[2], 0.0); // G of pixel 0
        assert_eq!(chw[3], 1.0); // G of pixel 1
        assert_eq!(chw[4], 0.0);
        assert_eq!(chw[5], 0.0);
    }
}
