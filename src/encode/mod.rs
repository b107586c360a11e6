use std::ffi::CString;
use std::ptr;
use std::sync::Arc;

use anyhow::{bail, Result};
use ffmpeg_sys_next::AVPixelFormat::{AV_PIX_FMT_CUDA, AV_PIX_FMT_NV12, AV_PIX_FMT_YUV420P};
use ffmpeg_sys_next::{
    av_opt_set, av_opt_set_int, avcodec_alloc_context3, avcodec_find_encoder,
    avcodec_find_encoder_by_name, avcodec_free_context, avcodec_open2, avcodec_receive_packet,
    avcodec_send_frame, AVCodec, AVCodecContext, AVCodecID, AVPixelFormat, AVERROR, AVERROR_EOF,
    AV_CODEC_FLAG_GLOBAL_HEADER,
};
use libc::EAGAIN;
use log::{error, info, warn};

use crate::hwaccel::{transfer_to_sw, upload_to_hw, HwDevice, HwFramesCtx};
use crate::media::{DecodedFrame, EncodedPacket, MediaFrame, MediaPacket};
use crate::pipeline::{PipelineConfig, RenditionConfig};
use crate::quality::QualityProbe;
use crate::queue::BoundedQueue;
use crate::scale::{GpuScaler, Scaler};
use crate::settings::CodecKind;
use crate::timebase::{TimeBase, NO_PTS};
use crate::utils::av_err;

/// Encoder time base; MPEG-TS native tick rate.
pub const ENCODER_TIME_BASE: TimeBase = TimeBase::new(1, 90_000);

/// Monotonic presentation-time reconciliation in the input time base.
///
/// Unknown timestamps take the synthesized `next_pts`; known timestamps pass
/// through and pull `next_pts` forward so later unknowns stay monotonic.
pub struct PtsTracker {
    next_pts: i64,
    frame_duration: i64,
}

impl PtsTracker {
    pub fn new(frame_duration: i64) -> Self {
        Self {
            next_pts: 0,
            frame_duration: frame_duration.max(1),
        }
    }

    pub fn reconcile(&mut self, pts: i64, duration: i64) -> i64 {
        let dur = if duration > 0 {
            duration
        } else {
            self.frame_duration
        };
        let use_pts = if pts == NO_PTS { self.next_pts } else { pts };
        self.next_pts = self.next_pts.max(use_pts + dur);
        use_pts
    }
}

fn codec_id(codec: CodecKind) -> AVCodecID {
    match codec {
        CodecKind::H264 => AVCodecID::AV_CODEC_ID_H264,
        CodecKind::H265 => AVCodecID::AV_CODEC_ID_HEVC,
        CodecKind::Av1 => AVCodecID::AV_CODEC_ID_AV1,
    }
}

/// Hardware encoder by name when requested, software encoder otherwise (or
/// as the fallback when the hardware one is missing).
fn find_encoder(codec: CodecKind, use_gpu: bool) -> (*const AVCodec, bool) {
    if use_gpu {
        let name: &[u8] = match codec {
            CodecKind::H264 => b"h264_nvenc\0",
            CodecKind::H265 => b"hevc_nvenc\0",
            CodecKind::Av1 => b"av1_nvenc\0",
        };
        let enc = unsafe { avcodec_find_encoder_by_name(name.as_ptr() as *const libc::c_char) };
        if !enc.is_null() {
            return (enc, true);
        }
        warn!("hardware encoder unavailable, falling back to software");
    }
    (unsafe { avcodec_find_encoder(codec_id(codec)) }, false)
}

/// One output rendition: encoder plus the scaler path feeding it.
struct RenditionEncoder {
    ctx: *mut AVCodecContext,
    index: usize,
    width: i32,
    height: i32,
    /// Encoder input format; AV_PIX_FMT_CUDA when the encoder takes device
    /// frames
    pix_fmt: AVPixelFormat,
    scaler: Scaler,
    gpu_scaler: Option<GpuScaler>,
    frames_ctx: Option<HwFramesCtx>,
    probe: Option<QualityProbe>,
}

unsafe impl Send for RenditionEncoder {}

impl RenditionEncoder {
    fn open(
        cfg: &RenditionConfig,
        framerate: TimeBase,
        use_gpu: bool,
        device: Option<&HwDevice>,
    ) -> Result<Self> {
        let (codec, hw) = find_encoder(cfg.codec, use_gpu && device.is_some());
        if codec.is_null() {
            bail!("no encoder for rendition {}", cfg.index);
        }
        let preset = CString::new(cfg.preset.as_str())?;
        unsafe {
            let mut ctx = avcodec_alloc_context3(codec);
            if ctx.is_null() {
                bail!("failed to allocate encoder context");
            }
            (*ctx).width = cfg.width;
            (*ctx).height = cfg.height;
            (*ctx).time_base = ENCODER_TIME_BASE.into();
            (*ctx).framerate = framerate.into();
            (*ctx).bit_rate = cfg.bitrate;
            (*ctx).pix_fmt = AV_PIX_FMT_YUV420P;

            av_opt_set(
                (*ctx).priv_data,
                c"preset".as_ptr(),
                preset.as_ptr(),
                0,
            );

            if cfg.codec == CodecKind::Av1 {
                (*ctx).flags |= AV_CODEC_FLAG_GLOBAL_HEADER as i32;
            }

            // constant-rate control around the target bitrate
            (*ctx).rc_max_rate = cfg.bitrate;
            (*ctx).rc_min_rate = cfg.bitrate;
            (*ctx).rc_buffer_size = cfg.bitrate.min(i32::MAX as i64) as i32;

            // closed GOP, one keyframe per second of frames, no B-frames
            let gop = (framerate.num as f64 / framerate.den as f64).round() as i32;
            (*ctx).gop_size = gop.max(1);
            (*ctx).keyint_min = gop.max(1);
            (*ctx).max_b_frames = 0;
            (*ctx).qcompress = 0.6;

            let mut frames_ctx = None;
            if hw {
                let device = device.expect("hw encoder without device");
                av_opt_set_int((*ctx).priv_data, c"bf".as_ptr(), 0, 0);
                av_opt_set_int((*ctx).priv_data, c"no-scenecut".as_ptr(), 1, 0);
                av_opt_set_int((*ctx).priv_data, c"strict_gop".as_ptr(), 1, 0);
                av_opt_set_int((*ctx).priv_data, c"aud".as_ptr(), 1, 0);
                av_opt_set_int((*ctx).priv_data, c"repeat-headers".as_ptr(), 1, 0);

                let frames =
                    match HwFramesCtx::alloc(device, AV_PIX_FMT_NV12, cfg.width, cfg.height, 20) {
                        Ok(f) => f,
                        Err(e) => {
                            avcodec_free_context(&mut ctx);
                            return Err(e);
                        }
                    };
                (*ctx).pix_fmt = AV_PIX_FMT_CUDA;
                (*ctx).hw_frames_ctx = frames.new_ref();
                (*ctx).hw_device_ctx = device.new_ref();
                frames_ctx = Some(frames);
            } else if cfg.codec == CodecKind::H265 {
                // transport-stream friendly: no scene cuts, closed GOP,
                // in-band headers on every keyframe
                av_opt_set(
                    (*ctx).priv_data,
                    c"x265-params".as_ptr(),
                    c"scenecut=0:open-gop=0:bframes=0:aud=1:repeat-headers=1".as_ptr(),
                    0,
                );
                av_opt_set_int((*ctx).priv_data, c"forced-idr".as_ptr(), 1, 0);
            }

            let ret = avcodec_open2(ctx, codec, ptr::null_mut());
            if ret < 0 {
                avcodec_free_context(&mut ctx);
                bail!("failed to open encoder {}: {}", cfg.index, av_err(ret));
            }

            info!(
                "encoder {} ready: {}x{} @ {} bps{}",
                cfg.index,
                cfg.width,
                cfg.height,
                cfg.bitrate,
                if hw { " (hw)" } else { "" }
            );
            Ok(Self {
                ctx,
                index: cfg.index,
                width: cfg.width,
                height: cfg.height,
                pix_fmt: (*ctx).pix_fmt,
                scaler: Scaler::new(),
                gpu_scaler: if hw {
                    Some(GpuScaler::new(cfg.width, cfg.height))
                } else {
                    None
                },
                frames_ctx,
                probe: None,
            })
        }
    }

    fn wants_hw(&self) -> bool {
        self.pix_fmt == AV_PIX_FMT_CUDA
    }

    pub fn codec_context(&self) -> *mut AVCodecContext {
        self.ctx
    }

    /// Scale/convert the picture to this rendition's geometry per the frame
    /// residency table.
    fn prepare(&mut self, frame: &MediaFrame) -> Result<MediaFrame> {
        match (frame.is_hw(), self.wants_hw()) {
            // device in, device out: device-side rescale
            (true, true) => {
                let scaler = self
                    .gpu_scaler
                    .as_mut()
                    .expect("device rendition without gpu scaler");
                scaler.process(frame)
            }
            // device in, software out: download then software scale
            (true, false) => {
                let sw = transfer_to_sw(frame)?;
                self.scaler
                    .process(&sw, self.width, self.height, AV_PIX_FMT_YUV420P)
            }
            // software in, software out
            (false, false) => self
                .scaler
                .process(frame, self.width, self.height, AV_PIX_FMT_YUV420P),
            // software in, device out: software scale then upload
            (false, true) => {
                let scaled = self
                    .scaler
                    .process(frame, self.width, self.height, AV_PIX_FMT_NV12)?;
                let frames = self
                    .frames_ctx
                    .as_ref()
                    .expect("device rendition without frames context");
                upload_to_hw(frames, &scaled)
            }
        }
    }

    /// Submit one frame (or the flush sentinel) and forward drained packets.
    fn send_and_drain(
        &mut self,
        frame: Option<&MediaFrame>,
        out: &BoundedQueue<EncodedPacket>,
    ) -> Result<()> {
        let ret = unsafe {
            avcodec_send_frame(self.ctx, frame.map_or(ptr::null(), |f| f.as_ptr() as *const _))
        };
        if ret < 0 && ret != AVERROR(EAGAIN) {
            bail!("encoder send failed: {}", av_err(ret));
        }
        loop {
            let mut pkt = MediaPacket::alloc()?;
            let ret = unsafe { avcodec_receive_packet(self.ctx, pkt.as_ptr()) };
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                break;
            }
            if ret < 0 {
                bail!("encoder receive failed: {}", av_err(ret));
            }
            if pkt.dts() == NO_PTS {
                pkt.set_dts(pkt.pts());
            }
            if pkt.duration() == 0 {
                pkt.set_duration(1);
            }
            if let Some(probe) = &mut self.probe {
                probe.on_packet(&pkt);
            }
            if !out.push(EncodedPacket {
                packet: pkt,
                rendition: self.index,
            }) {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for RenditionEncoder {
    fn drop(&mut self) {
        unsafe {
            avcodec_free_context(&mut self.ctx);
        }
    }
}

/// Stage 4: per-rendition scale/convert + encode, with the quality adjunct
/// riding the encoded path.
pub struct EncodeStage {
    renditions: Vec<RenditionEncoder>,
    tracker: PtsTracker,
    input_tb: TimeBase,
    framerate: TimeBase,
    input: Arc<BoundedQueue<DecodedFrame>>,
    output: Arc<BoundedQueue<EncodedPacket>>,
}

impl EncodeStage {
    pub fn new(
        cfg: &PipelineConfig,
        input_tb: TimeBase,
        device: Option<&HwDevice>,
        input: Arc<BoundedQueue<DecodedFrame>>,
        output: Arc<BoundedQueue<EncodedPacket>>,
    ) -> Result<Self> {
        let mut renditions = Vec::with_capacity(cfg.renditions.len());
        for r in &cfg.renditions {
            let mut enc = RenditionEncoder::open(r, cfg.framerate, cfg.use_gpu, device)?;
            if cfg.quality.enabled {
                enc.probe = Some(QualityProbe::new(r.index, enc.ctx, &cfg.quality)?);
            }
            renditions.push(enc);
        }
        Ok(Self {
            renditions,
            tracker: PtsTracker::new(input_tb.ticks_per_frame(cfg.framerate)),
            input_tb,
            framerate: cfg.framerate,
            input,
            output,
        })
    }

    /// Encoder contexts in rendition order, for the egress muxers.
    pub fn codec_contexts(&self) -> Vec<*mut AVCodecContext> {
        self.renditions.iter().map(|r| r.ctx).collect()
    }

    fn encode_one(
        rendition: &mut RenditionEncoder,
        frame: &MediaFrame,
        pts: i64,
        input_tb: TimeBase,
        framerate: TimeBase,
        out: &BoundedQueue<EncodedPacket>,
    ) -> Result<()> {
        let mut scaled = rendition.prepare(frame)?;
        scaled.set_pts(input_tb.rescale(pts, ENCODER_TIME_BASE));
        scaled.set_duration(ENCODER_TIME_BASE.ticks_per_frame(framerate));
        scaled.set_time_base(ENCODER_TIME_BASE);
        unsafe {
            (*scaled.as_ptr()).pict_type =
                ffmpeg_sys_next::AVPictureType::AV_PICTURE_TYPE_NONE;
        }
        if let Some(probe) = &mut rendition.probe {
            if probe.due() {
                probe.set_reference(&scaled);
            }
        }
        rendition.send_and_drain(Some(&scaled), out)
    }

    pub fn run(mut self) {
        while let Some(item) = self.input.pop() {
            let frame = item.frame;
            let pts = self.tracker.reconcile(frame.pts(), frame.duration());
            for rendition in &mut self.renditions {
                if let Err(e) = Self::encode_one(
                    rendition,
                    &frame,
                    pts,
                    self.input_tb,
                    self.framerate,
                    &self.output,
                ) {
                    // transient per-frame failure for this rendition only
                    error!("encode[{}]: {e:#}", rendition.index);
                }
            }
        }
        for rendition in &mut self.renditions {
            if let Err(e) = rendition.send_and_drain(None, &self.output) {
                error!("encode[{}] flush: {e:#}", rendition.index);
            }
        }
        self.output.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_pts_synthesizes_monotonic_sequence() {
        let mut t = PtsTracker::new(3000);
        assert_eq!(t.reconcile(NO_PTS, 0), 0);
        assert_eq!(t.reconcile(NO_PTS, 0), 3000);
        assert_eq!(t.reconcile(NO_PTS, 0), 6000);
    }

    #[test]
    fn known_pts_passes_through_and_advances() {
        let mut t = PtsTracker::new(3000);
        assert_eq!(t.reconcile(9000, 3000), 9000);
        // an unknown after a known continues from it
        assert_eq!(t.reconcile(NO_PTS, 0), 12000);
    }

    #[test]
    fn stale_known_pts_does_not_rewind_next() {
        let mut t = PtsTracker::new(3000);
        assert_eq!(t.reconcile(30_000, 3000), 30_000);
        // a late frame with an older stamp passes through unchanged
        assert_eq!(t.reconcile(27_000, 3000), 27_000);
        // but the synthesized sequence never rewinds
        assert_eq!(t.reconcile(NO_PTS, 0), 33_000);
    }

    #[test]
    fn frame_duration_defaults_when_zero() {
        let mut t = PtsTracker::new(1500);
        t.reconcile(NO_PTS, 0);
        assert_eq!(t.reconcile(NO_PTS, 0), 1500);
    }
}
