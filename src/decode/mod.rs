use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;

use anyhow::{bail, Result};
use ffmpeg_sys_next::AVPictureType::AV_PICTURE_TYPE_NONE;
use ffmpeg_sys_next::{
    avcodec_alloc_context3, avcodec_find_decoder, avcodec_find_decoder_by_name,
    avcodec_free_context, avcodec_open2, avcodec_parameters_to_context, avcodec_receive_frame,
    avcodec_send_packet, AVCodec, AVCodecContext, AVCodecID, AVERROR, AVERROR_EOF,
    AV_CODEC_CAP_FRAME_THREADS, AV_CODEC_CAP_SLICE_THREADS, FF_THREAD_FRAME, FF_THREAD_SLICE,
};
use libc::EAGAIN;
use log::{error, info, warn};

use crate::hwaccel::HwDevice;
use crate::ingress::StreamParams;
use crate::media::{DecodedFrame, MediaFrame, MediaPacket};
use crate::queue::BoundedQueue;
use crate::timebase::{TimeBase, NO_PTS};
use crate::utils::av_err;

/// Hardware decoder names per codec, tried first when hardware is preferred.
fn find_decoder(codec_id: AVCodecID, prefer_hw: bool) -> *const AVCodec {
    if prefer_hw {
        let name: &[u8] = match codec_id {
            AVCodecID::AV_CODEC_ID_H264 => b"h264_cuvid\0",
            AVCodecID::AV_CODEC_ID_HEVC => b"hevc_cuvid\0",
            AVCodecID::AV_CODEC_ID_AV1 => b"av1_cuvid\0",
            _ => b"\0",
        };
        if name.len() > 1 {
            let codec =
                unsafe { avcodec_find_decoder_by_name(name.as_ptr() as *const libc::c_char) };
            if !codec.is_null() {
                return codec;
            }
            warn!("hardware decoder unavailable, falling back to software");
        }
    }
    unsafe { avcodec_find_decoder(codec_id) }
}

struct StreamDecoder {
    ctx: *mut AVCodecContext,
    slot: usize,
    time_base: TimeBase,
    last_pts: i64,
}

unsafe impl Send for StreamDecoder {}

impl StreamDecoder {
    fn open(params: &StreamParams, prefer_hw: bool, device: Option<&HwDevice>) -> Result<Self> {
        unsafe {
            let codec = find_decoder(params.codec_id(), prefer_hw && device.is_some());
            if codec.is_null() {
                bail!("no decoder for stream {}", params.slot);
            }
            let mut ctx = avcodec_alloc_context3(codec);
            if ctx.is_null() {
                bail!("failed to allocate decoder context");
            }
            let ret = avcodec_parameters_to_context(ctx, params.codecpar());
            if ret < 0 {
                avcodec_free_context(&mut ctx);
                bail!("failed to apply codec parameters: {}", av_err(ret));
            }
            (*ctx).pkt_timebase = params.time_base.into();
            if prefer_hw {
                if let Some(device) = device {
                    (*ctx).hw_device_ctx = device.new_ref();
                }
            }

            // frame threads keep output in decode order, slice threads are
            // the fallback; codecs with neither stay single threaded
            let caps = (*codec).capabilities;
            (*ctx).thread_count = 0;
            if caps & AV_CODEC_CAP_FRAME_THREADS as i32 != 0 {
                (*ctx).thread_type = FF_THREAD_FRAME as i32;
            } else if caps & AV_CODEC_CAP_SLICE_THREADS as i32 != 0 {
                (*ctx).thread_type = FF_THREAD_SLICE as i32;
            } else {
                (*ctx).thread_count = 1;
            }

            let ret = avcodec_open2(ctx, codec, ptr::null_mut());
            if ret < 0 {
                avcodec_free_context(&mut ctx);
                bail!("failed to open decoder: {}", av_err(ret));
            }
            Ok(Self {
                ctx,
                slot: params.slot,
                time_base: params.time_base,
                last_pts: NO_PTS,
            })
        }
    }

    /// Submit one packet (or the flush sentinel) and drain every available
    /// picture into `out`.
    fn send_and_drain(
        &mut self,
        pkt: Option<&MediaPacket>,
        out: &BoundedQueue<DecodedFrame>,
    ) -> Result<()> {
        let ret = unsafe {
            avcodec_send_packet(self.ctx, pkt.map_or(ptr::null(), |p| p.as_ptr() as *const _))
        };
        if ret < 0 && ret != AVERROR(EAGAIN) && ret != AVERROR_EOF {
            bail!("decoder send failed: {}", av_err(ret));
        }
        loop {
            let mut frame = MediaFrame::alloc()?;
            let ret = unsafe { avcodec_receive_frame(self.ctx, frame.as_ptr()) };
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                break;
            }
            if ret < 0 {
                bail!("decoder receive failed: {}", av_err(ret));
            }

            if frame.pts() == NO_PTS {
                frame.set_pts(frame.best_effort_timestamp());
            }
            frame.set_time_base(self.time_base);
            unsafe {
                (*frame.as_ptr()).pict_type = AV_PICTURE_TYPE_NONE;
            }

            if frame.pts() != NO_PTS {
                if self.last_pts != NO_PTS && frame.pts() < self.last_pts {
                    warn!(
                        "stream {}: out-of-order picture pts {} after {}",
                        self.slot,
                        frame.pts(),
                        self.last_pts
                    );
                } else {
                    self.last_pts = frame.pts();
                }
            }

            if !out.push(DecodedFrame {
                frame,
                src_index: self.slot,
            }) {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        unsafe {
            avcodec_free_context(&mut self.ctx);
        }
    }
}

/// Stage 2: one decoder per input video stream; packets in, tagged raw
/// pictures out.
pub struct DecodeStage {
    decoders: HashMap<usize, StreamDecoder>,
    input: Arc<BoundedQueue<MediaPacket>>,
    output: Arc<BoundedQueue<DecodedFrame>>,
}

impl DecodeStage {
    pub fn new(
        streams: &[StreamParams],
        prefer_hw: bool,
        device: Option<&HwDevice>,
        input: Arc<BoundedQueue<MediaPacket>>,
        output: Arc<BoundedQueue<DecodedFrame>>,
    ) -> Result<Self> {
        let mut decoders = HashMap::new();
        for params in streams {
            let dec = StreamDecoder::open(params, prefer_hw, device)?;
            info!("decoder ready for stream slot {}", params.slot);
            decoders.insert(params.slot, dec);
        }
        Ok(Self {
            decoders,
            input,
            output,
        })
    }

    pub fn run(mut self) {
        while let Some(pkt) = self.input.pop() {
            let slot = pkt.stream_index().max(0) as usize;
            let Some(dec) = self.decoders.get_mut(&slot) else {
                // unknown stream: release and continue
                continue;
            };
            if let Err(e) = dec.send_and_drain(Some(&pkt), &self.output) {
                // transient per-packet failure; the packet is dropped
                error!("decode: {e:#}");
            }
        }
        for dec in self.decoders.values_mut() {
            if let Err(e) = dec.send_and_drain(None, &self.output) {
                error!("decode flush: {e:#}");
            }
        }
        self.output.stop();
    }
}
