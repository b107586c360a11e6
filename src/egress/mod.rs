use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ffmpeg_sys_next::{
    av_dict_free, av_dict_set, av_interleaved_write_frame, av_write_trailer,
    avcodec_parameters_from_context, avformat_alloc_output_context2, avformat_free_context,
    avformat_new_stream, avformat_write_header, avio_closep, avio_open2, AVCodecContext,
    AVDictionary, AVFormatContext, AVIO_FLAG_WRITE,
};
use log::{error, info, warn};

use crate::media::EncodedPacket;
use crate::pipeline::{OutputConfig, PipelineConfig};
use crate::queue::BoundedQueue;
use crate::settings::OutputKind;
use crate::timebase::TimeBase;
use crate::utils::av_err;

use crate::encode::ENCODER_TIME_BASE;

/// MPEG-TS muxer for one rendition.
struct OutputMuxer {
    ctx: *mut AVFormatContext,
    stream_index: i32,
    stream_tb: TimeBase,
    url: String,
    kind: OutputKind,
    closed: bool,
}

unsafe impl Send for OutputMuxer {}

unsafe fn set_dict(dict: *mut *mut AVDictionary, key: &CStr, value: &CStr) {
    av_dict_set(dict, key.as_ptr(), value.as_ptr(), 0);
}

impl OutputMuxer {
    /// Open the container, its I/O and write the header. Transport-stream
    /// defaults: PAT/PMT every 0.5s, PCR every 20ms, header resend on key
    /// frames, initial discontinuity flagged.
    fn open(
        out: &OutputConfig,
        enc_ctx: *mut AVCodecContext,
        framerate: TimeBase,
    ) -> Result<Self> {
        let c_url = CString::new(out.url.as_str()).context("output url contains NUL")?;
        unsafe {
            let mut ctx = ptr::null_mut();
            let ret = avformat_alloc_output_context2(
                &mut ctx,
                ptr::null(),
                c"mpegts".as_ptr(),
                c_url.as_ptr(),
            );
            if ret < 0 || ctx.is_null() {
                bail!("failed to create muxer for {}: {}", out.url, av_err(ret));
            }

            let stream = avformat_new_stream(ctx, ptr::null());
            if stream.is_null() {
                avformat_free_context(ctx);
                bail!("failed to create output stream for {}", out.url);
            }
            let ret = avcodec_parameters_from_context((*stream).codecpar, enc_ctx);
            if ret < 0 {
                avformat_free_context(ctx);
                bail!("failed to copy encoder parameters: {}", av_err(ret));
            }
            (*stream).time_base = ENCODER_TIME_BASE.into();
            (*stream).avg_frame_rate = framerate.into();

            let mut io_opts: *mut AVDictionary = ptr::null_mut();
            let pairs: [(&CStr, &CStr); 4] = [
                (c"reuse", c"1"),
                (c"pkt_size", c"1316"),
                (c"buffer_size", c"1048576"),
                (c"fifo_size", c"524288"),
            ];
            for (k, v) in pairs {
                set_dict(&mut io_opts, k, v);
            }
            let ret = avio_open2(
                &mut (*ctx).pb,
                c_url.as_ptr(),
                AVIO_FLAG_WRITE,
                ptr::null(),
                &mut io_opts,
            );
            av_dict_free(&mut io_opts);
            if ret < 0 {
                avformat_free_context(ctx);
                bail!("failed to open output {}: {}", out.url, av_err(ret));
            }

            let mut mux_opts: *mut AVDictionary = ptr::null_mut();
            let pairs: [(&CStr, &CStr); 6] = [
                (c"mpegts_flags", c"+resend_headers+initial_discontinuity"),
                (c"pat_period", c"0.5"),
                (c"pmt_period", c"0.5"),
                (c"pcr_period", c"20"),
                (c"flush_packets", c"1"),
                (c"mpegts_copyts", c"1"),
            ];
            for (k, v) in pairs {
                set_dict(&mut mux_opts, k, v);
            }
            let ret = avformat_write_header(ctx, &mut mux_opts);
            av_dict_free(&mut mux_opts);
            if ret < 0 {
                avio_closep(&mut (*ctx).pb);
                avformat_free_context(ctx);
                bail!("failed to write header for {}: {}", out.url, av_err(ret));
            }

            info!("egress open: {}", out.url);
            Ok(Self {
                ctx,
                stream_index: (*stream).index,
                // the muxer may adjust the stream time base during header
                // write; rescale against what it settled on
                stream_tb: (*stream).time_base.into(),
                url: out.url.clone(),
                kind: out.kind,
                closed: false,
            })
        }
    }

    fn write(&mut self, mut item: EncodedPacket) {
        item.packet.set_stream_index(self.stream_index);
        item.packet.rescale_ts(ENCODER_TIME_BASE, self.stream_tb);
        let ret = unsafe { av_interleaved_write_frame(self.ctx, item.packet.as_ptr()) };
        if ret < 0 {
            // transient on datagram-style transports; the frame is dropped
            match self.kind {
                OutputKind::Srt => error!("egress write failed ({}): {}", self.url, av_err(ret)),
                OutputKind::File => warn!("egress write failed ({}): {}", self.url, av_err(ret)),
            }
        }
    }

    /// Trailer + I/O flush + close.
    fn finish(&mut self) {
        if self.closed {
            return;
        }
        unsafe {
            let ret = av_write_trailer(self.ctx);
            if ret < 0 {
                error!("egress trailer failed ({}): {}", self.url, av_err(ret));
            }
            avio_closep(&mut (*self.ctx).pb);
        }
        self.closed = true;
        info!("egress closed: {}", self.url);
    }
}

impl Drop for OutputMuxer {
    fn drop(&mut self) {
        unsafe {
            if !self.closed && !self.ctx.is_null() {
                avio_closep(&mut (*self.ctx).pb);
            }
            avformat_free_context(self.ctx);
            self.ctx = ptr::null_mut();
        }
    }
}

/// Stage 5: rescale timestamps to each container's stream time base and do
/// the interleaved writes; trailers are written when the encoded queue
/// drains.
pub struct EgressStage {
    muxers: Vec<OutputMuxer>,
    input: Arc<BoundedQueue<EncodedPacket>>,
}

impl EgressStage {
    /// One muxer per rendition, in rendition order.
    pub fn open(
        cfg: &PipelineConfig,
        encoders: &[*mut AVCodecContext],
        input: Arc<BoundedQueue<EncodedPacket>>,
    ) -> Result<Self> {
        if cfg.outputs.len() != encoders.len() {
            bail!(
                "outputs ({}) do not match encoders ({})",
                cfg.outputs.len(),
                encoders.len()
            );
        }
        let mut muxers = Vec::with_capacity(cfg.outputs.len());
        for (out, &enc) in cfg.outputs.iter().zip(encoders) {
            muxers.push(OutputMuxer::open(out, enc, cfg.framerate)?);
        }
        Ok(Self { muxers, input })
    }

    pub fn run(mut self) {
        while let Some(item) = self.input.pop() {
            match self.muxers.get_mut(item.rendition) {
                Some(muxer) => muxer.write(item),
                None => warn!("packet for unknown rendition {}", item.rendition),
            }
        }
        for muxer in &mut self.muxers {
            muxer.finish();
        }
    }
}
