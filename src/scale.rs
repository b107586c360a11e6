use std::ffi::{CStr, CString};
use std::mem::transmute;
use std::ptr;

use anyhow::{bail, Result};
use ffmpeg_sys_next::AVPixelFormat::AV_PIX_FMT_CUDA;
use ffmpeg_sys_next::{
    av_buffer_ref, av_buffersink_get_frame, av_buffersrc_add_frame_flags,
    av_buffersrc_parameters_alloc, av_buffersrc_parameters_set, av_free, av_get_pix_fmt_name,
    avfilter_get_by_name, avfilter_graph_alloc, avfilter_graph_config,
    avfilter_graph_create_filter, avfilter_graph_free, avfilter_graph_parse_ptr,
    avfilter_inout_alloc, av_strdup, sws_freeContext, sws_getContext, sws_scale_frame,
    AVFilterContext, AVFilterGraph, AVPixelFormat, SwsContext, AVERROR, AVERROR_EOF,
    AV_BUFFERSRC_FLAG_KEEP_REF, SWS_BILINEAR,
};
use libc::EAGAIN;
use log::debug;

use crate::media::MediaFrame;
use crate::utils::av_err;

/// Full parameter tuple a scaler context is built for. A mismatch on any
/// field evicts the old context and builds a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScalerKey {
    src_w: i32,
    src_h: i32,
    src_fmt: i32,
    dst_w: i32,
    dst_h: i32,
    dst_fmt: i32,
}

/// Cached bilinear software scaler/converter.
pub struct Scaler {
    ctx: *mut SwsContext,
    key: Option<ScalerKey>,
}

unsafe impl Send for Scaler {}

impl Default for Scaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scaler {
    pub fn new() -> Self {
        Self {
            ctx: ptr::null_mut(),
            key: None,
        }
    }

    fn ensure(&mut self, key: ScalerKey) -> Result<()> {
        if self.key == Some(key) && !self.ctx.is_null() {
            return Ok(());
        }
        unsafe {
            if !self.ctx.is_null() {
                sws_freeContext(self.ctx);
                self.ctx = ptr::null_mut();
            }
            let ctx = sws_getContext(
                key.src_w,
                key.src_h,
                transmute(key.src_fmt),
                key.dst_w,
                key.dst_h,
                transmute(key.dst_fmt),
                SWS_BILINEAR as libc::c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            );
            if ctx.is_null() {
                bail!(
                    "failed to create scaler context {}x{} -> {}x{}",
                    key.src_w,
                    key.src_h,
                    key.dst_w,
                    key.dst_h
                );
            }
            debug!(
                "scaler config: {}x{}@{} => {}x{}@{}",
                key.src_w,
                key.src_h,
                pix_fmt_name(key.src_fmt),
                key.dst_w,
                key.dst_h,
                pix_fmt_name(key.dst_fmt),
            );
            self.ctx = ctx;
        }
        self.key = Some(key);
        Ok(())
    }

    /// Scale/convert `src` into a new frame of the given size and format.
    /// Timestamps and stream props carry over.
    pub fn process(
        &mut self,
        src: &MediaFrame,
        dst_w: i32,
        dst_h: i32,
        dst_fmt: AVPixelFormat,
    ) -> Result<MediaFrame> {
        self.ensure(ScalerKey {
            src_w: src.width(),
            src_h: src.height(),
            src_fmt: src.format(),
            dst_w,
            dst_h,
            dst_fmt: dst_fmt as i32,
        })?;

        let mut dst = MediaFrame::alloc()?;
        dst.copy_props_from(src)?;
        let ret = unsafe { sws_scale_frame(self.ctx, dst.as_ptr(), src.as_ptr()) };
        if ret < 0 {
            bail!("scaler failed: {}", av_err(ret));
        }
        dst.set_pts(src.pts());
        dst.set_time_base(src.time_base());
        dst.set_duration(src.duration());
        Ok(dst)
    }
}

impl Drop for Scaler {
    fn drop(&mut self) {
        unsafe {
            sws_freeContext(self.ctx);
            self.ctx = ptr::null_mut();
        }
    }
}

/// Device-side rescale graph (`scale_cuda`) for device-resident input going
/// to an encoder that expects device frames. Rebuilt when the input
/// dimensions change; the stale graph is freed first.
pub struct GpuScaler {
    graph: *mut AVFilterGraph,
    src: *mut AVFilterContext,
    sink: *mut AVFilterContext,
    in_dims: Option<(i32, i32)>,
    out_w: i32,
    out_h: i32,
}

unsafe impl Send for GpuScaler {}

impl GpuScaler {
    pub fn new(out_w: i32, out_h: i32) -> Self {
        Self {
            graph: ptr::null_mut(),
            src: ptr::null_mut(),
            sink: ptr::null_mut(),
            in_dims: None,
            out_w,
            out_h,
        }
    }

    unsafe fn rebuild(&mut self, frame: &MediaFrame) -> Result<()> {
        self.in_dims = None;
        if !self.graph.is_null() {
            avfilter_graph_free(&mut self.graph);
            self.src = ptr::null_mut();
            self.sink = ptr::null_mut();
        }
        let graph = avfilter_graph_alloc();
        if graph.is_null() {
            bail!("failed to allocate filter graph");
        }
        // owned immediately: a failure below leaves a half-built graph that
        // the next rebuild or Drop frees
        self.graph = graph;

        let tb = frame.time_base();
        let (tb_num, tb_den) = if tb.den > 0 { (tb.num, tb.den) } else { (1, 90_000) };
        let args = CString::new(format!(
            "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect=1/1",
            frame.width(),
            frame.height(),
            AV_PIX_FMT_CUDA as i32,
            tb_num,
            tb_den,
        ))?;
        let mut src = ptr::null_mut();
        let ret = avfilter_graph_create_filter(
            &mut src,
            avfilter_get_by_name(c"buffer".as_ptr()),
            c"in".as_ptr(),
            args.as_ptr(),
            ptr::null_mut(),
            graph,
        );
        if ret < 0 {
            bail!("failed to create buffer source: {}", av_err(ret));
        }

        let par = av_buffersrc_parameters_alloc();
        if par.is_null() {
            bail!("failed to allocate buffer source parameters");
        }
        (*par).format = AV_PIX_FMT_CUDA as i32;
        (*par).hw_frames_ctx = av_buffer_ref((*frame.as_ptr()).hw_frames_ctx);
        let ret = av_buffersrc_parameters_set(src, par);
        av_free(par as *mut libc::c_void);
        if ret < 0 {
            bail!("failed to set buffer source parameters: {}", av_err(ret));
        }

        let mut sink = ptr::null_mut();
        let ret = avfilter_graph_create_filter(
            &mut sink,
            avfilter_get_by_name(c"buffersink".as_ptr()),
            c"out".as_ptr(),
            ptr::null(),
            ptr::null_mut(),
            graph,
        );
        if ret < 0 {
            bail!("failed to create buffer sink: {}", av_err(ret));
        }

        let mut outputs = avfilter_inout_alloc();
        let mut inputs = avfilter_inout_alloc();
        if outputs.is_null() || inputs.is_null() {
            bail!("failed to allocate filter graph endpoints");
        }
        (*outputs).name = av_strdup(c"in".as_ptr());
        (*outputs).filter_ctx = src;
        (*outputs).pad_idx = 0;
        (*outputs).next = ptr::null_mut();

        (*inputs).name = av_strdup(c"out".as_ptr());
        (*inputs).filter_ctx = sink;
        (*inputs).pad_idx = 0;
        (*inputs).next = ptr::null_mut();

        let desc = CString::new(format!("scale_cuda={}:{}", self.out_w, self.out_h))?;
        let ret = avfilter_graph_parse_ptr(
            graph,
            desc.as_ptr(),
            &mut inputs,
            &mut outputs,
            ptr::null_mut(),
        );
        if ret < 0 {
            bail!("failed to parse scale graph: {}", av_err(ret));
        }
        let ret = avfilter_graph_config(graph, ptr::null_mut());
        if ret < 0 {
            bail!("failed to configure scale graph: {}", av_err(ret));
        }

        debug!(
            "gpu scaler: {}x{} => {}x{}",
            frame.width(),
            frame.height(),
            self.out_w,
            self.out_h
        );
        self.src = src;
        self.sink = sink;
        self.in_dims = Some((frame.width(), frame.height()));
        Ok(())
    }

    pub fn process(&mut self, frame: &MediaFrame) -> Result<MediaFrame> {
        unsafe {
            if self.in_dims != Some((frame.width(), frame.height())) || self.graph.is_null() {
                self.rebuild(frame)?;
            }
            let ret = av_buffersrc_add_frame_flags(
                self.src,
                frame.as_ptr(),
                AV_BUFFERSRC_FLAG_KEEP_REF as i32,
            );
            if ret < 0 {
                bail!("gpu scaler submit failed: {}", av_err(ret));
            }
            let out = MediaFrame::alloc()?;
            let ret = av_buffersink_get_frame(self.sink, out.as_ptr());
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                bail!("gpu scaler produced no frame");
            }
            if ret < 0 {
                bail!("gpu scaler drain failed: {}", av_err(ret));
            }
            let mut out = out;
            out.set_time_base(frame.time_base());
            out.set_duration(frame.duration());
            Ok(out)
        }
    }
}

impl Drop for GpuScaler {
    fn drop(&mut self) {
        unsafe {
            avfilter_graph_free(&mut self.graph);
        }
    }
}

fn pix_fmt_name(fmt: i32) -> String {
    unsafe {
        let name = av_get_pix_fmt_name(transmute(fmt));
        if name.is_null() {
            format!("fmt{}", fmt)
        } else {
            CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_sys_next::AVPixelFormat::{AV_PIX_FMT_RGB24, AV_PIX_FMT_YUV420P};

    #[test]
    fn downscale_keeps_format_and_timestamps() {
        let mut src = MediaFrame::alloc_video(AV_PIX_FMT_YUV420P, 64, 36).unwrap();
        src.plane_mut(0, 36).fill(0x80);
        src.plane_mut(1, 18).fill(0x80);
        src.plane_mut(2, 18).fill(0x80);
        src.set_pts(42);

        let mut sws = Scaler::new();
        let dst = sws.process(&src, 32, 18, AV_PIX_FMT_YUV420P).unwrap();
        assert_eq!(dst.width(), 32);
        assert_eq!(dst.height(), 18);
        assert_eq!(dst.format(), AV_PIX_FMT_YUV420P as i32);
        assert_eq!(dst.pts(), 42);
    }

    #[test]
    fn convert_and_rebuild_on_parameter_change() {
        let mut src = MediaFrame::alloc_video(AV_PIX_FMT_YUV420P, 64, 36).unwrap();
        src.plane_mut(0, 36).fill(0x40);
        src.plane_mut(1, 18).fill(0x80);
        src.plane_mut(2, 18).fill(0x80);

        let mut sws = Scaler::new();
        let rgb = sws.process(&src, 16, 16, AV_PIX_FMT_RGB24).unwrap();
        assert_eq!(rgb.format(), AV_PIX_FMT_RGB24 as i32);

        // different target size forces a rebuild of the cached context
        let rgb2 = sws.process(&src, 8, 8, AV_PIX_FMT_RGB24).unwrap();
        assert_eq!(rgb2.width(), 8);
    }
}
