use std::ptr;

use anyhow::{bail, Result};
use ffmpeg_sys_next::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA;
use ffmpeg_sys_next::AVPixelFormat::{AV_PIX_FMT_CUDA, AV_PIX_FMT_NONE, AV_PIX_FMT_NV12};
use ffmpeg_sys_next::{
    av_buffer_ref, av_buffer_unref, av_hwdevice_ctx_create, av_hwframe_ctx_alloc,
    av_hwframe_ctx_init, av_hwframe_get_buffer, av_hwframe_transfer_data, AVBufferRef,
    AVHWFramesContext, AVPixelFormat,
};
use log::info;

use crate::media::MediaFrame;
use crate::utils::av_err;

/// Shared hardware device context. Created once by the supervisor; decoder,
/// encoders and scalers take buffer references and never mutate it after
/// start.
pub struct HwDevice {
    ctx: *mut AVBufferRef,
}

unsafe impl Send for HwDevice {}
unsafe impl Sync for HwDevice {}

impl HwDevice {
    pub fn create() -> Result<Self> {
        let mut ctx = ptr::null_mut();
        let ret = unsafe {
            av_hwdevice_ctx_create(
                &mut ctx,
                AV_HWDEVICE_TYPE_CUDA,
                ptr::null(),
                ptr::null_mut(),
                0,
            )
        };
        if ret < 0 {
            bail!("failed to create hw device: {}", av_err(ret));
        }
        info!("hw device created");
        Ok(Self { ctx })
    }

    pub fn as_ptr(&self) -> *mut AVBufferRef {
        self.ctx
    }

    /// New buffer reference for a consumer context.
    pub fn new_ref(&self) -> *mut AVBufferRef {
        unsafe { av_buffer_ref(self.ctx) }
    }
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.ctx);
        }
    }
}

/// Shared frames context: pool + format descriptor for device frames. Must
/// outlive every consumer; FFmpeg buffer refcounting enforces that as long
/// as consumers hold references obtained through [HwFramesCtx::new_ref].
pub struct HwFramesCtx {
    ctx: *mut AVBufferRef,
}

unsafe impl Send for HwFramesCtx {}
unsafe impl Sync for HwFramesCtx {}

impl HwFramesCtx {
    pub fn alloc(
        device: &HwDevice,
        sw_format: AVPixelFormat,
        width: i32,
        height: i32,
        pool_size: i32,
    ) -> Result<Self> {
        unsafe {
            let mut ctx = av_hwframe_ctx_alloc(device.as_ptr());
            if ctx.is_null() {
                bail!("failed to allocate hw frames context");
            }
            let fctx = (*ctx).data as *mut AVHWFramesContext;
            (*fctx).format = AV_PIX_FMT_CUDA;
            (*fctx).sw_format = sw_format;
            (*fctx).width = width;
            (*fctx).height = height;
            (*fctx).initial_pool_size = pool_size;
            let ret = av_hwframe_ctx_init(ctx);
            if ret < 0 {
                av_buffer_unref(&mut ctx);
                bail!("failed to init hw frames context: {}", av_err(ret));
            }
            Ok(Self { ctx })
        }
    }

    pub fn as_ptr(&self) -> *mut AVBufferRef {
        self.ctx
    }

    pub fn new_ref(&self) -> *mut AVBufferRef {
        unsafe { av_buffer_ref(self.ctx) }
    }
}

impl Drop for HwFramesCtx {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.ctx);
        }
    }
}

/// Software format backing a device frame, read from its frames context
/// descriptor when present.
pub fn sw_format_of(frame: &MediaFrame) -> AVPixelFormat {
    unsafe {
        let hw = (*frame.as_ptr()).hw_frames_ctx;
        if !hw.is_null() {
            let fctx = (*hw).data as *const AVHWFramesContext;
            if !fctx.is_null() && (*fctx).sw_format != AV_PIX_FMT_NONE {
                return (*fctx).sw_format;
            }
        }
    }
    AV_PIX_FMT_NV12
}

/// Copy a device-resident picture into host memory.
pub fn transfer_to_sw(frame: &MediaFrame) -> Result<MediaFrame> {
    let mut sw = MediaFrame::alloc_video(sw_format_of(frame), frame.width(), frame.height())?;
    let ret = unsafe { av_hwframe_transfer_data(sw.as_ptr(), frame.as_ptr(), 0) };
    if ret < 0 {
        bail!("hw frame transfer failed: {}", av_err(ret));
    }
    sw.copy_props_from(frame)?;
    sw.set_pts(frame.pts());
    sw.set_time_base(frame.time_base());
    Ok(sw)
}

/// Upload a host picture into the device pool.
pub fn upload_to_hw(frames_ctx: &HwFramesCtx, frame: &MediaFrame) -> Result<MediaFrame> {
    let hw = MediaFrame::alloc()?;
    unsafe {
        let ret = av_hwframe_get_buffer(frames_ctx.as_ptr(), hw.as_ptr(), 0);
        if ret < 0 {
            bail!("failed to get device frame from pool: {}", av_err(ret));
        }
        let ret = av_hwframe_transfer_data(hw.as_ptr(), frame.as_ptr(), 0);
        if ret < 0 {
            bail!("hw frame upload failed: {}", av_err(ret));
        }
    }
    let mut hw = hw;
    hw.copy_props_from(frame)?;
    hw.set_pts(frame.pts());
    hw.set_time_base(frame.time_base());
    Ok(hw)
}
