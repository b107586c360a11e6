use std::mem::transmute;
use std::ptr;

use anyhow::{bail, Result};
use ffmpeg_sys_next::AVPixelFormat::AV_PIX_FMT_CUDA;
use ffmpeg_sys_next::{
    av_frame_alloc, av_frame_clone, av_frame_copy_props, av_frame_free, av_frame_get_buffer,
    av_packet_alloc, av_packet_clone, av_packet_free, av_packet_rescale_ts, AVFrame, AVPacket,
    AVPixelFormat, AV_PKT_FLAG_KEY,
};

use crate::timebase::{TimeBase, NO_PTS};

/// Owning wrapper around an `AVPacket`.
///
/// Exactly one stage owns a packet at a time; ownership moves with the value.
/// Dropping releases the packet and its payload reference.
pub struct MediaPacket {
    ptr: *mut AVPacket,
}

unsafe impl Send for MediaPacket {}
unsafe impl Sync for MediaPacket {}

impl MediaPacket {
    pub fn alloc() -> Result<Self> {
        let ptr = unsafe { av_packet_alloc() };
        if ptr.is_null() {
            bail!("failed to allocate packet");
        }
        Ok(Self { ptr })
    }

    /// Take ownership of a raw packet.
    ///
    /// # Safety
    /// `ptr` must be a valid packet not owned elsewhere.
    pub unsafe fn from_ptr(ptr: *mut AVPacket) -> Self {
        debug_assert!(!ptr.is_null());
        Self { ptr }
    }

    pub fn as_ptr(&self) -> *mut AVPacket {
        self.ptr
    }

    /// Reference-counted copy sharing the same payload.
    pub fn clone_ref(&self) -> Result<Self> {
        let ptr = unsafe { av_packet_clone(self.ptr) };
        if ptr.is_null() {
            bail!("failed to clone packet");
        }
        Ok(Self { ptr })
    }

    pub fn pts(&self) -> i64 {
        unsafe { (*self.ptr).pts }
    }

    pub fn set_pts(&mut self, pts: i64) {
        unsafe { (*self.ptr).pts = pts }
    }

    pub fn dts(&self) -> i64 {
        unsafe { (*self.ptr).dts }
    }

    pub fn set_dts(&mut self, dts: i64) {
        unsafe { (*self.ptr).dts = dts }
    }

    pub fn duration(&self) -> i64 {
        unsafe { (*self.ptr).duration }
    }

    pub fn set_duration(&mut self, duration: i64) {
        unsafe { (*self.ptr).duration = duration }
    }

    pub fn stream_index(&self) -> i32 {
        unsafe { (*self.ptr).stream_index }
    }

    pub fn set_stream_index(&mut self, index: i32) {
        unsafe { (*self.ptr).stream_index = index }
    }

    pub fn size(&self) -> usize {
        unsafe { (*self.ptr).size.max(0) as usize }
    }

    pub fn data(&self) -> &[u8] {
        unsafe {
            let p = self.ptr;
            if (*p).data.is_null() || (*p).size <= 0 {
                &[]
            } else {
                std::slice::from_raw_parts((*p).data, (*p).size as usize)
            }
        }
    }

    pub fn is_key(&self) -> bool {
        unsafe { (*self.ptr).flags & AV_PKT_FLAG_KEY as i32 != 0 }
    }

    /// Rescale pts, dts and duration in one operation.
    pub fn rescale_ts(&mut self, from: TimeBase, to: TimeBase) {
        unsafe { av_packet_rescale_ts(self.ptr, from.into(), to.into()) }
    }
}

impl Drop for MediaPacket {
    fn drop(&mut self) {
        unsafe {
            av_packet_free(&mut self.ptr);
            self.ptr = ptr::null_mut();
        }
    }
}

/// Owning wrapper around an `AVFrame` (a raw picture, host or device
/// resident).
///
/// Device frames keep their frames-context buffer reference alive for as
/// long as any clone of the frame exists, which is what lets consumers
/// outlive the stage that decoded them.
pub struct MediaFrame {
    ptr: *mut AVFrame,
}

unsafe impl Send for MediaFrame {}
unsafe impl Sync for MediaFrame {}

impl MediaFrame {
    pub fn alloc() -> Result<Self> {
        let ptr = unsafe { av_frame_alloc() };
        if ptr.is_null() {
            bail!("failed to allocate frame");
        }
        Ok(Self { ptr })
    }

    /// Allocate a writable video frame with its own buffers.
    pub fn alloc_video(format: AVPixelFormat, width: i32, height: i32) -> Result<Self> {
        let frame = Self::alloc()?;
        unsafe {
            (*frame.ptr).format = format as i32;
            (*frame.ptr).width = width;
            (*frame.ptr).height = height;
            let ret = av_frame_get_buffer(frame.ptr, 32);
            if ret < 0 {
                bail!("failed to allocate frame buffer: {}", crate::utils::av_err(ret));
            }
        }
        Ok(frame)
    }

    /// Take ownership of a raw frame.
    ///
    /// # Safety
    /// `ptr` must be a valid frame not owned elsewhere.
    pub unsafe fn from_ptr(ptr: *mut AVFrame) -> Self {
        debug_assert!(!ptr.is_null());
        Self { ptr }
    }

    pub fn as_ptr(&self) -> *mut AVFrame {
        self.ptr
    }

    /// Reference-counted clone sharing the same pixel buffers.
    pub fn clone_ref(&self) -> Result<Self> {
        let ptr = unsafe { av_frame_clone(self.ptr) };
        if ptr.is_null() {
            bail!("failed to clone frame");
        }
        Ok(Self { ptr })
    }

    pub fn width(&self) -> i32 {
        unsafe { (*self.ptr).width }
    }

    pub fn height(&self) -> i32 {
        unsafe { (*self.ptr).height }
    }

    pub fn format(&self) -> i32 {
        unsafe { (*self.ptr).format }
    }

    pub fn pix_fmt(&self) -> AVPixelFormat {
        unsafe { transmute((*self.ptr).format) }
    }

    /// Device-resident picture (the distinguished "device" pixel format).
    pub fn is_hw(&self) -> bool {
        self.format() == AV_PIX_FMT_CUDA as i32
    }

    pub fn pts(&self) -> i64 {
        unsafe { (*self.ptr).pts }
    }

    pub fn set_pts(&mut self, pts: i64) {
        unsafe { (*self.ptr).pts = pts }
    }

    pub fn duration(&self) -> i64 {
        #[cfg(ffmpeg_6_0)]
        unsafe {
            (*self.ptr).duration
        }
        #[cfg(not(ffmpeg_6_0))]
        unsafe {
            (*self.ptr).pkt_duration
        }
    }

    pub fn set_duration(&mut self, duration: i64) {
        #[cfg(ffmpeg_6_0)]
        unsafe {
            (*self.ptr).duration = duration
        }
        #[cfg(not(ffmpeg_6_0))]
        unsafe {
            (*self.ptr).pkt_duration = duration
        }
    }

    pub fn best_effort_timestamp(&self) -> i64 {
        unsafe { (*self.ptr).best_effort_timestamp }
    }

    pub fn has_pts(&self) -> bool {
        self.pts() != NO_PTS
    }

    pub fn time_base(&self) -> TimeBase {
        unsafe { (*self.ptr).time_base.into() }
    }

    pub fn set_time_base(&mut self, tb: TimeBase) {
        unsafe { (*self.ptr).time_base = tb.into() }
    }

    pub fn copy_props_from(&mut self, src: &MediaFrame) -> Result<()> {
        let ret = unsafe { av_frame_copy_props(self.ptr, src.ptr) };
        if ret < 0 {
            bail!("failed to copy frame props: {}", crate::utils::av_err(ret));
        }
        Ok(())
    }

    pub fn linesize(&self, plane: usize) -> usize {
        unsafe { (*self.ptr).linesize[plane].max(0) as usize }
    }

    /// Borrow `rows` rows of a plane as a byte slice. Only meaningful for
    /// host-resident frames with positive strides.
    pub fn plane(&self, plane: usize, rows: usize) -> &[u8] {
        unsafe {
            let stride = (*self.ptr).linesize[plane];
            debug_assert!(stride > 0, "negative stride plane access");
            std::slice::from_raw_parts((*self.ptr).data[plane], stride as usize * rows)
        }
    }

    pub fn plane_mut(&mut self, plane: usize, rows: usize) -> &mut [u8] {
        unsafe {
            let stride = (*self.ptr).linesize[plane];
            debug_assert!(stride > 0, "negative stride plane access");
            std::slice::from_raw_parts_mut((*self.ptr).data[plane], stride as usize * rows)
        }
    }
}

impl Drop for MediaFrame {
    fn drop(&mut self) {
        unsafe {
            av_frame_free(&mut self.ptr);
            self.ptr = ptr::null_mut();
        }
    }
}

/// A decoded picture tagged with the source stream slot it came from, so
/// transforms that multiplex several inputs can route it.
pub struct DecodedFrame {
    pub frame: MediaFrame,
    pub src_index: usize,
}

/// An encoded packet tagged with the rendition that produced it.
pub struct EncodedPacket {
    pub packet: MediaPacket,
    pub rendition: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_sys_next::AVPixelFormat::AV_PIX_FMT_YUV420P;

    #[test]
    fn alloc_video_frame() {
        let mut f = MediaFrame::alloc_video(AV_PIX_FMT_YUV420P, 64, 36).unwrap();
        assert_eq!(f.width(), 64);
        assert_eq!(f.height(), 36);
        assert!(!f.is_hw());
        assert!(f.linesize(0) >= 64);
        f.plane_mut(0, 36).fill(0x10);
        assert_eq!(f.plane(0, 36)[0], 0x10);
    }

    #[test]
    fn frame_clone_shares_buffers() {
        let mut f = MediaFrame::alloc_video(AV_PIX_FMT_YUV420P, 32, 16).unwrap();
        f.plane_mut(0, 16).fill(0x42);
        let c = f.clone_ref().unwrap();
        assert_eq!(c.width(), 32);
        assert_eq!(c.plane(0, 16)[5], 0x42);
        unsafe {
            assert_eq!((*c.as_ptr()).data[0], (*f.as_ptr()).data[0]);
        }
    }

    #[test]
    fn packet_ts_fields() {
        let mut p = MediaPacket::alloc().unwrap();
        p.set_pts(100);
        p.set_dts(90);
        p.set_duration(10);
        p.set_stream_index(2);
        assert_eq!(p.pts(), 100);
        assert_eq!(p.dts(), 90);
        assert_eq!(p.duration(), 10);
        assert_eq!(p.stream_index(), 2);
        assert!(!p.is_key());
    }
}
