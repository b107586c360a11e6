use anyhow::Result;
use ffmpeg_sys_next::AVPixelFormat::AV_PIX_FMT_YUV420P;

use crate::hwaccel::transfer_to_sw;
use crate::media::{DecodedFrame, MediaFrame};
use crate::pipeline::CompositeConfig;
use crate::scale::Scaler;
use crate::timebase::TimeBase;

/// Pad color behind the composed views, #001219 in BT.601.
const BG_Y: u8 = 13;
const BG_U: u8 = 134;
const BG_V: u8 = 118;

pub const SLOTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// One main region plus three thumbnails on the canvas.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub main: Region,
    pub thumbs: [Region; SLOTS - 1],
}

fn even(v: i32) -> i32 {
    v & !1
}

impl Layout {
    /// Reference geometry is defined on a 3840x2160 canvas and scaled
    /// proportionally, snapped to even coordinates for 4:2:0 planes.
    pub fn for_canvas(w: i32, h: i32) -> Self {
        let sx = |v: i32| even((v as i64 * w as i64 / 3840) as i32);
        let sy = |v: i32| even((v as i64 * h as i64 / 2160) as i32);
        Layout {
            main: Region {
                x: sx(240),
                y: sy(160),
                w: sx(2496),
                h: sy(1404),
            },
            thumbs: [
                Region {
                    x: sx(2816),
                    y: sy(160),
                    w: sx(784),
                    h: sy(440),
                },
                Region {
                    x: sx(2816),
                    y: sy(642),
                    w: sx(784),
                    h: sy(440),
                },
                Region {
                    x: sx(2816),
                    y: sy(1124),
                    w: sx(784),
                    h: sy(440),
                },
            ],
        }
    }
}

/// Multi-view compositor: up to four input slots scaled into fixed canvas
/// regions. The main slot drives emission; late thumbnails repeat their last
/// picture.
pub struct Compositor {
    layout: Layout,
    canvas_w: i32,
    canvas_h: i32,
    main_index: usize,
    framerate: TimeBase,
    scalers: Vec<Scaler>,
    /// Last picture per slot, already scaled to its region
    latest: Vec<Option<MediaFrame>>,
}

impl Compositor {
    pub fn new(cfg: &CompositeConfig) -> Self {
        Self {
            layout: Layout::for_canvas(cfg.canvas_w, cfg.canvas_h),
            canvas_w: cfg.canvas_w,
            canvas_h: cfg.canvas_h,
            main_index: cfg.main_index.min(SLOTS - 1),
            framerate: cfg.framerate,
            scalers: (0..SLOTS).map(|_| Scaler::new()).collect(),
            latest: (0..SLOTS).map(|_| None).collect(),
        }
    }

    /// Canvas region a slot renders into. Thumbnails are assigned in slot
    /// order, skipping the main slot.
    fn region_for_slot(&self, slot: usize) -> Region {
        if slot == self.main_index {
            return self.layout.main;
        }
        let mut thumb = 0;
        for s in 0..SLOTS {
            if s == self.main_index {
                continue;
            }
            if s == slot {
                return self.layout.thumbs[thumb];
            }
            thumb += 1;
        }
        self.layout.thumbs[0]
    }

    pub fn apply(&mut self, input: DecodedFrame) -> Result<Vec<DecodedFrame>> {
        let slot = input.src_index.min(SLOTS - 1);
        let frame = if input.frame.is_hw() {
            transfer_to_sw(&input.frame)?
        } else {
            input.frame
        };
        let region = self.region_for_slot(slot);
        let scaled = self.scalers[slot].process(&frame, region.w, region.h, AV_PIX_FMT_YUV420P)?;
        self.latest[slot] = Some(scaled);

        if slot != self.main_index {
            return Ok(vec![]);
        }

        let mut canvas = MediaFrame::alloc_video(AV_PIX_FMT_YUV420P, self.canvas_w, self.canvas_h)?;
        fill_yuv420(&mut canvas, BG_Y, BG_U, BG_V);
        for s in 0..SLOTS {
            if let Some(pic) = &self.latest[s] {
                blit_yuv420(&mut canvas, self.region_for_slot(s), pic);
            }
        }
        canvas.set_pts(frame.pts());
        canvas.set_time_base(frame.time_base());
        canvas.set_duration(if frame.duration() > 0 {
            frame.duration()
        } else {
            frame.time_base().ticks_per_frame(self.framerate)
        });
        Ok(vec![DecodedFrame {
            frame: canvas,
            src_index: 0,
        }])
    }
}

fn fill_yuv420(frame: &mut MediaFrame, y: u8, u: u8, v: u8) {
    let h = frame.height() as usize;
    let ch = h / 2;
    frame.plane_mut(0, h).fill(y);
    frame.plane_mut(1, ch).fill(u);
    frame.plane_mut(2, ch).fill(v);
}

fn blit_yuv420(dst: &mut MediaFrame, region: Region, src: &MediaFrame) {
    let (x, y) = (region.x as usize, region.y as usize);
    let (w, h) = (src.width() as usize, src.height() as usize);
    let d0 = dst.linesize(0);
    let d1 = dst.linesize(1);
    let d2 = dst.linesize(2);
    blit_plane(
        dst.plane_mut(0, region.y as usize + h),
        d0,
        x,
        y,
        src.plane(0, h),
        src.linesize(0),
        w,
        h,
    );
    blit_plane(
        dst.plane_mut(1, (region.y as usize + h) / 2),
        d1,
        x / 2,
        y / 2,
        src.plane(1, h / 2),
        src.linesize(1),
        w / 2,
        h / 2,
    );
    blit_plane(
        dst.plane_mut(2, (region.y as usize + h) / 2),
        d2,
        x / 2,
        y / 2,
        src.plane(2, h / 2),
        src.linesize(2),
        w / 2,
        h / 2,
    );
}

/// Copy a w*h block from `src` to `dst` at (x,y), both with row strides.
pub(crate) fn blit_plane(
    dst: &mut [u8],
    dst_stride: usize,
    x: usize,
    y: usize,
    src: &[u8],
    src_stride: usize,
    w: usize,
    h: usize,
) {
    for row in 0..h {
        let d = (y + row) * dst_stride + x;
        let s = row * src_stride;
        dst[d..d + w].copy_from_slice(&src[s..s + w]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_layout_on_4k_canvas() {
        let l = Layout::for_canvas(3840, 2160);
        assert_eq!(
            l.main,
            Region {
                x: 240,
                y: 160,
                w: 2496,
                h: 1404
            }
        );
        assert_eq!(l.thumbs[0], Region { x: 2816, y: 160, w: 784, h: 440 });
        assert_eq!(l.thumbs[1], Region { x: 2816, y: 642, w: 784, h: 440 });
        assert_eq!(l.thumbs[2], Region { x: 2816, y: 1124, w: 784, h: 440 });
    }

    #[test]
    fn layout_scales_and_stays_even() {
        let l = Layout::for_canvas(1920, 1080);
        for r in [l.main, l.thumbs[0], l.thumbs[1], l.thumbs[2]] {
            assert_eq!(r.x % 2, 0);
            assert_eq!(r.y % 2, 0);
            assert_eq!(r.w % 2, 0);
            assert_eq!(r.h % 2, 0);
            assert!(r.x + r.w <= 1920);
            assert!(r.y + r.h <= 1080);
        }
        assert_eq!(l.main.w, 1248);
        assert_eq!(l.main.h, 702);
    }

    #[test]
    fn blit_copies_block() {
        let mut dst = vec![0u8; 8 * 8];
        let src = vec![9u8; 2 * 2];
        blit_plane(&mut dst, 8, 2, 3, &src, 2, 2, 2);
        assert_eq!(dst[3 * 8 + 2], 9);
        assert_eq!(dst[3 * 8 + 3], 9);
        assert_eq!(dst[4 * 8 + 2], 9);
        assert_eq!(dst[4 * 8 + 3], 9);
        assert_eq!(dst[3 * 8 + 1], 0);
        assert_eq!(dst[2 * 8 + 2], 0);
        assert_eq!(dst[5 * 8 + 3], 0);
    }

    #[test]
    fn thumb_assignment_skips_main_slot() {
        let cfg = CompositeConfig {
            canvas_w: 3840,
            canvas_h: 2160,
            main_index: 1,
            framerate: TimeBase::new(60, 1),
        };
        let c = Compositor::new(&cfg);
        assert_eq!(c.region_for_slot(1), c.layout.main);
        assert_eq!(c.region_for_slot(0), c.layout.thumbs[0]);
        assert_eq!(c.region_for_slot(2), c.layout.thumbs[1]);
        assert_eq!(c.region_for_slot(3), c.layout.thumbs[2]);
    }
}
