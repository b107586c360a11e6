use std::collections::HashMap;
use std::ffi::CString;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ffmpeg_sys_next::AVMediaType::AVMEDIA_TYPE_VIDEO;
use ffmpeg_sys_next::{
    av_gettime_relative, av_read_frame, avcodec_parameters_alloc, avcodec_parameters_copy,
    avcodec_parameters_free, avformat_alloc_context, avformat_close_input,
    avformat_find_stream_info, avformat_open_input, AVCodecID, AVCodecParameters,
    AVFormatContext, AVERROR_EOF,
};
use log::{error, info, warn};

use crate::media::MediaPacket;
use crate::pipeline::{FaultSlot, PipelineConfig};
use crate::queue::BoundedQueue;
use crate::timebase::TimeBase;
use crate::utils::av_err;

/// State consulted by the blocking-I/O interrupt predicate.
///
/// The format layer polls [interrupt_cb] during blocking reads and opens;
/// the predicate fires when no I/O completed within the timeout, or when the
/// session was cancelled.
pub struct InterruptState {
    last_io_us: AtomicI64,
    timeout_us: i64,
    cancelled: AtomicBool,
}

impl InterruptState {
    pub fn new(timeout: Duration) -> Arc<Self> {
        let s = Arc::new(Self {
            last_io_us: AtomicI64::new(0),
            timeout_us: timeout.as_micros() as i64,
            cancelled: AtomicBool::new(false),
        });
        s.touch();
        s
    }

    /// Record a successful I/O completion.
    pub fn touch(&self) {
        self.last_io_us
            .store(unsafe { av_gettime_relative() }, Ordering::Relaxed);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

unsafe extern "C" fn interrupt_cb(opaque: *mut libc::c_void) -> libc::c_int {
    let state = &*(opaque as *const InterruptState);
    if state.is_cancelled() {
        return 1;
    }
    let now = av_gettime_relative();
    if now - state.last_io_us.load(Ordering::Relaxed) > state.timeout_us {
        1
    } else {
        0
    }
}

/// Owned copy of one input video stream's codec parameters, detached from
/// the format context so the decode stage can outlive source swaps.
pub struct StreamParams {
    /// Stream index in the source it was discovered in
    pub index: i32,
    /// Logical video slot (0..n), stable across failover
    pub slot: usize,
    par: *mut AVCodecParameters,
    pub time_base: TimeBase,
    pub framerate: TimeBase,
}

unsafe impl Send for StreamParams {}

impl StreamParams {
    pub fn codecpar(&self) -> *const AVCodecParameters {
        self.par
    }

    pub fn codec_id(&self) -> AVCodecID {
        unsafe { (*self.par).codec_id }
    }
}

impl Drop for StreamParams {
    fn drop(&mut self) {
        unsafe {
            avcodec_parameters_free(&mut self.par);
        }
    }
}

/// One opened input source.
struct Source {
    ctx: *mut AVFormatContext,
    url: String,
    /// source stream index -> logical slot
    video_map: HashMap<i32, usize>,
}

unsafe impl Send for Source {}

impl Source {
    /// Open a source with the interrupt predicate installed before the open,
    /// so a dead remote cannot stall initialization either.
    fn open(url: &str, interrupt: &Arc<InterruptState>) -> Result<Self> {
        let c_url = CString::new(url).context("input url contains NUL")?;
        unsafe {
            let mut ctx = avformat_alloc_context();
            if ctx.is_null() {
                bail!("failed to allocate format context");
            }
            (*ctx).interrupt_callback.callback = Some(interrupt_cb);
            (*ctx).interrupt_callback.opaque = Arc::as_ptr(interrupt) as *mut libc::c_void;

            interrupt.touch();
            let ret = avformat_open_input(&mut ctx, c_url.as_ptr(), ptr::null(), ptr::null_mut());
            if ret < 0 {
                bail!("failed to open input {}: {}", url, av_err(ret));
            }
            let ret = avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                avformat_close_input(&mut ctx);
                bail!("failed to probe input {}: {}", url, av_err(ret));
            }

            let mut video_map = HashMap::new();
            for i in 0..(*ctx).nb_streams {
                let stream = *(*ctx).streams.add(i as usize);
                if (*(*stream).codecpar).codec_type == AVMEDIA_TYPE_VIDEO {
                    let slot = video_map.len();
                    video_map.insert((*stream).index, slot);
                }
            }
            if video_map.is_empty() {
                avformat_close_input(&mut ctx);
                bail!("no video streams in {}", url);
            }
            Ok(Self {
                ctx,
                url: url.to_string(),
                video_map,
            })
        }
    }

    /// Owned parameter copies for every video stream, in slot order.
    fn stream_params(&self) -> Result<Vec<StreamParams>> {
        let mut out = Vec::new();
        unsafe {
            for (&index, &slot) in &self.video_map {
                let stream = *(*self.ctx).streams.add(index as usize);
                let par = avcodec_parameters_alloc();
                if par.is_null() {
                    bail!("failed to allocate codec parameters");
                }
                let ret = avcodec_parameters_copy(par, (*stream).codecpar);
                if ret < 0 {
                    bail!("failed to copy codec parameters: {}", av_err(ret));
                }
                let fr = (*stream).avg_frame_rate;
                out.push(StreamParams {
                    index,
                    slot,
                    par,
                    time_base: (*stream).time_base.into(),
                    framerate: if fr.num > 0 && fr.den > 0 {
                        fr.into()
                    } else {
                        TimeBase::new(30, 1)
                    },
                });
            }
        }
        out.sort_by_key(|s| s.slot);
        Ok(out)
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        unsafe {
            avformat_close_input(&mut self.ctx);
        }
    }
}

/// Stage 1: read compressed packets from the active source and forward the
/// video ones. Owns the failover between main and backup.
pub struct IngressStage {
    // field order matters: sources must close before the interrupt state
    // their callback points into is released
    active: Source,
    interrupt: Arc<InterruptState>,
    /// URL to try when the active source fails
    standby_url: Option<String>,
    swap_lock: Mutex<()>,
    out: Arc<BoundedQueue<MediaPacket>>,
    grace: Duration,
    fault: Arc<FaultSlot>,
}

impl IngressStage {
    /// Open the main source and discover its video streams. Returns the
    /// stage plus the stream parameters the decode stage builds from.
    pub fn open(
        cfg: &PipelineConfig,
        out: Arc<BoundedQueue<MediaPacket>>,
        interrupt: Arc<InterruptState>,
        fault: Arc<FaultSlot>,
    ) -> Result<(Self, Vec<StreamParams>)> {
        let active = Source::open(&cfg.main_input, &interrupt)?;
        info!(
            "ingress open: {} ({} video streams)",
            cfg.main_input,
            active.video_map.len()
        );
        let params = active.stream_params()?;
        Ok((
            Self {
                interrupt,
                active,
                standby_url: cfg.backup_input.clone(),
                swap_lock: Mutex::new(()),
                out,
                grace: cfg.failover_grace,
                fault,
            },
            params,
        ))
    }

    /// Swap the active source for the standby under the swap lock. The old
    /// source's URL becomes the new standby, so a later failure can try the
    /// original input again.
    fn try_failover(&mut self) -> bool {
        let _guard = self.swap_lock.lock().expect("swap lock poisoned");
        let Some(url) = self.standby_url.clone() else {
            return false;
        };
        match Source::open(&url, &self.interrupt) {
            Ok(next) => {
                let old = std::mem::replace(&mut self.active, next);
                self.standby_url = Some(old.url.clone());
                self.interrupt.touch();
                info!("ingress swapped active source to {}", url);
                true
            }
            Err(e) => {
                warn!("ingress failover to {} failed: {:#}", url, e);
                false
            }
        }
    }

    /// Blocking read loop; returns when the stream drains, both sources die
    /// past the grace period, or the session is cancelled. Always stops the
    /// output queue on the way out.
    pub fn run(mut self) {
        let mut last_ok = Instant::now();
        let mut delivered: u64 = 0;
        loop {
            if self.interrupt.is_cancelled() {
                info!("ingress cancelled");
                break;
            }
            let pkt = match MediaPacket::alloc() {
                Ok(p) => p,
                Err(e) => {
                    self.fault.raise(format!("ingress: {e}"));
                    break;
                }
            };
            let ret = unsafe { av_read_frame(self.active.ctx, pkt.as_ptr()) };
            if ret >= 0 {
                self.interrupt.touch();
                last_ok = Instant::now();
                let slot = self.active.video_map.get(&pkt.stream_index()).copied();
                match slot {
                    Some(slot) => {
                        let mut pkt = pkt;
                        pkt.set_stream_index(slot as i32);
                        if !self.out.push(pkt) {
                            break;
                        }
                        delivered += 1;
                    }
                    // non-video stream: release and continue
                    None => drop(pkt),
                }
            } else if ret == AVERROR_EOF {
                info!(
                    "ingress end of stream on {} after {} packets",
                    self.active.url, delivered
                );
                break;
            } else {
                drop(pkt);
                if self.interrupt.is_cancelled() {
                    break;
                }
                error!(
                    "ingress read error on {}: {}",
                    self.active.url,
                    av_err(ret)
                );
                if !self.try_failover() {
                    if last_ok.elapsed() > self.grace {
                        self.fault.raise(format!(
                            "ingress: no source recovered within {:?}",
                            self.grace
                        ));
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                    // allow the next read attempt to block for a full timeout
                    self.interrupt.touch();
                }
            }
        }
        self.out.stop();
    }
}
