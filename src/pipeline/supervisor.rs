use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{error, info, warn};

use crate::decode::DecodeStage;
use crate::egress::EgressStage;
use crate::encode::EncodeStage;
use crate::hwaccel::HwDevice;
use crate::ingress::{IngressStage, InterruptState};
use crate::media::{DecodedFrame, EncodedPacket, MediaPacket};
use crate::pipeline::{ExitStatus, FaultSlot, PipelineConfig};
use crate::queue::BoundedQueue;
use crate::settings::Settings;
use crate::transform::{Transform, TransformStage};

/// Capacity of the bounded queues in the middle of the pipeline.
const MID_QUEUE_CAPACITY: usize = 8;
/// Pre-consumption guard depth on the unbounded edge queues.
const EDGE_GUARD_DEPTH: usize = 1024;

/// External cancellation: makes the ingress interrupt predicate fire and
/// stops the packet queue; every downstream stage then drains, flushes and
/// exits.
#[derive(Clone)]
pub struct CancelHandle {
    interrupt: Arc<InterruptState>,
    packet_queue: Arc<BoundedQueue<MediaPacket>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.interrupt.cancel();
        self.packet_queue.stop();
    }
}

/// Owns the stages, the queues and the shared device handles; sequences
/// start-up and shutdown. One instance per session.
pub struct Supervisor {
    config: PipelineConfig,
    interrupt: Arc<InterruptState>,
    fault: Arc<FaultSlot>,
    packet_queue: Arc<BoundedQueue<MediaPacket>>,
    decoded_queue: Arc<BoundedQueue<DecodedFrame>>,
    transformed_queue: Arc<BoundedQueue<DecodedFrame>>,
    encoded_queue: Arc<BoundedQueue<EncodedPacket>>,
}

impl Supervisor {
    /// Validate and freeze the configuration. Fails without touching any
    /// codec or I/O resource.
    pub fn new(settings: &Settings) -> Result<Self> {
        let config = PipelineConfig::from_settings(settings)?;
        let interrupt = InterruptState::new(config.io_timeout);
        Ok(Self {
            interrupt,
            fault: Arc::new(FaultSlot::default()),
            packet_queue: Arc::new(BoundedQueue::unbounded("packets", Some(EDGE_GUARD_DEPTH))),
            decoded_queue: Arc::new(BoundedQueue::bounded("decoded", MID_QUEUE_CAPACITY)),
            transformed_queue: Arc::new(BoundedQueue::bounded("transformed", MID_QUEUE_CAPACITY)),
            encoded_queue: Arc::new(BoundedQueue::unbounded("encoded", Some(EDGE_GUARD_DEPTH))),
            config,
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            interrupt: self.interrupt.clone(),
            packet_queue: self.packet_queue.clone(),
        }
    }

    /// Block until the pipeline drains; returns after trailers are written
    /// and all resources are released.
    pub fn run(self) -> ExitStatus {
        match self.run_inner() {
            Ok(status) => status,
            Err(e) => {
                error!("pipeline init failed: {e:#}");
                ExitStatus::InitError
            }
        }
    }

    fn run_inner(self) -> Result<ExitStatus> {
        info!(
            "pipeline {}: {} -> [{}]",
            self.config.id,
            self.config.main_input,
            self.config
                .renditions
                .iter()
                .map(|r| format!("{}x{}@{}", r.width, r.height, r.bitrate))
                .join(", ")
        );

        // shared device first; everything else takes references to it and
        // it is released last
        let device = if self.config.use_gpu {
            match HwDevice::create() {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("hardware device unavailable, running software-only: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        let (ingress, streams) = IngressStage::open(
            &self.config,
            self.packet_queue.clone(),
            self.interrupt.clone(),
            self.fault.clone(),
        )?;
        let input_tb = streams
            .first()
            .map(|s| s.time_base)
            .context("no input streams")?;

        let decode = DecodeStage::new(
            &streams,
            self.config.use_gpu,
            device.as_ref(),
            self.packet_queue.clone(),
            self.decoded_queue.clone(),
        )?;

        let transform = TransformStage::new(
            Transform::from_config(&self.config.transform)?,
            self.decoded_queue.clone(),
            self.transformed_queue.clone(),
        );

        let encode = EncodeStage::new(
            &self.config,
            input_tb,
            device.as_ref(),
            self.transformed_queue.clone(),
            self.encoded_queue.clone(),
        )?;

        let egress = EgressStage::open(
            &self.config,
            &encode.codec_contexts(),
            self.encoded_queue.clone(),
        )?;

        let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::with_capacity(5);
        let spawn = |name: &'static str,
                     f: Box<dyn FnOnce() + Send>,
                     workers: &mut Vec<(&'static str, JoinHandle<()>)>|
         -> Result<()> {
            let handle = thread::Builder::new()
                .name(format!("pipeline:{name}"))
                .spawn(f)
                .with_context(|| format!("failed to spawn {name} worker"))?;
            workers.push((name, handle));
            Ok(())
        };

        let spawned: Result<()> = (|| {
            spawn("egress", Box::new(move || egress.run()), &mut workers)?;
            spawn("encode", Box::new(move || encode.run()), &mut workers)?;
            spawn("transform", Box::new(move || transform.run()), &mut workers)?;
            spawn("decode", Box::new(move || decode.run()), &mut workers)?;
            spawn("ingress", Box::new(move || ingress.run()), &mut workers)?;
            Ok(())
        })();
        if let Err(e) = spawned {
            // wake whatever did start, then drain it
            self.interrupt.cancel();
            self.packet_queue.stop();
            self.decoded_queue.stop();
            self.transformed_queue.stop();
            self.encoded_queue.stop();
            for (name, handle) in workers {
                if handle.join().is_err() {
                    error!("{name} worker panicked during teardown");
                }
            }
            return Err(e);
        }

        // upstream-first join order mirrors the stop propagation
        workers.reverse();
        for (name, handle) in workers {
            if handle.join().is_err() {
                self.fault.raise(format!("{name} worker panicked"));
            }
            info!("{name} worker joined");
        }

        for (name, queue_counters) in [
            ("packets", self.packet_queue.counters()),
            ("encoded", self.encoded_queue.counters()),
        ] {
            info!(
                "queue {name}: pushes={} pops={} drops={} depth={}",
                queue_counters.pushes,
                queue_counters.pops,
                queue_counters.drops,
                queue_counters.depth
            );
        }

        if self.interrupt.is_cancelled() {
            return Ok(ExitStatus::Cancelled);
        }
        if let Some(fault) = self.fault.get() {
            error!("pipeline fault: {fault}");
            return Ok(ExitStatus::RuntimeError);
        }
        Ok(ExitStatus::Success)
    }
}
