use std::sync::Arc;

use anyhow::Result;
use log::error;

use crate::media::DecodedFrame;
use crate::pipeline::TransformConfig;
use crate::queue::BoundedQueue;

pub mod composite;
pub mod segment;

/// Stage 3 visual work. Exactly one variant is active per session; the
/// encode stage never knows which.
pub enum Transform {
    /// Forward by moving ownership, no allocation
    PassThrough,
    Composite(composite::Compositor),
    Segmentation(segment::SegmentOverlay),
}

impl Transform {
    pub fn from_config(cfg: &TransformConfig) -> Result<Self> {
        Ok(match cfg {
            TransformConfig::None => Transform::PassThrough,
            TransformConfig::Composite(c) => Transform::Composite(composite::Compositor::new(c)),
            TransformConfig::Segmentation(s) => {
                Transform::Segmentation(segment::SegmentOverlay::new(s)?)
            }
        })
    }

    /// Consume one picture, produce zero or more.
    pub fn apply(&mut self, input: DecodedFrame) -> Result<Vec<DecodedFrame>> {
        match self {
            Transform::PassThrough => Ok(vec![input]),
            Transform::Composite(c) => c.apply(input),
            Transform::Segmentation(s) => s.apply(input).map(|f| vec![f]),
        }
    }
}

pub struct TransformStage {
    transform: Transform,
    input: Arc<BoundedQueue<DecodedFrame>>,
    output: Arc<BoundedQueue<DecodedFrame>>,
}

impl TransformStage {
    pub fn new(
        transform: Transform,
        input: Arc<BoundedQueue<DecodedFrame>>,
        output: Arc<BoundedQueue<DecodedFrame>>,
    ) -> Self {
        Self {
            transform,
            input,
            output,
        }
    }

    pub fn run(mut self) {
        'outer: while let Some(item) = self.input.pop() {
            match self.transform.apply(item) {
                Ok(frames) => {
                    for frame in frames {
                        if !self.output.push(frame) {
                            break 'outer;
                        }
                    }
                }
                // transient per-frame failure; the picture is dropped
                Err(e) => error!("transform: {e:#}"),
            }
        }
        self.output.stop();
    }
}
