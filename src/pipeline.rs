//! One conversion from inputs to an encoded artifact. The synchronous path
//! calls [`Pipeline::run`] directly; queued jobs call it from a worker.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::command;
use crate::encode::{EncodeSpec, Encoder};
use crate::error::{ConvertError, ConvertResult};
use crate::models::{Artifact, Format, Inputs, Limits, Mode, Params};
use crate::postprocess::Sequence;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::synth::kenburns::KenBurns;
use crate::synth::sequence::{self, ImageSequence};
use crate::synth::video::{self, VideoFrames, VideoPlan};
use crate::synth::{even_size, open_image, Frame, Frames};

pub const DEFAULT_SINGLE_SIZE: (u32, u32) = (640, 360);

pub struct Pipeline {
    encoder: Arc<dyn Encoder>,
    progress_interval: Duration,
    limits: Limits,
}

/// A synthesizer ready to run, with the number of frames it will emit.
struct Plan<'a> {
    frames: Frames<'a>,
    planned: usize,
    size: (u32, u32),
}

impl Pipeline {
    pub fn new(encoder: Arc<dyn Encoder>, progress_interval: Duration) -> Self {
        Self {
            encoder,
            progress_interval,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    fn plan<'a>(&self, params: &Params, inputs: &'a Inputs, seed: u64) -> ConvertResult<Plan<'a>> {
        let files = inputs.files();
        let first = files
            .first()
            .ok_or_else(|| ConvertError::validation("no input files"))?;

        let plan = match params.mode {
            Mode::Single => {
                let image = open_image(first)?;
                let mut size = (
                    params.width.unwrap_or(DEFAULT_SINGLE_SIZE.0),
                    params.height.unwrap_or(DEFAULT_SINGLE_SIZE.1),
                );
                if params.format == Format::Mp4 {
                    size = even_size(size);
                }
                let kb = KenBurns::new(
                    image.dimensions(),
                    size,
                    params.capped_duration(),
                    params.fps,
                    params.zoom,
                    params.pan,
                    seed,
                );
                Plan {
                    planned: kb.frame_count(),
                    size,
                    frames: Box::new(kb.render(image)),
                }
            }
            Mode::Images => {
                let dims = sequence::probe_dimensions(files)?;
                let mut size = sequence::target_size(&dims, params.width, params.height)?;
                if params.format == Format::Mp4 {
                    size = even_size(size);
                }
                Plan {
                    planned: files.len(),
                    size,
                    frames: Box::new(ImageSequence::new(files, size)),
                }
            }
            Mode::Video => {
                let meta = command::probe(first)?;
                let plan = VideoPlan::new(
                    params.trim,
                    meta.duration,
                    params.max_seconds,
                    params.fps,
                    params.speed,
                )?;
                let mut size = video::output_size(&meta, params.width, params.height);
                if params.format == Format::Mp4 {
                    size = even_size(size);
                }
                debug!(
                    start = plan.start,
                    end = plan.end,
                    frames = plan.frame_count,
                    source_fps = meta.fps,
                    "video resampling plan"
                );
                Plan {
                    planned: plan.frame_count,
                    size,
                    frames: Box::new(VideoFrames::spawn(first, &meta, &plan, size)?),
                }
            }
        };

        Ok(plan)
    }

    /// Runs synthesis, post-processing and encoding, reporting progress to
    /// `sink` per frame synthesized and per frame encoded.
    pub fn run(
        &self,
        params: &Params,
        inputs: &Inputs,
        seed: u64,
        sink: &mut dyn ProgressSink,
    ) -> ConvertResult<Artifact> {
        params.validate(&self.limits)?;
        params.validate_input_count(inputs.len(), &self.limits)?;

        let Plan {
            frames,
            planned,
            size,
        } = self.plan(params, inputs, seed)?;
        self.limits.check_sequence(planned, size)?;

        let total = planned + Sequence::planned_len(planned, params);
        let mut tracker = ProgressTracker::new(total as u64, self.progress_interval, sink);

        let mut synthesized: Vec<Frame> = Vec::new();
        for frame in frames {
            synthesized.push(frame?);
            tracker.tick();
        }

        let sequence = Sequence::new(synthesized, params);
        let spec = EncodeSpec {
            format: params.format,
            width: size.0,
            height: size.1,
            fps: params.fps,
            loop_meta: sequence.loop_meta,
        };

        let bytes = self
            .encoder
            .encode(&spec, &mut sequence.iter(), &mut tracker)?;

        Ok(Artifact {
            format: params.format,
            bytes,
            frame_count: sequence.len(),
            width: size.0,
            height: size.1,
        })
    }
}
