//! Bounce and loop handling applied between synthesis and encoding.
//!
//! GIF carries its loop count in the container, so the frame sequence is
//! encoded once and [`LoopMeta`] is written as the Netscape loop field.
//! An mp4 has no such field: looping is realized by encoding the sequence
//! `1 + loops` times back to back. `loop_forever` cannot be expressed that
//! way and produces a single pass; infinite playback is left to the player.

use crate::models::{Format, Params, MAX_MP4_PASSES};
use crate::synth::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMeta {
    Infinite,
    Count(u16),
}

impl LoopMeta {
    pub fn from_params(params: &Params) -> Self {
        if params.loop_forever {
            LoopMeta::Infinite
        } else {
            LoopMeta::Count(params.loops)
        }
    }

    /// Value for the GIF loop field. 0 is the Netscape "forever" marker;
    /// counts are written verbatim.
    pub fn gif_field(self) -> u16 {
        match self {
            LoopMeta::Infinite => 0,
            LoopMeta::Count(n) => n,
        }
    }

    /// Number of times the sequence is physically written into an mp4.
    pub fn mp4_passes(self) -> u32 {
        match self {
            LoopMeta::Infinite => 1,
            LoopMeta::Count(n) => (u32::from(n) + 1).min(MAX_MP4_PASSES),
        }
    }
}

/// `f0..fn-1` followed by `fn-2..f1`: a palindrome of length `2n - 2` with
/// neither endpoint repeated. Sequences shorter than two frames are returned
/// unchanged.
pub fn bounce<T: Clone>(mut frames: Vec<T>) -> Vec<T> {
    let n = frames.len();
    if n < 2 {
        return frames;
    }
    let tail: Vec<T> = frames[1..n - 1].iter().rev().cloned().collect();
    frames.extend(tail);
    frames
}

pub fn bounced_len(n: usize) -> usize {
    if n < 2 {
        n
    } else {
        2 * n - 2
    }
}

/// Ordered frames ready for the encoder.
#[derive(Debug)]
pub struct Sequence {
    pub frames: Vec<Frame>,
    pub passes: u32,
    pub loop_meta: LoopMeta,
}

impl Sequence {
    pub fn new(frames: Vec<Frame>, params: &Params) -> Self {
        let frames = if params.bounce { bounce(frames) } else { frames };
        let loop_meta = LoopMeta::from_params(params);
        let passes = match params.format {
            Format::Gif => 1,
            Format::Mp4 => loop_meta.mp4_passes(),
        };
        Self {
            frames,
            passes,
            loop_meta,
        }
    }

    /// Frame count the encoder will receive for `synthesized` input frames.
    pub fn planned_len(synthesized: usize, params: &Params) -> usize {
        let n = if params.bounce {
            bounced_len(synthesized)
        } else {
            synthesized
        };
        let passes = match params.format {
            Format::Gif => 1,
            Format::Mp4 => LoopMeta::from_params(params).mp4_passes(),
        };
        n * passes as usize
    }

    pub fn len(&self) -> usize {
        self.frames.len() * self.passes as usize
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> + '_ {
        (0..self.passes).flat_map(move |_| self.frames.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounce_is_an_exact_palindrome() {
        for n in 2..12usize {
            let out = bounce((0..n).collect::<Vec<_>>());
            assert_eq!(out.len(), 2 * n - 2);
            assert_eq!(out.len(), bounced_len(n));
            for i in 1..out.len() - 1 {
                assert_eq!(out[i], out[2 * n - 2 - i]);
            }
            assert_eq!(&out[..n], &(0..n).collect::<Vec<_>>()[..]);
        }
    }

    #[test]
    fn bounce_does_not_duplicate_endpoints() {
        assert_eq!(bounce(vec![1, 2, 3, 4]), vec![1, 2, 3, 4, 3, 2]);
        assert_eq!(bounce(vec![1, 2]), vec![1, 2]);
        assert_eq!(bounce(vec![7]), vec![7]);
        assert!(bounce(Vec::<u8>::new()).is_empty());
    }

    #[test]
    fn loop_forever_overrides_count() {
        let params = Params {
            loops: 5,
            loop_forever: true,
            ..Params::default()
        };
        assert_eq!(LoopMeta::from_params(&params), LoopMeta::Infinite);
        assert_eq!(LoopMeta::from_params(&params).gif_field(), 0);

        let params = Params {
            loops: 3,
            ..Params::default()
        };
        assert_eq!(LoopMeta::from_params(&params).gif_field(), 3);
    }

    #[test]
    fn mp4_repeats_the_sequence() {
        let frame = Frame::new(2, 2);
        let params = Params {
            format: Format::Mp4,
            loops: 2,
            bounce: true,
            ..Params::default()
        };
        let seq = Sequence::new(vec![frame.clone(), frame.clone(), frame.clone()], &params);
        assert_eq!(seq.passes, 3);
        assert_eq!(seq.len(), 12);
        assert_eq!(seq.iter().count(), 12);
        assert_eq!(Sequence::planned_len(3, &params), 12);

        let gif = Params {
            loops: 2,
            ..Params::default()
        };
        let seq = Sequence::new(vec![frame.clone(), frame], &gif);
        assert_eq!(seq.passes, 1);
        assert_eq!(seq.iter().count(), 2);
    }
}
