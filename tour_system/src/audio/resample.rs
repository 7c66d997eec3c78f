//! Linear-interpolation resampler with a carry buffer, so fractional source positions that
//! straddle two `process` calls don't produce clicks.
//!
//! Frame-at-a-time carry-buffer bookkeeping follows the same shape as
//! `Scaletempo` (`st_system/src/audio/scale_tempo.rs`) even though the underlying math solves a
//! different problem (sample-rate conversion, not tempo scaling): both keep a tail of
//! already-consumed input around so a fractional cursor can keep advancing smoothly across
//! `process` calls.

pub struct LinearResampler {
    channels: usize,
    ratio: f64,
    /// Fractional source-frame position of the next sample to produce, relative to `carry`.
    position: f64,
    /// The last frame of the previous `process` call, kept so interpolation can look one frame
    /// behind the start of the new call.
    carry: Vec<f32>,
    has_carry: bool,
}

impl LinearResampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: usize) -> Self {
        Self {
            channels,
            ratio: source_rate as f64 / target_rate as f64,
            position: 0.0,
            carry: vec![0.0; channels],
            has_carry: false,
        }
    }

    /// Resample one block of interleaved `f32` samples. Safe to call repeatedly across a stream;
    /// the carry buffer preserves continuity between calls.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.ratio == 1.0 {
            return input.to_vec();
        }

        let channels = self.channels;
        let frame_count = input.len() / channels;
        if frame_count == 0 {
            return Vec::new();
        }

        let mut output = Vec::new();
        let frame_at = |idx: isize| -> &[f32] {
            if idx < 0 {
                &self.carry
            } else {
                let start = idx as usize * channels;
                &input[start..start + channels]
            }
        };

        while self.position < frame_count as f64 {
            let idx_floor = self.position.floor();
            let frac = self.position - idx_floor;
            let i0 = idx_floor as isize - 1; // -1 maps to the carry frame
            let i1 = i0 + 1;

            let before = if self.has_carry || i0 >= 0 { frame_at(i0) } else { frame_at(i1) };
            let after = frame_at(i1.min(frame_count as isize - 1));

            for c in 0..channels {
                let a = before[c] as f64;
                let b = after[c] as f64;
                output.push((a + (b - a) * frac) as f32);
            }

            self.position += self.ratio;
        }

        self.position -= frame_count as f64;
        self.carry.copy_from_slice(&input[(frame_count - 1) * channels..frame_count * channels]);
        self.has_carry = true;

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ratio_passes_through_untouched() {
        let mut r = LinearResampler::new(16_000, 16_000, 1);
        let input = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(r.process(&input), input);
    }

    #[test]
    fn downsampling_produces_fewer_frames() {
        let mut r = LinearResampler::new(48_000, 16_000, 1);
        let input: Vec<f32> = (0..48).map(|i| i as f32 / 48.0).collect();
        let out = r.process(&input);
        assert!(out.len() < input.len());
    }

    #[test]
    fn upsampling_produces_more_frames() {
        let mut r = LinearResampler::new(8_000, 16_000, 1);
        let input = vec![0.0, 1.0, 0.0, 1.0];
        let out = r.process(&input);
        assert!(out.len() > input.len());
    }

    #[test]
    fn carries_fractional_position_across_calls_without_discontinuity() {
        let mut r = LinearResampler::new(44_100, 16_000, 1);
        let input: Vec<f32> = (0..100).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut combined = Vec::new();
        for chunk in input.chunks(10) {
            combined.extend(r.process(chunk));
        }

        let mut whole = LinearResampler::new(44_100, 16_000, 1);
        let all_at_once = whole.process(&input);

        assert_eq!(combined.len(), all_at_once.len());
    }
}
