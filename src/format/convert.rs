//! Sample format and channel conversion.

/// Converts an i16 sample to f32.
///
/// Output will be in the range [-1.0, 1.0].
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Converts a u16 sample (offset binary, silence at 32768) to f32.
#[inline]
pub fn u16_to_f32(sample: u16) -> f32 {
    (f32::from(sample) - 32768.0) / 32768.0
}

/// Maps interleaved frames from one channel count to another.
///
/// - Same count: copied unchanged.
/// - To mono: every frame is averaged.
/// - From mono: the sample is duplicated into every output channel.
/// - Otherwise: the leading channels are kept, missing ones are filled with silence.
///
/// A trailing partial frame is discarded.
pub fn remap_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let from = usize::from(from.max(1));
    let to = usize::from(to.max(1));
    if from == to {
        return samples.to_vec();
    }

    let frames = samples.chunks_exact(from);
    let mut output = Vec::with_capacity(frames.len() * to);

    for frame in frames {
        if to == 1 {
            output.push(frame.iter().sum::<f32>() / from as f32);
        } else if from == 1 {
            output.extend(std::iter::repeat(frame[0]).take(to));
        } else {
            let kept = from.min(to);
            output.extend_from_slice(&frame[..kept]);
            output.extend(std::iter::repeat(0.0).take(to - kept));
        }
    }

    output
}

/// Appends samples to `out` as little-endian 32-bit floats.
pub fn write_f32_le(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * std::mem::size_of::<f32>());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}
