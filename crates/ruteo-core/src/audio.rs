//! Buffer functions for the builtin audio port type.
//!
//! An audio buffer is `nframes` 32-bit floats. Mixdown is an additive sum:
//! the first source is copied, the rest accumulated.

use crate::{Nframes, Sample};

/// Zero a fresh audio buffer.
pub fn buffer_init(buffer: &mut [u8], nframes: Nframes) {
    let samples: &mut [Sample] = bytemuck::cast_slice_mut(buffer);
    for s in &mut samples[..nframes as usize] {
        *s = 0.0;
    }
}

/// Sum all `sources` into `dst`.
///
/// Only called with two or more sources; a single connection is resolved
/// zero-copy by the client library and never reaches mixdown.
pub fn mixdown(dst: &mut [u8], sources: &[&[u8]], nframes: Nframes) {
    let n = nframes as usize;
    let out: &mut [Sample] = bytemuck::cast_slice_mut(dst);

    let first: &[Sample] = bytemuck::cast_slice(sources[0]);
    out[..n].copy_from_slice(&first[..n]);

    for src in &sources[1..] {
        let src: &[Sample] = bytemuck::cast_slice(src);
        for (d, s) in out[..n].iter_mut().zip(&src[..n]) {
            *d += *s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Sample-typed storage keeps the byte views aligned, as the buffer
    // pool does in production.
    #[test]
    fn init_zeroes() {
        let mut buf = [0.5f32; 16];
        buffer_init(bytemuck::cast_slice_mut(&mut buf), 16);
        assert!(buf.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn mixdown_sums() {
        let a = [0.25f32; 8];
        let b = [0.5f32; 8];
        let mut out = [0.0f32; 8];
        mixdown(
            bytemuck::cast_slice_mut(&mut out),
            &[bytemuck::cast_slice(&a), bytemuck::cast_slice(&b)],
            8,
        );
        assert!(out.iter().all(|&s| (s - 0.75).abs() < f32::EPSILON));
    }
}
