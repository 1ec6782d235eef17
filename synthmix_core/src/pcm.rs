//! Little-endian signed integer PCM helpers for 16, 24 and 32 bit samples.

#[inline]
pub fn max_value(width: usize) -> i64 {
    (1i64 << (8 * width - 1)) - 1
}

#[inline]
pub fn min_value(width: usize) -> i64 {
    -(1i64 << (8 * width - 1))
}

#[inline]
pub fn clamp(value: i64, width: usize) -> i64 {
    value.clamp(min_value(width), max_value(width))
}

/// Reads one sample value starting at `bytes[0]`.
#[inline]
pub fn read_sample(bytes: &[u8], width: usize) -> i64 {
    match width {
        2 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        3 => {
            // sign-extend through the high byte of an i32
            let raw = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]);
            (raw >> 8) as i64
        }
        _ => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
    }
}

/// Writes one sample value, saturating to the width's range.
#[inline]
pub fn write_sample(bytes: &mut [u8], width: usize, value: i64) {
    let v = clamp(value, width);
    match width {
        2 => bytes[..2].copy_from_slice(&(v as i16).to_le_bytes()),
        3 => bytes[..3].copy_from_slice(&(v as i32).to_le_bytes()[..3]),
        _ => bytes[..4].copy_from_slice(&(v as i32).to_le_bytes()),
    }
}

pub fn samples(bytes: &[u8], width: usize) -> impl Iterator<Item = i64> + '_ {
    bytes.chunks_exact(width).map(move |s| read_sample(s, width))
}

pub fn from_values(values: impl IntoIterator<Item = i64>, width: usize) -> Vec<u8> {
    let iter = values.into_iter();
    let mut out = Vec::with_capacity(iter.size_hint().0 * width);
    let mut buf = [0u8; 4];
    for v in iter {
        write_sample(&mut buf, width, v);
        out.extend_from_slice(&buf[..width]);
    }
    out
}

/// Saturating sample-wise addition of `other` into `target`.
///
/// Only the overlapping prefix is mixed.
pub fn add_into(target: &mut [u8], other: &[u8], width: usize) {
    for (t, o) in target.chunks_exact_mut(width).zip(other.chunks_exact(width)) {
        let sum = read_sample(t, width) + read_sample(o, width);
        write_sample(t, width, sum);
    }
}

/// Multiplies every sample by `factor`, truncating toward zero and saturating.
pub fn scale(bytes: &mut [u8], width: usize, factor: f64) {
    for s in bytes.chunks_exact_mut(width) {
        let v = read_sample(s, width) as f64 * factor;
        write_sample(s, width, v as i64);
    }
}

pub fn max_abs(bytes: &[u8], width: usize) -> i64 {
    samples(bytes, width).map(i64::abs).max().unwrap_or(0)
}

pub fn rms(bytes: &[u8], width: usize) -> f64 {
    let count = bytes.len() / width;
    if count == 0 {
        return 0.0;
    }
    let sum: f64 = samples(bytes, width).map(|v| (v as f64) * (v as f64)).sum();
    (sum / count as f64).sqrt()
}

/// Converts between sample widths, shifting so the amplitude keeps its scale.
pub fn convert_width(bytes: &[u8], from: usize, to: usize) -> Vec<u8> {
    if from == to {
        return bytes.to_vec();
    }
    let shift = 8 * (to as i32 - from as i32);
    from_values(
        samples(bytes, from).map(|v| if shift > 0 { v << shift } else { v >> -shift }),
        to,
    )
}
