//! Element-type conversion between f32, f16 and bf16.
//!
//! f32 -> f16 is a full IEEE 754 binary16 encoder: round-to-nearest-even,
//! gradual underflow into subnormals, overflow to infinity. f32 -> bf16
//! rounds to nearest even on the upper 16 bits. Any NaN input produces a
//! single canonical quiet NaN in the narrow format. f16 <-> bf16 goes
//! through f32.
//!
//! Slice forms walk the input in fixed-width lanes so the compiler can
//! vectorize the bit manipulation.

/// Canonical quiet NaN for binary16.
pub const F16_NAN: u16 = 0x7e00;
/// Canonical quiet NaN for bfloat16.
pub const BF16_NAN: u16 = 0x7fc0;

const LANES: usize = 8;

/// Encode an f32 as binary16 bits.
#[inline]
pub fn f32_to_f16(value: f32) -> u16 {
    let x = value.to_bits();
    let sign = ((x >> 16) & 0x8000) as u16;
    let exp = ((x >> 23) & 0xff) as i32;
    let man = x & 0x007f_ffff;

    if exp == 0xff {
        if man != 0 {
            return F16_NAN;
        }
        return sign | 0x7c00;
    }

    let half_exp = exp - 127 + 15;
    if half_exp >= 0x1f {
        return sign | 0x7c00;
    }

    if half_exp <= 0 {
        // Below 2^-25 everything rounds to (signed) zero.
        if half_exp < -10 {
            return sign;
        }
        let man = man | 0x0080_0000;
        let shift = (14 - half_exp) as u32;
        let truncated = man >> shift;
        let halfway = 1u32 << (shift - 1);
        let rem = man & ((1u32 << shift) - 1);
        let rounded = if rem > halfway || (rem == halfway && truncated & 1 == 1) {
            truncated + 1
        } else {
            truncated
        };
        // A carry out of the subnormal range lands on the smallest normal.
        return sign | rounded as u16;
    }

    let truncated = ((half_exp as u32) << 10) | (man >> 13);
    let rem = man & 0x1fff;
    let rounded = if rem > 0x1000 || (rem == 0x1000 && truncated & 1 == 1) {
        truncated + 1
    } else {
        truncated
    };
    // A carry into the exponent may produce infinity, which is correct.
    sign | rounded as u16
}

/// Decode binary16 bits into an f32 (exact).
#[inline]
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits & 0x8000) as u32) << 16;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let man = (bits & 0x03ff) as u32;

    let out = match (exp, man) {
        (0, 0) => sign,
        (0, _) => {
            let mut e = 127 - 15 + 1;
            let mut m = man;
            while m & 0x0400 == 0 {
                m <<= 1;
                e -= 1;
            }
            sign | (e << 23) | ((m & 0x03ff) << 13)
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, _) => sign | 0x7f80_0000 | (man << 13),
        _ => sign | ((exp + 127 - 15) << 23) | (man << 13),
    };
    f32::from_bits(out)
}

/// Encode an f32 as bfloat16 bits.
#[inline]
pub fn f32_to_bf16(value: f32) -> u16 {
    if value.is_nan() {
        return BF16_NAN;
    }
    let x = value.to_bits();
    let lsb = (x >> 16) & 1;
    (x.wrapping_add(0x7fff + lsb) >> 16) as u16
}

/// Decode bfloat16 bits into an f32 (exact).
#[inline]
pub fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}

/// binary16 -> bfloat16.
#[inline]
pub fn f16_to_bf16(bits: u16) -> u16 {
    f32_to_bf16(f16_to_f32(bits))
}

/// bfloat16 -> binary16.
#[inline]
pub fn bf16_to_f16(bits: u16) -> u16 {
    f32_to_f16(bf16_to_f32(bits))
}

#[inline]
fn convert_lanes<S: Copy, D>(src: &[S], dst: &mut [D], f: impl Fn(S) -> D) {
    let len = src.len().min(dst.len());
    let (src, dst) = (&src[..len], &mut dst[..len]);
    let mut s_chunks = src.chunks_exact(LANES);
    let mut d_chunks = dst.chunks_exact_mut(LANES);
    for (s, d) in (&mut s_chunks).zip(&mut d_chunks) {
        for lane in 0..LANES {
            d[lane] = f(s[lane]);
        }
    }
    for (s, d) in s_chunks
        .remainder()
        .iter()
        .zip(d_chunks.into_remainder().iter_mut())
    {
        *d = f(*s);
    }
}

/// Convert `min(src.len(), dst.len())` f32 values to binary16.
pub fn f32_slice_to_f16(src: &[f32], dst: &mut [u16]) {
    convert_lanes(src, dst, f32_to_f16);
}

/// Convert binary16 values to f32.
pub fn f16_slice_to_f32(src: &[u16], dst: &mut [f32]) {
    convert_lanes(src, dst, f16_to_f32);
}

/// Convert f32 values to bfloat16.
pub fn f32_slice_to_bf16(src: &[f32], dst: &mut [u16]) {
    convert_lanes(src, dst, f32_to_bf16);
}

/// Convert bfloat16 values to f32.
pub fn bf16_slice_to_f32(src: &[u16], dst: &mut [f32]) {
    convert_lanes(src, dst, bf16_to_f32);
}

/// Convert binary16 values to bfloat16.
pub fn f16_slice_to_bf16(src: &[u16], dst: &mut [u16]) {
    convert_lanes(src, dst, f16_to_bf16);
}

/// Convert bfloat16 values to binary16.
pub fn bf16_slice_to_f16(src: &[u16], dst: &mut [u16]) {
    convert_lanes(src, dst, bf16_to_f16);
}
