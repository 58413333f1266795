//! Built-in scalar pixel-format converters.
//!
//! These are the no-hardware-assist fallbacks behind the converter
//! registry. Each kernel is pure on (source planes, destination planes,
//! width, height) and reproduces the RFC 4175 big-endian group layouts
//! bit-exactly: 10- and 12-bit round trips are lossless. The 8-bit
//! conversions from the 10-bit wire format drop the two least significant
//! bits and exist for preview paths only.
//!
//! Sample order on the wire follows RFC 4175 §4.3: 4:2:2 groups are
//! `Cb Y0 Cr Y1`, 4:4:4 YCbCr groups are `Cb Y Cr` per pixel, RGB groups
//! are `R G B` per pixel. Planar GBR surfaces store planes in G, B, R
//! order; V210 carries the same 4:2:2 sample sequence in three-sample
//! little-endian 32-bit words; Y210 left-justifies each sample in a
//! 16-bit container.

use crate::error::{Result, TransportError};
use crate::frame::{Frame, PixelFormat};

/// Signature of a scalar conversion kernel.
pub type ConvertFn = fn(&Frame, &mut Frame) -> Result<()>;

/// Look up the built-in kernel for a conversion pair.
///
/// Returns `None` for pairs outside the supported table; session creation
/// maps that to `UnsupportedFormat`.
pub fn get_converter(input: PixelFormat, output: PixelFormat) -> Option<ConvertFn> {
    use PixelFormat::*;
    let f: ConvertFn = match (input, output) {
        (Yuv422Planar10Le, Yuv422Rfc4175Be10) => planar422_to_be,
        (Yuv422Rfc4175Be10, Yuv422Planar10Le) => be_to_planar422,
        (Yuv422Planar12Le, Yuv422Rfc4175Be12) => planar422_to_be,
        (Yuv422Rfc4175Be12, Yuv422Planar12Le) => be_to_planar422,
        (V210, Yuv422Rfc4175Be10) => v210_to_be10,
        (Yuv422Rfc4175Be10, V210) => be10_to_v210,
        (Y210, Yuv422Rfc4175Be10) => y210_to_be10,
        (Yuv422Rfc4175Be10, Y210) => be10_to_y210,
        (Yuv444Planar10Le, Yuv444Rfc4175Be10) => planar444_to_be,
        (Yuv444Rfc4175Be10, Yuv444Planar10Le) => be_to_planar444,
        (Yuv444Planar12Le, Yuv444Rfc4175Be12) => planar444_to_be,
        (Yuv444Rfc4175Be12, Yuv444Planar12Le) => be_to_planar444,
        (GbrPlanar10Le, RgbRfc4175Be10) => gbr_to_be,
        (RgbRfc4175Be10, GbrPlanar10Le) => be_to_gbr,
        (GbrPlanar12Le, RgbRfc4175Be12) => gbr_to_be,
        (RgbRfc4175Be12, GbrPlanar12Le) => be_to_gbr,
        (Yuv422Rfc4175Be10, Uyvy) => be10_to_uyvy,
        (Yuv422Rfc4175Be10, Yuv422Planar8) => be10_to_planar8_422,
        (Yuv422Rfc4175Be10, Yuv420Planar8) => be10_to_planar8_420,
        _ => return None,
    };
    Some(f)
}

/// Whether a conversion pair is in the built-in table.
pub fn supported(input: PixelFormat, output: PixelFormat) -> bool {
    get_converter(input, output).is_some()
}

fn sample_bits(fmt: PixelFormat) -> u32 {
    use PixelFormat::*;
    match fmt {
        Yuv422Rfc4175Be12 | Yuv444Rfc4175Be12 | RgbRfc4175Be12 | Yuv422Planar12Le
        | Yuv444Planar12Le | GbrPlanar12Le => 12,
        _ => 10,
    }
}

fn check_pair(src: &Frame, dst: &mut Frame) -> Result<(u32, u32)> {
    if src.width != dst.width || src.data_height() != dst.data_height() {
        return Err(TransportError::InvalidArgument(format!(
            "conversion geometry mismatch: {}x{} vs {}x{}",
            src.width,
            src.data_height(),
            dst.width,
            dst.data_height()
        )));
    }
    if src.width % 2 != 0 {
        return Err(TransportError::InvalidArgument(format!(
            "odd width {} unsupported by 4:2:2 grouping",
            src.width
        )));
    }
    Ok((src.width, src.data_height()))
}

/// Pack `samples` MSB-first at `bits` per sample into `out`.
fn pack_be(samples: &[u16], bits: u32, out: &mut [u8]) {
    let mut acc: u32 = 0;
    let mut acc_bits: u32 = 0;
    let mut pos = 0usize;
    for &s in samples {
        acc = (acc << bits) | (s as u32 & ((1 << bits) - 1));
        acc_bits += bits;
        while acc_bits >= 8 {
            acc_bits -= 8;
            out[pos] = (acc >> acc_bits) as u8;
            pos += 1;
        }
    }
    if acc_bits > 0 {
        out[pos] = (acc << (8 - acc_bits)) as u8;
    }
}

/// Unpack MSB-first `bits`-wide samples from `input` into `out`.
fn unpack_be(input: &[u8], bits: u32, out: &mut [u16]) {
    let mut acc: u32 = 0;
    let mut acc_bits: u32 = 0;
    let mut pos = 0usize;
    for slot in out.iter_mut() {
        while acc_bits < bits {
            acc = (acc << 8) | input[pos] as u32;
            pos += 1;
            acc_bits += 8;
        }
        acc_bits -= bits;
        *slot = ((acc >> acc_bits) & ((1 << bits) - 1)) as u16;
    }
}

fn le16_at(plane: &[u8], idx: usize) -> u16 {
    u16::from_le_bytes([plane[idx * 2], plane[idx * 2 + 1]])
}

fn put_le16(plane: &mut [u8], idx: usize, v: u16) {
    plane[idx * 2..idx * 2 + 2].copy_from_slice(&v.to_le_bytes());
}

/// Gather one row of 4:2:2 samples in wire order (`Cb Y0 Cr Y1`) from
/// 16-bit little-endian planes.
fn gather_row_422(frame: &Frame, row: usize, samples: &mut [u16]) {
    let w = frame.width as usize;
    let (ls_y, ls_u, ls_v) = (frame.linesize[0], frame.linesize[1], frame.linesize[2]);
    let y = &frame.plane(0)[row * ls_y..];
    let u = &frame.plane(1)[row * ls_u..];
    let v = &frame.plane(2)[row * ls_v..];
    for g in 0..w / 2 {
        samples[g * 4] = le16_at(u, g);
        samples[g * 4 + 1] = le16_at(y, g * 2);
        samples[g * 4 + 2] = le16_at(v, g);
        samples[g * 4 + 3] = le16_at(y, g * 2 + 1);
    }
}

fn scatter_row_422(frame: &mut Frame, row: usize, samples: &[u16]) {
    let w = frame.width as usize;
    let (ls_y, ls_u, ls_v) = (frame.linesize[0], frame.linesize[1], frame.linesize[2]);
    let (off_y, off_u, off_v) = (
        frame.plane_offset[0],
        frame.plane_offset[1],
        frame.plane_offset[2],
    );
    let data = frame.data.as_mut_slice();
    for g in 0..w / 2 {
        let y = &mut data[off_y + row * ls_y..];
        put_le16(y, g * 2, samples[g * 4 + 1]);
        put_le16(y, g * 2 + 1, samples[g * 4 + 3]);
        let u = &mut data[off_u + row * ls_u..];
        put_le16(u, g, samples[g * 4]);
        let v = &mut data[off_v + row * ls_v..];
        put_le16(v, g, samples[g * 4 + 2]);
    }
}

fn planar422_to_be(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let bits = sample_bits(dst.fmt);
    let line = dst.linesize[0];
    let mut samples = vec![0u16; w as usize * 2];
    for row in 0..h as usize {
        gather_row_422(src, row, &mut samples);
        pack_be(&samples, bits, &mut dst.plane_mut(0)[row * line..(row + 1) * line]);
    }
    Ok(())
}

fn be_to_planar422(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let bits = sample_bits(src.fmt);
    let line = src.linesize[0];
    let mut samples = vec![0u16; w as usize * 2];
    for row in 0..h as usize {
        unpack_be(&src.plane(0)[row * line..], bits, &mut samples);
        scatter_row_422(dst, row, &samples);
    }
    Ok(())
}

fn planar444_to_be(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let bits = sample_bits(dst.fmt);
    let line = dst.linesize[0];
    let mut samples = vec![0u16; w as usize * 3];
    for row in 0..h as usize {
        let ls = src.linesize[0];
        for px in 0..w as usize {
            samples[px * 3] = le16_at(&src.plane(1)[row * ls..], px);
            samples[px * 3 + 1] = le16_at(&src.plane(0)[row * ls..], px);
            samples[px * 3 + 2] = le16_at(&src.plane(2)[row * ls..], px);
        }
        pack_be(&samples, bits, &mut dst.plane_mut(0)[row * line..(row + 1) * line]);
    }
    Ok(())
}

fn be_to_planar444(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let bits = sample_bits(src.fmt);
    let line = src.linesize[0];
    let mut samples = vec![0u16; w as usize * 3];
    for row in 0..h as usize {
        unpack_be(&src.plane(0)[row * line..], bits, &mut samples);
        let ls = dst.linesize[0];
        let offs = dst.plane_offset;
        let data = dst.data.as_mut_slice();
        for px in 0..w as usize {
            put_le16(&mut data[offs[1] + row * ls..], px, samples[px * 3]);
            put_le16(&mut data[offs[0] + row * ls..], px, samples[px * 3 + 1]);
            put_le16(&mut data[offs[2] + row * ls..], px, samples[px * 3 + 2]);
        }
    }
    Ok(())
}

// GBR planar stores G in plane 0, B in plane 1, R in plane 2; the wire
// order is R G B.
fn gbr_to_be(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let bits = sample_bits(dst.fmt);
    let line = dst.linesize[0];
    let mut samples = vec![0u16; w as usize * 3];
    for row in 0..h as usize {
        let ls = src.linesize[0];
        for px in 0..w as usize {
            samples[px * 3] = le16_at(&src.plane(2)[row * ls..], px);
            samples[px * 3 + 1] = le16_at(&src.plane(0)[row * ls..], px);
            samples[px * 3 + 2] = le16_at(&src.plane(1)[row * ls..], px);
        }
        pack_be(&samples, bits, &mut dst.plane_mut(0)[row * line..(row + 1) * line]);
    }
    Ok(())
}

fn be_to_gbr(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let bits = sample_bits(src.fmt);
    let line = src.linesize[0];
    let mut samples = vec![0u16; w as usize * 3];
    for row in 0..h as usize {
        unpack_be(&src.plane(0)[row * line..], bits, &mut samples);
        let ls = dst.linesize[0];
        let offs = dst.plane_offset;
        let data = dst.data.as_mut_slice();
        for px in 0..w as usize {
            put_le16(&mut data[offs[2] + row * ls..], px, samples[px * 3]);
            put_le16(&mut data[offs[0] + row * ls..], px, samples[px * 3 + 1]);
            put_le16(&mut data[offs[1] + row * ls..], px, samples[px * 3 + 2]);
        }
    }
    Ok(())
}

// V210 packs the same 4:2:2 sample sequence three to a little-endian
// 32-bit word, 10 bits each at bit offsets 0/10/20.
fn v210_to_be10(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let n = w as usize * 2;
    let line_src = src.linesize[0];
    let line_dst = dst.linesize[0];
    let mut samples = vec![0u16; n];
    for row in 0..h as usize {
        let line = &src.plane(0)[row * line_src..];
        for (i, s) in samples.iter_mut().enumerate() {
            let word = u32::from_le_bytes([
                line[(i / 3) * 4],
                line[(i / 3) * 4 + 1],
                line[(i / 3) * 4 + 2],
                line[(i / 3) * 4 + 3],
            ]);
            *s = ((word >> (10 * (i % 3))) & 0x3ff) as u16;
        }
        pack_be(
            &samples,
            10,
            &mut dst.plane_mut(0)[row * line_dst..(row + 1) * line_dst],
        );
    }
    Ok(())
}

fn be10_to_v210(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let n = w as usize * 2;
    let line_src = src.linesize[0];
    let line_dst = dst.linesize[0];
    let mut samples = vec![0u16; n];
    for row in 0..h as usize {
        unpack_be(&src.plane(0)[row * line_src..], 10, &mut samples);
        let line = &mut dst.plane_mut(0)[row * line_dst..(row + 1) * line_dst];
        line.fill(0);
        for (i, &s) in samples.iter().enumerate() {
            let word_idx = (i / 3) * 4;
            let mut word = u32::from_le_bytes([
                line[word_idx],
                line[word_idx + 1],
                line[word_idx + 2],
                line[word_idx + 3],
            ]);
            word |= (s as u32) << (10 * (i % 3));
            line[word_idx..word_idx + 4].copy_from_slice(&word.to_le_bytes());
        }
    }
    Ok(())
}

// Y210 left-justifies each sample in a 16-bit container, sequence
// Y0 Cb Y1 Cr per pixel pair.
fn y210_to_be10(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let line_src = src.linesize[0];
    let line_dst = dst.linesize[0];
    let mut samples = vec![0u16; w as usize * 2];
    for row in 0..h as usize {
        let line = &src.plane(0)[row * line_src..];
        for g in 0..w as usize / 2 {
            let y0 = le16_at(line, g * 4) >> 6;
            let cb = le16_at(line, g * 4 + 1) >> 6;
            let y1 = le16_at(line, g * 4 + 2) >> 6;
            let cr = le16_at(line, g * 4 + 3) >> 6;
            samples[g * 4] = cb;
            samples[g * 4 + 1] = y0;
            samples[g * 4 + 2] = cr;
            samples[g * 4 + 3] = y1;
        }
        pack_be(
            &samples,
            10,
            &mut dst.plane_mut(0)[row * line_dst..(row + 1) * line_dst],
        );
    }
    Ok(())
}

fn be10_to_y210(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let line_src = src.linesize[0];
    let line_dst = dst.linesize[0];
    let mut samples = vec![0u16; w as usize * 2];
    for row in 0..h as usize {
        unpack_be(&src.plane(0)[row * line_src..], 10, &mut samples);
        let line = &mut dst.plane_mut(0)[row * line_dst..(row + 1) * line_dst];
        for g in 0..w as usize / 2 {
            put_le16(line, g * 4, samples[g * 4 + 1] << 6);
            put_le16(line, g * 4 + 1, samples[g * 4] << 6);
            put_le16(line, g * 4 + 2, samples[g * 4 + 3] << 6);
            put_le16(line, g * 4 + 3, samples[g * 4 + 2] << 6);
        }
    }
    Ok(())
}

// The 8-bit conversions drop the two least significant bits.

fn be10_to_uyvy(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let line_src = src.linesize[0];
    let line_dst = dst.linesize[0];
    let mut samples = vec![0u16; w as usize * 2];
    for row in 0..h as usize {
        unpack_be(&src.plane(0)[row * line_src..], 10, &mut samples);
        let line = &mut dst.plane_mut(0)[row * line_dst..];
        // wire order Cb Y0 Cr Y1 matches UYVY byte order
        for (i, &s) in samples.iter().enumerate() {
            line[i] = (s >> 2) as u8;
        }
    }
    Ok(())
}

fn be10_to_planar8_422(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let line_src = src.linesize[0];
    let mut samples = vec![0u16; w as usize * 2];
    for row in 0..h as usize {
        unpack_be(&src.plane(0)[row * line_src..], 10, &mut samples);
        let (ls_y, ls_u, ls_v) = (dst.linesize[0], dst.linesize[1], dst.linesize[2]);
        let offs = dst.plane_offset;
        let data = dst.data.as_mut_slice();
        for g in 0..w as usize / 2 {
            data[offs[1] + row * ls_u + g] = (samples[g * 4] >> 2) as u8;
            data[offs[0] + row * ls_y + g * 2] = (samples[g * 4 + 1] >> 2) as u8;
            data[offs[2] + row * ls_v + g] = (samples[g * 4 + 2] >> 2) as u8;
            data[offs[0] + row * ls_y + g * 2 + 1] = (samples[g * 4 + 3] >> 2) as u8;
        }
    }
    Ok(())
}

fn be10_to_planar8_420(src: &Frame, dst: &mut Frame) -> Result<()> {
    let (w, h) = check_pair(src, dst)?;
    let line_src = src.linesize[0];
    let mut samples = vec![0u16; w as usize * 2];
    for row in 0..h as usize {
        unpack_be(&src.plane(0)[row * line_src..], 10, &mut samples);
        let (ls_y, ls_u, ls_v) = (dst.linesize[0], dst.linesize[1], dst.linesize[2]);
        let offs = dst.plane_offset;
        let data = dst.data.as_mut_slice();
        for g in 0..w as usize / 2 {
            data[offs[0] + row * ls_y + g * 2] = (samples[g * 4 + 1] >> 2) as u8;
            data[offs[0] + row * ls_y + g * 2 + 1] = (samples[g * 4 + 3] >> 2) as u8;
            // chroma decimated vertically: even rows only
            if row % 2 == 0 {
                data[offs[1] + (row / 2) * ls_u + g] = (samples[g * 4] >> 2) as u8;
                data[offs[2] + (row / 2) * ls_v + g] = (samples[g * 4 + 2] >> 2) as u8;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn frame(fmt: PixelFormat, w: u32, h: u32) -> Frame {
        Frame::alloc(fmt, w, h, false).unwrap()
    }

    /// Fill a 16-bit-LE planar frame with a deterministic sample pattern.
    fn fill_le16(f: &mut Frame, bits: u32) {
        let mask = (1u16 << bits) - 1;
        let mut c = 1u16;
        for p in 0..f.fmt.planes() {
            let n = f.plane(p).len() / 2;
            let plane = f.plane_mut(p);
            for i in 0..n {
                put_le16(plane, i, c & mask);
                c = c.wrapping_mul(31).wrapping_add(7);
            }
        }
    }

    #[test]
    fn mid_gray_422_10_group_layout() {
        // one group, all samples 0x200: Cb[9:2]=0x80 leads the 40-bit word
        let mut f = frame(PixelFormat::Yuv422Planar10Le, 2, 1);
        for p in 0..3 {
            let n = f.plane(p).len() / 2;
            let plane = f.plane_mut(p);
            for i in 0..n {
                put_le16(plane, i, 0x200);
            }
        }
        let mut wire = frame(PixelFormat::Yuv422Rfc4175Be10, 2, 1);
        planar422_to_be(&f, &mut wire).unwrap();
        assert_eq!(wire.data.as_slice(), &[0x80, 0x20, 0x08, 0x02, 0x00]);

        let mut back = frame(PixelFormat::Yuv422Planar10Le, 2, 1);
        be_to_planar422(&wire, &mut back).unwrap();
        assert_eq!(back.data.as_slice(), f.data.as_slice());
    }

    #[test]
    fn pack_unpack_be_inverse_10_and_12() {
        for bits in [10u32, 12] {
            let samples: Vec<u16> = (0..24).map(|i| (i * 977) & ((1 << bits) - 1)).collect();
            let mut buf = vec![0u8; samples.len() * bits as usize / 8];
            pack_be(&samples, bits, &mut buf);
            let mut out = vec![0u16; samples.len()];
            unpack_be(&buf, bits, &mut out);
            assert_eq!(out, samples, "{bits}-bit");
        }
    }

    #[test]
    fn round_trip_planar422_10_and_12() {
        for (sfmt, wfmt) in [
            (
                PixelFormat::Yuv422Planar10Le,
                PixelFormat::Yuv422Rfc4175Be10,
            ),
            (
                PixelFormat::Yuv422Planar12Le,
                PixelFormat::Yuv422Rfc4175Be12,
            ),
        ] {
            let mut src = frame(sfmt, 32, 4);
            fill_le16(&mut src, sample_bits(wfmt));
            let mut wire = frame(wfmt, 32, 4);
            get_converter(sfmt, wfmt).unwrap()(&src, &mut wire).unwrap();
            let mut back = frame(sfmt, 32, 4);
            get_converter(wfmt, sfmt).unwrap()(&wire, &mut back).unwrap();
            assert_eq!(back.data.as_slice(), src.data.as_slice(), "{wfmt:?}");
        }
    }

    #[test]
    fn round_trip_planar444_and_gbr() {
        for (sfmt, wfmt) in [
            (
                PixelFormat::Yuv444Planar10Le,
                PixelFormat::Yuv444Rfc4175Be10,
            ),
            (
                PixelFormat::Yuv444Planar12Le,
                PixelFormat::Yuv444Rfc4175Be12,
            ),
            (PixelFormat::GbrPlanar10Le, PixelFormat::RgbRfc4175Be10),
            (PixelFormat::GbrPlanar12Le, PixelFormat::RgbRfc4175Be12),
        ] {
            let mut src = frame(sfmt, 16, 3);
            fill_le16(&mut src, sample_bits(wfmt));
            let mut wire = frame(wfmt, 16, 3);
            get_converter(sfmt, wfmt).unwrap()(&src, &mut wire).unwrap();
            let mut back = frame(sfmt, 16, 3);
            get_converter(wfmt, sfmt).unwrap()(&wire, &mut back).unwrap();
            assert_eq!(back.data.as_slice(), src.data.as_slice(), "{wfmt:?}");
        }
    }

    #[test]
    fn round_trip_v210() {
        let mut src = frame(PixelFormat::V210, 48, 2);
        // fill only the sample positions; padding bits stay zero
        let mut wire = frame(PixelFormat::Yuv422Rfc4175Be10, 48, 2);
        for (i, b) in src.data.as_mut_slice().iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(13);
        }
        // clear the upper 2 bits of every word so the container is valid v210
        for w in src.data.as_mut_slice().chunks_exact_mut(4) {
            let mut word = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
            word &= 0x3fff_ffff;
            w.copy_from_slice(&word.to_le_bytes());
        }
        v210_to_be10(&src, &mut wire).unwrap();
        let mut back = frame(PixelFormat::V210, 48, 2);
        be10_to_v210(&wire, &mut back).unwrap();
        assert_eq!(back.data.as_slice(), src.data.as_slice());
    }

    #[test]
    fn round_trip_y210() {
        let mut src = frame(PixelFormat::Y210, 8, 2);
        let n = src.plane(0).len() / 2;
        {
            let plane = src.plane_mut(0);
            for i in 0..n {
                // 10-bit sample left-justified in the 16-bit container
                put_le16(plane, i, (((i * 353) & 0x3ff) as u16) << 6);
            }
        }
        let mut wire = frame(PixelFormat::Yuv422Rfc4175Be10, 8, 2);
        y210_to_be10(&src, &mut wire).unwrap();
        let mut back = frame(PixelFormat::Y210, 8, 2);
        be10_to_y210(&wire, &mut back).unwrap();
        assert_eq!(back.data.as_slice(), src.data.as_slice());
    }

    #[test]
    fn lossy_8bit_drops_low_bits() {
        let mut planar = frame(PixelFormat::Yuv422Planar10Le, 4, 2);
        fill_le16(&mut planar, 10);
        let mut wire = frame(PixelFormat::Yuv422Rfc4175Be10, 4, 2);
        planar422_to_be(&planar, &mut wire).unwrap();

        let mut uyvy = frame(PixelFormat::Uyvy, 4, 2);
        be10_to_uyvy(&wire, &mut uyvy).unwrap();
        // first sample of the wire row is Cb0
        let cb0 = le16_at(planar.plane(1), 0);
        assert_eq!(uyvy.data.as_slice()[0], (cb0 >> 2) as u8);

        let mut p8 = frame(PixelFormat::Yuv422Planar8, 4, 2);
        be10_to_planar8_422(&wire, &mut p8).unwrap();
        let y0 = le16_at(planar.plane(0), 0);
        assert_eq!(p8.plane(0)[0], (y0 >> 2) as u8);

        let mut p420 = frame(PixelFormat::Yuv420Planar8, 4, 2);
        be10_to_planar8_420(&wire, &mut p420).unwrap();
        assert_eq!(p420.plane(0)[0], (y0 >> 2) as u8);
        assert_eq!(p420.plane(1).len(), 2 * 1);
    }

    #[test]
    fn unsupported_pair_absent_from_table() {
        assert!(!supported(
            PixelFormat::Uyvy,
            PixelFormat::Yuv422Rfc4175Be10
        ));
        assert!(!supported(
            PixelFormat::Yuv422Planar10Le,
            PixelFormat::Yuv422Rfc4175Be12
        ));
        assert!(!supported(PixelFormat::Rgb8, PixelFormat::RgbRfc4175Be10));
    }

    #[test]
    fn geometry_mismatch_rejected() {
        let src = frame(PixelFormat::Yuv422Planar10Le, 32, 4);
        let mut dst = frame(PixelFormat::Yuv422Rfc4175Be10, 16, 4);
        assert!(planar422_to_be(&src, &mut dst).is_err());
    }
}
