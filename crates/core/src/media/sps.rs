//! H.264 sequence parameter set decoding (ITU-T H.264 §7.3.2.1.1).
//!
//! Only the fields needed to derive the coded picture size are read;
//! parsing stops after the frame cropping offsets.

/// Fields of interest from a sequence parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

/// Remove emulation-prevention bytes (`00 00 03` → `00 00`).
pub fn strip_emulation_prevention(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &b in nal {
        if zeros == 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn bits(&mut self, n: u32) -> Option<u32> {
        let mut v = 0u32;
        for _ in 0..n {
            v = (v << 1) | self.bit()?;
        }
        Some(v)
    }

    /// Unsigned Exp-Golomb code.
    fn ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let rest = self.bits(zeros)?;
        Some((1u32 << zeros) - 1 + rest)
    }

    /// Signed Exp-Golomb code.
    fn se(&mut self) -> Option<i32> {
        let k = self.ue()?;
        let magnitude = k.div_ceil(2) as i32;
        Some(if k % 2 == 1 { magnitude } else { -magnitude })
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

/// Parse an SPS NAL unit (including its one-byte NAL header).
///
/// Returns `None` if the unit is truncated or not an SPS.
pub fn parse_sps(nal: &[u8]) -> Option<SpsInfo> {
    let rbsp = strip_emulation_prevention(nal);
    let mut r = BitReader::new(&rbsp);

    let header = r.bits(8)?;
    if header & 0x1f != 7 {
        return None;
    }
    let profile_idc = r.bits(8)? as u8;
    let constraint_flags = r.bits(8)? as u8;
    let level_idc = r.bits(8)? as u8;
    let _sps_id = r.ue()?;

    if matches!(profile_idc, 44 | 83 | 86 | 100 | 110 | 118 | 122 | 128 | 244) {
        let chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            r.bit()?;
        }
        let _bit_depth_luma = r.ue()?;
        let _bit_depth_chroma = r.ue()?;
        let _qpprime_bypass = r.bit()?;
        if r.bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num = r.ue()?;
    match r.ue()? {
        0 => {
            r.ue()?;
        }
        1 => {
            r.bit()?;
            r.se()?;
            r.se()?;
            let cycle = r.ue()?;
            for _ in 0..cycle {
                r.se()?;
            }
        }
        _ => {}
    }

    let _max_num_ref_frames = r.ue()?;
    let _gaps_allowed = r.bit()?;
    let width_mbs = r.ue()? + 1;
    let height_map_units = r.ue()? + 1;
    let frame_mbs_only = r.bit()?;
    if frame_mbs_only == 0 {
        r.bit()?;
    }
    let _direct_8x8 = r.bit()?;

    let (mut left, mut right, mut top, mut bottom) = (0, 0, 0, 0);
    if r.bit()? == 1 {
        left = r.ue()?;
        right = r.ue()?;
        top = r.ue()?;
        bottom = r.ue()?;
    }

    let width = (width_mbs * 16).checked_sub(2 * (left + right))?;
    let height = ((2 - frame_mbs_only) * height_map_units * 16).checked_sub(2 * (top + bottom))?;

    Some(SpsInfo {
        profile_idc,
        constraint_flags,
        level_idc,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::prelude::{BASE64_STANDARD, Engine as _};

    fn decode(b64: &str) -> Vec<u8> {
        BASE64_STANDARD.decode(b64).unwrap()
    }

    #[test]
    fn baseline_720p() {
        let info = parse_sps(&decode("Z0IAH5WoFAFuQA==")).unwrap();
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.level_idc, 31);
        assert_eq!((info.width, info.height), (1280, 720));
    }

    #[test]
    fn high_1080p_with_cropping() {
        let info = parse_sps(&decode("Z2QAKKzZQHgCJ+WEAAADAAQAAAMA8DxgxlYA")).unwrap();
        assert_eq!(info.profile_idc, 100);
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn main_1080p() {
        let info = parse_sps(&decode("Z00AKpY1QPAET8s3AQEBAg==")).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn rejects_non_sps() {
        assert!(parse_sps(&[0x68, 0xce, 0x38, 0x80]).is_none());
    }

    #[test]
    fn rejects_truncated() {
        assert!(parse_sps(&[0x67, 0x42]).is_none());
    }

    #[test]
    fn strips_emulation_prevention() {
        assert_eq!(
            strip_emulation_prevention(&[0, 0, 3, 1, 0, 0, 3]),
            vec![0, 0, 1, 0, 0]
        );
    }
}
