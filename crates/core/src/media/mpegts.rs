//! MPEG-2 transport stream writer for a single H.264 program
//! (ISO/IEC 13818-1).
//!
//! ```text
//! PID 0x0000  PAT ─► program 1 ─► PMT on PID 0x0042
//! PID 0x0042  PMT ─► stream type 0x1B (H.264) on PID 0x0045, PCR on 0x0045
//! PID 0x0045  PES packets, one per NAL unit
//! ```
//!
//! Every NAL unit starts a new PES packet of unbounded length whose first
//! TS packet carries the PCR. IDR units are preceded by a PAT and PMT and
//! get the random-access indicator, so a reader can start decoding at any
//! I-frame byte offset recorded in the index.
//!
//! Each PES payload is Annex B: an access unit delimiter, the SPS/PPS from
//! the session description (IDR units only), then the NAL unit itself.

use std::io::{self, Write};

use super::is_iframe;

pub const TS_PACKET_LEN: usize = 188;
const TS_PAYLOAD_LEN: usize = TS_PACKET_LEN - 4;
const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x0042;
pub const VIDEO_PID: u16 = 0x0045;
pub const STREAM_TYPE_H264: u8 = 0x1b;

const TRANSPORT_STREAM_ID: u16 = 0x22dc;
const PROGRAM_NUMBER: u16 = 1;
const PAT_VERSION: u8 = 5;

/// Decode delay applied to PTS/DTS relative to the PCR (0.75 s).
pub const PTS_OFFSET: u64 = 67_500;

/// Length of the adaptation field when it carries a PCR.
const PCR_ADAPTATION_LEN: usize = 8;

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const ACCESS_UNIT_DELIMITER: [u8; 6] = [0, 0, 0, 1, 0x09, 0xe0];

const PSI_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_MPEG_2);

/// Write adapter that counts bytes written through it.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn with_crc(mut section: Vec<u8>) -> Vec<u8> {
    let crc = PSI_CRC.checksum(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

/// Program association section mapping program 1 to [`PMT_PID`].
fn pat_section() -> Vec<u8> {
    let mut s = vec![0x00, 0xb0, 0x0d];
    s.extend_from_slice(&TRANSPORT_STREAM_ID.to_be_bytes());
    s.extend_from_slice(&[0xc1 | (PAT_VERSION << 1), 0x00, 0x00]);
    s.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
    s.extend_from_slice(&(0xe000 | PMT_PID).to_be_bytes());
    with_crc(s)
}

/// Program map section with a single H.264 elementary stream.
fn pmt_section() -> Vec<u8> {
    let mut s = vec![0x02, 0xb0, 0x18];
    s.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
    s.extend_from_slice(&[0xc1, 0x00, 0x00]);
    s.extend_from_slice(&(0xe000 | VIDEO_PID).to_be_bytes());
    s.extend_from_slice(&[0xf0, 0x00]);
    s.push(STREAM_TYPE_H264);
    s.extend_from_slice(&(0xe000 | VIDEO_PID).to_be_bytes());
    // ES info: empty ISO 639 language descriptor
    s.extend_from_slice(&[0xf0, 0x06, 0x0a, 0x04, 0x00, 0x00, 0x00, 0x00]);
    with_crc(s)
}

/// 33-bit PTS/DTS in the 5-byte PES encoding.
fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    let ts = ts & 0x1_ffff_ffff;
    [
        (prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
        (ts >> 22) as u8,
        (((ts >> 15) as u8 & 0x7f) << 1) | 1,
        (ts >> 7) as u8,
        ((ts as u8 & 0x7f) << 1) | 1,
    ]
}

fn pes_header(out: &mut Vec<u8>, pts: u64, dts: u64) {
    out.extend_from_slice(&[0x00, 0x00, 0x01, 0xe0]);
    // unbounded length, PTS and DTS present, 10 header bytes
    out.extend_from_slice(&[0x00, 0x00, 0x80, 0xc0, 0x0a]);
    out.extend_from_slice(&encode_timestamp(0b0011, pts));
    out.extend_from_slice(&encode_timestamp(0b0001, dts));
}

struct Clock {
    pcr: u64,
    random_access: bool,
}

/// Transport stream writer.
pub struct TsWriter<W: Write> {
    out: CountingWriter<W>,
    pat_counter: u8,
    pmt_counter: u8,
    video_counter: u8,
    parameter_sets: Vec<Vec<u8>>,
}

impl<W: Write> TsWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            out: CountingWriter::new(inner),
            pat_counter: 0,
            pmt_counter: 0,
            video_counter: 0,
            parameter_sets: Vec::new(),
        }
    }

    /// SPS/PPS NAL units written ahead of every IDR unit.
    pub fn set_parameter_sets(&mut self, sets: Vec<Vec<u8>>) {
        tracing::trace!(count = sets.len(), "parameter sets configured");
        self.parameter_sets = sets;
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.out.count()
    }

    pub fn get_ref(&self) -> &W {
        self.out.get_ref()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    /// Write the PAT and PMT.
    pub fn write_tables(&mut self) -> io::Result<()> {
        let mut pat = vec![0x00];
        pat.extend(pat_section());
        let cc = next_counter(&mut self.pat_counter);
        self.write_packet(PAT_PID, true, cc, None, &pat)?;

        let mut pmt = vec![0x00];
        pmt.extend(pmt_section());
        let cc = next_counter(&mut self.pmt_counter);
        self.write_packet(PMT_PID, true, cc, None, &pmt)
    }

    /// Begin a NAL unit: tables (IDR only), PES header and the first bytes.
    ///
    /// `data` excludes the NAL header byte.
    pub fn start_unit(&mut self, nal_header: u8, data: &[u8], timestamp: u64) -> io::Result<()> {
        let iframe = is_iframe(nal_header);
        if iframe {
            self.write_tables()?;
        }

        let sets_len: usize = if iframe {
            self.parameter_sets.iter().map(|s| s.len() + 4).sum()
        } else {
            0
        };
        let mut payload =
            Vec::with_capacity(19 + ACCESS_UNIT_DELIMITER.len() + sets_len + 5 + data.len());
        pes_header(&mut payload, timestamp + PTS_OFFSET, timestamp + PTS_OFFSET);
        payload.extend_from_slice(&ACCESS_UNIT_DELIMITER);
        if iframe {
            for set in &self.parameter_sets {
                payload.extend_from_slice(&START_CODE);
                payload.extend_from_slice(set);
            }
        }
        payload.extend_from_slice(&START_CODE);
        payload.push(nal_header);
        payload.extend_from_slice(data);

        let clock = Clock {
            pcr: timestamp,
            random_access: iframe,
        };
        self.write_pes_payload(&payload, Some(clock))
    }

    /// Continue the current NAL unit.
    pub fn continue_unit(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_pes_payload(data, None)
    }

    fn write_pes_payload(&mut self, mut data: &[u8], mut clock: Option<Clock>) -> io::Result<()> {
        let mut start = clock.is_some();
        while !data.is_empty() {
            let reserved = if clock.is_some() { PCR_ADAPTATION_LEN } else { 0 };
            let n = data.len().min(TS_PAYLOAD_LEN - reserved);
            let cc = next_counter(&mut self.video_counter);
            self.write_packet(VIDEO_PID, start, cc, clock.take(), &data[..n])?;
            data = &data[n..];
            start = false;
        }
        Ok(())
    }

    /// Write one 188-byte packet; short payloads are padded with
    /// adaptation field stuffing.
    fn write_packet(
        &mut self,
        pid: u16,
        unit_start: bool,
        counter: u8,
        clock: Option<Clock>,
        payload: &[u8],
    ) -> io::Result<()> {
        debug_assert!(!payload.is_empty() && payload.len() <= TS_PAYLOAD_LEN);
        let mut pkt = [0xffu8; TS_PACKET_LEN];
        let adaptation = TS_PAYLOAD_LEN - payload.len();

        pkt[0] = SYNC_BYTE;
        pkt[1] = ((unit_start as u8) << 6) | ((pid >> 8) as u8 & 0x1f);
        pkt[2] = pid as u8;
        let control = if adaptation > 0 { 0x30 } else { 0x10 };
        pkt[3] = control | (counter & 0x0f);

        if adaptation > 0 {
            pkt[4] = (adaptation - 1) as u8;
            if adaptation > 1 {
                pkt[5] = 0x00;
                if let Some(clock) = clock {
                    pkt[5] |= 0x10;
                    if clock.random_access {
                        pkt[5] |= 0x40;
                    }
                    let pcr = ((clock.pcr & 0x1_ffff_ffff) << 15) | 0x7e00;
                    pkt[6..12].copy_from_slice(&pcr.to_be_bytes()[2..]);
                }
            }
        }

        pkt[4 + adaptation..].copy_from_slice(payload);
        self.out.write_all(&pkt)
    }
}

fn next_counter(counter: &mut u8) -> u8 {
    let cc = *counter;
    *counter = (cc + 1) & 0x0f;
    cc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(bytes: &[u8]) -> Vec<&[u8]> {
        assert_eq!(bytes.len() % TS_PACKET_LEN, 0);
        bytes.chunks(TS_PACKET_LEN).collect()
    }

    fn pid(pkt: &[u8]) -> u16 {
        (((pkt[1] & 0x1f) as u16) << 8) | pkt[2] as u16
    }

    fn payload(pkt: &[u8]) -> &[u8] {
        if pkt[3] & 0x20 != 0 {
            &pkt[5 + pkt[4] as usize..]
        } else {
            &pkt[4..]
        }
    }

    fn decode_timestamp(b: &[u8]) -> u64 {
        (((b[0] >> 1) & 0x07) as u64) << 30
            | (b[1] as u64) << 22
            | ((b[2] >> 1) as u64) << 15
            | (b[3] as u64) << 7
            | (b[4] >> 1) as u64
    }

    #[test]
    fn pat_and_pmt_bytes() {
        let mut w = TsWriter::new(Vec::new());
        w.write_tables().unwrap();
        let out = w.into_inner();
        let pkts = packets(&out);
        assert_eq!(pkts.len(), 2);

        assert_eq!(&pkts[0][..6], &[0x47, 0x40, 0x00, 0x30, 0xa6, 0x00]);
        assert_eq!(
            &pkts[0][171..],
            &[
                0x00, 0x00, 0xb0, 0x0d, 0x22, 0xdc, 0xcb, 0x00, 0x00, 0x00, 0x01, 0xe0, 0x42, 0xb5,
                0x6a, 0x38, 0x6c
            ]
        );

        assert_eq!(&pkts[1][..6], &[0x47, 0x40, 0x42, 0x30, 0x9b, 0x00]);
        assert_eq!(
            &pkts[1][160..],
            &[
                0x00, 0x02, 0xb0, 0x18, 0x00, 0x01, 0xc1, 0x00, 0x00, 0xe0, 0x45, 0xf0, 0x00, 0x1b,
                0xe0, 0x45, 0xf0, 0x06, 0x0a, 0x04, 0x00, 0x00, 0x00, 0x00, 0xb1, 0xc5, 0x6e, 0xdb
            ]
        );
    }

    #[test]
    fn small_unit_fits_one_packet() {
        let mut w = TsWriter::new(Vec::new());
        w.start_unit(0x41, &[1, 2, 3], 9000).unwrap();
        let out = w.into_inner();
        let pkts = packets(&out);
        assert_eq!(pkts.len(), 1);

        let pkt = pkts[0];
        assert_eq!(pid(pkt), VIDEO_PID);
        assert_eq!(pkt[1] & 0x40, 0x40, "payload unit start");
        assert_eq!(pkt[5] & 0x10, 0x10, "PCR flag");
        assert_eq!(pkt[5] & 0x40, 0, "not random access");

        let pcr_base =
            u64::from_be_bytes([0, 0, pkt[6], pkt[7], pkt[8], pkt[9], pkt[10], pkt[11]]) >> 15;
        assert_eq!(pcr_base, 9000);

        let pes = payload(pkt);
        assert_eq!(&pes[..4], &[0, 0, 1, 0xe0]);
        assert_eq!(decode_timestamp(&pes[9..14]), 9000 + PTS_OFFSET);
        assert_eq!(decode_timestamp(&pes[14..19]), 9000 + PTS_OFFSET);
        assert_eq!(&pes[19..25], &ACCESS_UNIT_DELIMITER);
        assert_eq!(&pes[25..], &[0, 0, 0, 1, 0x41, 1, 2, 3]);
    }

    #[test]
    fn idr_unit_has_tables_and_parameter_sets() {
        let mut w = TsWriter::new(Vec::new());
        w.set_parameter_sets(vec![vec![0x67, 0x42], vec![0x68, 0xce]]);
        w.start_unit(0x65, &[9], 0).unwrap();
        let out = w.into_inner();
        let pkts = packets(&out);

        assert_eq!(
            pkts.iter().map(|p| pid(p)).collect::<Vec<_>>(),
            vec![PAT_PID, PMT_PID, VIDEO_PID]
        );
        assert_eq!(pkts[2][5] & 0x50, 0x50, "PCR and random access");
        let pes = payload(pkts[2]);
        assert_eq!(
            &pes[25..],
            &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 9]
        );
    }

    #[test]
    fn large_unit_spans_packets() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut w = TsWriter::new(Vec::new());
        w.start_unit(0x41, &data[..500], 0).unwrap();
        w.continue_unit(&data[500..]).unwrap();
        w.continue_unit(&[]).unwrap();
        let position = w.position();
        let out = w.into_inner();
        assert_eq!(position, out.len() as u64);

        let pkts = packets(&out);
        let mut es = Vec::new();
        for (i, pkt) in pkts.iter().enumerate() {
            assert_eq!(pkt[0], SYNC_BYTE);
            assert_eq!(pkt[3] & 0x0f, i as u8 & 0x0f, "continuity counter");
            assert_eq!(pkt[1] & 0x40 != 0, i == 0);
            es.extend_from_slice(payload(pkt));
        }
        // PES header, AUD, start code, NAL header, then the data
        assert_eq!(&es[30..], &data[..]);
    }

    #[test]
    fn continuity_counter_wraps() {
        let mut w = TsWriter::new(Vec::new());
        for _ in 0..17 {
            w.start_unit(0x41, &[0], 0).unwrap();
        }
        let out = w.into_inner();
        let pkts = packets(&out);
        assert_eq!(pkts[15][3] & 0x0f, 15);
        assert_eq!(pkts[16][3] & 0x0f, 0);
    }

    #[test]
    fn one_byte_adaptation_field() {
        let mut w = TsWriter::new(Vec::new());
        w.continue_unit(&[0xaa; 183]).unwrap();
        let out = w.into_inner();
        assert_eq!(out.len(), TS_PACKET_LEN);
        assert_eq!(out[3] & 0x30, 0x30);
        assert_eq!(out[4], 0);
        assert_eq!(&out[5..], &[0xaa; 183][..]);
    }
}
