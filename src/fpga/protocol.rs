//! Job and result frame codec.
//!
//! Pure transforms between work items and the fixed-size byte frames the two
//! device classes speak. No state, no I/O; malformed lengths are programming
//! errors, not runtime conditions.
//!
//! Single-candidate devices take a 44-byte job frame (midstate with each
//! 4-byte word byte-reversed, then the 12-byte payload tail verbatim) and
//! answer with one big-endian 32-bit nonce. Multi-candidate devices take a
//! 60-byte frame (seven header words drawn from descending payload offsets,
//! each byte-reversed, then the midstate with its word *order* reversed) and
//! answer with a 16-byte record: progress counter, two best-candidate slots,
//! and a checksum tag, all little-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::work::{WorkItem, TAIL_LEN, TAIL_OFFSET};

/// Job frame size for single-candidate devices.
pub const SINGLE_JOB_FRAME_LEN: usize = 44;

/// Job frame size for multi-candidate devices.
pub const MULTI_JOB_FRAME_LEN: usize = 60;

/// Result frame size for single-candidate devices: one nonce.
pub const SINGLE_RESULT_LEN: usize = 4;

/// Result frame size for multi-candidate devices.
pub const MULTI_RESULT_LEN: usize = 16;

/// In-band control frames are always this long.
pub const CONTROL_FRAME_LEN: usize = 4;

// Multi-candidate devices consume the extended header as seven 32-bit words
// at these descending payload offsets.
const MULTI_HEADER_OFFSETS: [usize; 7] = [152, 148, 144, 140, 136, 132, 128];

const CONTROL_MAGIC: u8 = 0xb5;
const CONTROL_SET_CLOCK: u8 = 0x01;
const CONTROL_RESET: u8 = 0x02;

/// Build the job frame for a single-candidate device.
pub fn encode_single_job(work: &WorkItem) -> [u8; SINGLE_JOB_FRAME_LEN] {
    let mut frame = BytesMut::with_capacity(SINGLE_JOB_FRAME_LEN);
    put_words_reversed(&mut frame, &work.midstate);
    frame.put_slice(&work.payload[TAIL_OFFSET..TAIL_OFFSET + TAIL_LEN]);

    frame[..]
        .try_into()
        .expect("single job frame is fixed-size by construction")
}

/// Build the job frame for a multi-candidate device.
pub fn encode_multi_job(work: &WorkItem) -> [u8; MULTI_JOB_FRAME_LEN] {
    let mut frame = BytesMut::with_capacity(MULTI_JOB_FRAME_LEN);
    for offset in MULTI_HEADER_OFFSETS {
        put_words_reversed(&mut frame, &work.payload[offset..offset + 4]);
    }
    // Midstate goes out with its word order reversed, bytes within each word
    // untouched.
    for word in work.midstate.chunks_exact(4).rev() {
        frame.put_slice(word);
    }

    frame[..]
        .try_into()
        .expect("multi job frame is fixed-size by construction")
}

/// Decode a single-candidate result frame: one nonce, big-endian on the wire.
pub fn decode_single_result(buf: &[u8; SINGLE_RESULT_LEN]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// One decoded multi-candidate result frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiResult {
    /// Running search-space position, non-decreasing until the job wraps.
    pub progress: u32,
    /// Up to two best-candidate slots; zero means the slot is empty.
    pub best: [u32; 2],
    /// Checksum tag the device computed for `progress`.
    pub tag: u32,
}

/// Decode a multi-candidate result frame.
pub fn decode_multi_result(buf: &[u8; MULTI_RESULT_LEN]) -> MultiResult {
    let mut buf = &buf[..];
    MultiResult {
        progress: buf.get_u32_le(),
        best: [buf.get_u32_le(), buf.get_u32_le()],
        tag: buf.get_u32_le(),
    }
}

/// Control frame selecting a clock step on a frequency-tunable device.
pub fn encode_set_clock(step: usize) -> [u8; CONTROL_FRAME_LEN] {
    let step = step as u8;
    [
        CONTROL_MAGIC,
        CONTROL_SET_CLOCK,
        step,
        step ^ CONTROL_MAGIC,
    ]
}

/// Control frame resetting a frequency-tunable device.
pub fn encode_reset() -> [u8; CONTROL_FRAME_LEN] {
    [CONTROL_MAGIC, CONTROL_RESET, 0x00, CONTROL_MAGIC ^ CONTROL_RESET]
}

// Copy `src` (a multiple of 4 bytes) reversing byte order within each 4-byte
// word. Applying it twice is the identity, which is what makes the midstate
// recoverable from a framed job.
fn put_words_reversed(dst: &mut BytesMut, src: &[u8]) {
    for word in src.chunks_exact(4) {
        dst.put_slice(&[word[3], word[2], word[1], word[0]]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::PAYLOAD_LEN;
    use test_case::test_case;

    fn sample_work() -> WorkItem {
        let mut midstate = [0u8; 32];
        for (i, b) in midstate.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut payload = [0u8; PAYLOAD_LEN];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = 0xff - i as u8;
        }
        WorkItem {
            id: 42,
            midstate,
            payload,
        }
    }

    #[test]
    fn single_job_frame_layout() {
        let work = sample_work();
        let frame = encode_single_job(&work);

        assert_eq!(frame.len(), SINGLE_JOB_FRAME_LEN);
        // First midstate word 00 01 02 03 goes out as 03 02 01 00.
        assert_eq!(&frame[0..4], &[3, 2, 1, 0]);
        // Tail rides along verbatim.
        assert_eq!(&frame[32..44], &work.payload[128..140]);
    }

    #[test]
    fn single_job_midstate_roundtrips_through_word_reversal() {
        let work = sample_work();
        let frame = encode_single_job(&work);

        let mut recovered = BytesMut::new();
        put_words_reversed(&mut recovered, &frame[0..32]);
        assert_eq!(&recovered[..], &work.midstate);
    }

    #[test]
    fn multi_job_frame_layout() {
        let work = sample_work();
        let frame = encode_multi_job(&work);

        assert_eq!(frame.len(), MULTI_JOB_FRAME_LEN);
        // First header word comes from payload offset 152, byte-reversed.
        let expect: Vec<u8> = work.payload[152..156].iter().rev().copied().collect();
        assert_eq!(&frame[0..4], &expect[..]);
        // Last header word comes from offset 128.
        let expect: Vec<u8> = work.payload[128..132].iter().rev().copied().collect();
        assert_eq!(&frame[24..28], &expect[..]);
        // Midstate word order is reversed: the frame's first midstate word is
        // the work's last.
        assert_eq!(&frame[28..32], &work.midstate[28..32]);
        assert_eq!(&frame[56..60], &work.midstate[0..4]);
    }

    #[test]
    fn single_result_is_big_endian() {
        assert_eq!(decode_single_result(&[0x12, 0x34, 0x56, 0x78]), 0x1234_5678);
    }

    #[test]
    fn multi_result_field_offsets() {
        let mut buf = [0u8; MULTI_RESULT_LEN];
        buf[0..4].copy_from_slice(&0x0000_1000u32.to_le_bytes());
        buf[4..8].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        buf[8..12].copy_from_slice(&0xcafe_f00du32.to_le_bytes());
        buf[12..16].copy_from_slice(&0x0bad_5eedu32.to_le_bytes());

        let result = decode_multi_result(&buf);
        assert_eq!(result.progress, 0x0000_1000);
        assert_eq!(result.best, [0xdead_beef, 0xcafe_f00d]);
        assert_eq!(result.tag, 0x0bad_5eed);
    }

    #[test_case(0 => [0xb5, 0x01, 0x00, 0xb5]; "step_zero")]
    #[test_case(12 => [0xb5, 0x01, 0x0c, 0xb9]; "step_twelve")]
    #[test_case(61 => [0xb5, 0x01, 0x3d, 0x88]; "step_max")]
    fn set_clock_frames(step: usize) -> [u8; 4] {
        encode_set_clock(step)
    }

    #[test]
    fn reset_frame() {
        assert_eq!(encode_reset(), [0xb5, 0x02, 0x00, 0xb7]);
    }
}
