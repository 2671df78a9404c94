//! 세그먼트 코덱
//!
//! 데이터 프레임 레이아웃 (빅엔디안):
//!
//! ```text
//! +-----------+---------------+----------------+-----------------+
//! | seq (u32) | len (u32)     | md5 (16 bytes) | payload (len)   |
//! +-----------+---------------+----------------+-----------------+
//! ```
//!
//! 코덱은 프레이밍만 담당하며 체크섬 검증은 호출측 책임이다.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};

use crate::{Error, Result, SEGMENT_HEADER_LEN};

/// 세그먼트 시퀀스 번호 (전송 내 0부터 연속)
pub type Sequence = u32;

/// 128비트 페이로드 다이제스트
pub type Checksum = [u8; 16];

/// 페이로드 체크섬 계산 (시퀀스 번호와 무관)
pub fn checksum(payload: &[u8]) -> Checksum {
    Md5::digest(payload).into()
}

/// 세그먼트를 데이터 프레임으로 직렬화
pub fn encode(sequence: Sequence, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_LEN + payload.len());
    buf.put_u32(sequence);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&checksum(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// 프레임에서 꺼낸 세그먼트 (체크섬 미검증)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSegment {
    pub sequence: Sequence,
    pub payload_len: u32,
    pub checksum: Checksum,
    pub payload: Bytes,
}

impl DecodedSegment {
    /// 데이터 프레임 역직렬화
    ///
    /// 헤더보다 짧거나 선언된 길이가 버퍼를 넘으면 `MalformedSegment`.
    /// 선언된 길이 뒤의 잉여 바이트는 무시한다.
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.len() < SEGMENT_HEADER_LEN {
            return Err(Error::malformed_segment(format!(
                "frame too short for header: {} < {}",
                frame.len(),
                SEGMENT_HEADER_LEN
            )));
        }

        let sequence = frame.get_u32();
        let payload_len = frame.get_u32();
        let mut checksum = [0u8; 16];
        frame.copy_to_slice(&mut checksum);

        if payload_len as usize > frame.len() {
            return Err(Error::malformed_segment(format!(
                "seq {} declares {} payload bytes, only {} present",
                sequence,
                payload_len,
                frame.len()
            )));
        }
        let payload = frame.split_to(payload_len as usize);

        Ok(Self {
            sequence,
            payload_len,
            checksum,
            payload,
        })
    }

    /// 수신측에서 체크섬을 다시 계산해 비교
    pub fn is_intact(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }

    /// 검증된 (sequence, payload) 반환, 손상 시 `ChecksumMismatch`
    pub fn into_verified(self) -> Result<(Sequence, Bytes)> {
        if self.is_intact() {
            Ok((self.sequence, self.payload))
        } else {
            Err(Error::ChecksumMismatch {
                sequence: self.sequence,
            })
        }
    }
}

/// `DecodedSegment::decode`의 함수형 별칭
pub fn decode(frame: Bytes) -> Result<DecodedSegment> {
    DecodedSegment::decode(frame)
}
