//! 에러 타입 정의

use thiserror::Error;

use crate::segment::Sequence;

/// 파일 전송 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("잘못된 세그먼트 프레임: {reason}")]
    MalformedSegment { reason: String },

    #[error("체크섬 불일치: sequence={sequence}")]
    ChecksumMismatch { sequence: Sequence },

    #[error("파일 없음: {name}")]
    NotFound { name: String },

    #[error("타임아웃: {waited_ms}ms 동안 응답 없음")]
    Timeout { waited_ms: u64 },

    #[error("서버 응답 없음")]
    PeerUnreachable,

    #[error("서버 에러 응답: ERROR:{code}")]
    ServerError { code: String },

    #[error("잘못된 제어 메시지: {reason}")]
    MalformedControlMessage { reason: String },

    #[error("유효하지 않은 설정: {reason}")]
    InvalidConfig { reason: String },

    #[error("라운드 한도 초과: {rounds} 라운드 후 {outstanding}개 세그먼트 미완료")]
    RoundLimitExceeded { rounds: u32, outstanding: usize },

    #[error("조립 중 세그먼트 누락: sequence={sequence}")]
    MissingSegment { sequence: Sequence },

    #[error("파일이 너무 큼: {file_size} bytes")]
    TransferTooLarge { file_size: u64 },

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    pub(crate) fn malformed_segment(reason: impl Into<String>) -> Self {
        Error::MalformedSegment {
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed_control(reason: impl Into<String>) -> Self {
        Error::MalformedControlMessage {
            reason: reason.into(),
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
