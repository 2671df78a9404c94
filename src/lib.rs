//! # nackft
//!
//! UDP 기반 NACK 재전송 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **고정 크기 세그먼트**: 파일을 `segment_size` 단위로 분할, 시퀀스 번호로 정렬
//! - **MD5 체크섬**: 세그먼트마다 128비트 다이제스트로 채널 손상 검출
//! - **라운드 기반 NACK**: 전체 브로드캐스트 후 누락/손상 세그먼트만 재요청
//! - **세션 분리**: 피어 주소별 독립 세션 태스크 (공유 상태 없음)
//! - **부분 출력 없음**: 모든 세그먼트 검증 후에만 파일 기록

pub mod config;
pub mod error;
pub mod message;
pub mod receiver;
pub mod segment;
pub mod segmenter;
pub mod sender;
pub mod server;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{ControlMessage, Inbound};
pub use receiver::{Admission, FaultInjection, ReceivedFile, ReceptionTable, Receiver};
pub use segment::{DecodedSegment, Sequence};
pub use segmenter::{Segmenter, TransferDescriptor};
pub use sender::{SenderSession, SessionOutcome};
pub use server::Server;
pub use stats::{ServerStats, TransferStats};
pub use transport::{Link, PeerLink, SessionLink};

/// 기본 세그먼트 크기 (바이트)
pub const DEFAULT_SEGMENT_SIZE: usize = 1400;

/// 데이터 프레임 헤더 크기: sequence(4) + payload_len(4) + md5(16)
pub const SEGMENT_HEADER_LEN: usize = 24;

/// 수신 버퍼 최대 크기
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// 헤더 포함 데이터 프레임이 UDP 페이로드 한도(65507)를 넘지 않는 최대 세그먼트 크기
pub const MAX_SEGMENT_SIZE: usize = 65507 - SEGMENT_HEADER_LEN;
