//! 전송 통계

use std::time::{Duration, Instant};

/// 단일 전송 통계 (송신 세션 / 수신 루프 공용)
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 진행한 라운드 수 (첫 브로드캐스트 포함)
    pub rounds: u32,

    /// 송신 또는 수신한 데이터 프레임 수
    pub data_frames: u64,

    /// 페이로드 바이트 합계
    pub total_bytes: u64,

    /// 재전송한 세그먼트 수 (송신측)
    pub retransmitted_segments: u64,

    /// 이미 검증된 시퀀스를 다시 받은 수 (수신측)
    pub duplicate_segments: u64,

    /// 체크섬 불일치 수
    pub corrupted_segments: u64,

    /// 프레이밍 오류로 버린 데이터그램 수
    pub malformed_frames: u64,

    /// 범위 밖 시퀀스로 버린 프레임 수
    pub out_of_range_segments: u64,

    /// 장애 주입으로 버린 프레임 수
    pub injected_drops: u64,

    /// NACK 송신(수신측) 또는 수신(송신측) 수
    pub nacks: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            rounds: 0,
            data_frames: 0,
            total_bytes: 0,
            retransmitted_segments: 0,
            duplicate_segments: 0,
            corrupted_segments: 0,
            malformed_frames: 0,
            out_of_range_segments: 0,
            injected_drops: 0,
            nacks: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Rounds: {} | Frames: {} | Bytes: {} | Throughput: {:.2} MB/s | Corrupted: {} | Duplicates: {} | NACKs: {}",
            self.elapsed().as_secs_f64(),
            self.rounds,
            self.data_frames,
            self.total_bytes,
            self.throughput() / 1_000_000.0,
            self.corrupted_segments,
            self.duplicate_segments,
            self.nacks,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 서버 전체 세션 결과 집계
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// 수락한 요청 수
    pub sessions_started: u64,

    /// COMPLETE로 끝난 세션
    pub confirmed: u64,

    /// 조용한 타임아웃으로 끝난 세션 (완료로 간주)
    pub assumed_complete: u64,

    /// ERROR로 거절한 요청
    pub rejected: u64,

    /// I/O 에러로 끝난 세션
    pub failed: u64,

    /// 재전송한 세그먼트 합계
    pub retransmitted_segments: u64,
}
