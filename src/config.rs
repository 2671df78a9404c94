//! 프로토콜 설정

use std::time::Duration;

use crate::{Error, Result, DEFAULT_SEGMENT_SIZE, MAX_DATAGRAM_SIZE, MAX_SEGMENT_SIZE};

/// 전송 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 세그먼트 크기 (바이트), 송신측이 OK 메시지로 확정
    pub segment_size: usize,

    /// 파라미터(OK/ERROR) 응답 대기 타임아웃 (밀리초)
    pub request_timeout_ms: u64,

    /// GET 요청 시도 횟수 (1이면 재시도 없음)
    pub request_attempts: u32,

    /// 수신 라운드 유휴 타임아웃 (밀리초)
    /// 데이터그램이 도착할 때마다 다시 시작됨
    pub round_idle_timeout_ms: u64,

    /// 송신측 피드백(NACK/COMPLETE) 대기 시간 (밀리초)
    /// 이 시간 동안 조용하면 전송 완료로 간주
    pub feedback_timeout_ms: u64,

    /// 최대 수신 라운드 수 (첫 브로드캐스트 포함)
    pub max_rounds: u32,

    /// 데이터그램이 하나도 없는 라운드가 연속 몇 번이면 포기할지
    pub max_silent_rounds: u32,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,

    /// 세션별 수신 큐 깊이 (서버)
    pub session_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            request_timeout_ms: 5000,         // 5초
            request_attempts: 1,
            round_idle_timeout_ms: 2000,      // 2초 (< feedback_timeout)
            feedback_timeout_ms: 5000,        // 5초
            max_rounds: 64,
            max_silent_rounds: 3,
            recv_buffer_size: MAX_DATAGRAM_SIZE,
            session_queue_depth: 1024,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 같은 호스트 내 전송용 설정 (짧은 타임아웃)
    pub fn loopback() -> Self {
        Self {
            request_timeout_ms: 1000,
            round_idle_timeout_ms: 200,
            feedback_timeout_ms: 1000,
            max_rounds: 16,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            segment_size: 1000,               // 작은 세그먼트
            request_timeout_ms: 3000,
            request_attempts: 5,
            round_idle_timeout_ms: 3000,
            feedback_timeout_ms: 8000,
            max_rounds: 256,
            max_silent_rounds: 5,
            ..Self::default()
        }
    }

    /// 세그먼트 크기 변경
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 || self.segment_size > MAX_SEGMENT_SIZE {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "segment_size must be in 1..={}, got {}",
                    MAX_SEGMENT_SIZE, self.segment_size
                ),
            });
        }
        let zero_field = [
            ("request_timeout_ms", self.request_timeout_ms),
            ("round_idle_timeout_ms", self.round_idle_timeout_ms),
            ("feedback_timeout_ms", self.feedback_timeout_ms),
            ("request_attempts", self.request_attempts as u64),
            ("max_rounds", self.max_rounds as u64),
            ("max_silent_rounds", self.max_silent_rounds as u64),
            ("session_queue_depth", self.session_queue_depth as u64),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        if let Some((name, _)) = zero_field {
            return Err(Error::InvalidConfig {
                reason: format!("{name} must be positive"),
            });
        }
        if self.recv_buffer_size < self.segment_size + crate::SEGMENT_HEADER_LEN {
            return Err(Error::InvalidConfig {
                reason: "recv_buffer_size smaller than one data frame".into(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn round_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.round_idle_timeout_ms)
    }

    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_millis(self.feedback_timeout_ms)
    }
}
