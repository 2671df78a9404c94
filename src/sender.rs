//! 송신 세션 (서버측, 요청 하나당 하나)
//!
//! 상태 흐름:
//! `ANNOUNCING → BROADCASTING → AWAITING_FEEDBACK → (RETRANSMITTING → AWAITING_FEEDBACK)* → CLOSED`
//!
//! - 수신측 보유 세그먼트는 추적하지 않음 (라운드 간 무상태)
//! - 재전송 페이로드는 매번 오프셋 읽기로 다시 만듦
//! - 피드백 대기 중 조용하면 완료로 간주

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::message::{ControlMessage, ERROR_BAD_REQUEST, ERROR_NOT_FOUND, ERROR_TOO_LARGE};
use crate::segment::{self, Sequence};
use crate::segmenter::{run_blocking, Segmenter};
use crate::stats::TransferStats;
use crate::transport::Link;
use crate::{Config, Error, Result};

/// 블로킹 풀에 한 번에 맡기는 세그먼트 읽기 수
const READ_BATCH: usize = 64;

/// 세션 종료 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// 수신측이 COMPLETE 전송
    Confirmed,

    /// 피드백 대기 타임아웃 (완료로 간주)
    AssumedComplete,

    /// ERROR 응답 후 종료
    Rejected { code: String },
}

/// 브로드캐스트 이후 상태
#[derive(Debug)]
enum SessionState {
    Broadcasting,
    AwaitingFeedback,
    Retransmitting(Vec<Sequence>),
    Closed(SessionOutcome),
}

/// 송신 세션
pub struct SenderSession<L: Link> {
    link: L,
    root: PathBuf,
    config: Config,
    stats: TransferStats,
}

impl<L: Link> SenderSession<L> {
    pub fn new(link: L, root: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            link,
            root: root.into(),
            config,
            stats: TransferStats::new(),
        }
    }

    /// 통계 반환
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 요청된 파일에 대해 세션을 끝까지 진행
    pub async fn run(&mut self, name: &str) -> Result<SessionOutcome> {
        let peer = self.link.peer();

        let segmenter = match self.announce(name).await? {
            Ok(segmenter) => segmenter,
            Err(code) => {
                info!("[{}] 요청 거절: {:?} -> ERROR:{}", peer, name, code);
                return Ok(SessionOutcome::Rejected {
                    code: code.to_string(),
                });
            }
        };

        let mut state = SessionState::Broadcasting;
        loop {
            state = match state {
                SessionState::Broadcasting => {
                    self.broadcast(&segmenter).await?;
                    SessionState::AwaitingFeedback
                }
                SessionState::AwaitingFeedback => self.await_feedback().await?,
                SessionState::Retransmitting(sequences) => {
                    self.retransmit(&segmenter, sequences).await?;
                    SessionState::AwaitingFeedback
                }
                SessionState::Closed(outcome) => {
                    info!("[{}] 세션 종료: {:?} | {}", peer, outcome, self.stats.summary());
                    return Ok(outcome);
                }
            };
        }
    }

    /// ANNOUNCING: 경로 확인 후 OK 또는 ERROR 전송
    async fn announce(
        &mut self,
        name: &str,
    ) -> Result<std::result::Result<Segmenter, &'static str>> {
        let opened = if name.trim().is_empty() {
            Err(ERROR_BAD_REQUEST)
        } else {
            let root = self.root.clone();
            let requested = name.to_string();
            let segment_size = self.config.segment_size;
            // 경로 해석(canonicalize)과 파일 열기 모두 블로킹 풀에서
            run_blocking(move || open_served(&root, &requested, segment_size)).await?
        };

        match opened {
            Ok(segmenter) => {
                let descriptor = segmenter.descriptor();
                self.link
                    .send(&ControlMessage::Parameters(descriptor).to_bytes())
                    .await?;
                info!(
                    "[{}] 전송 시작: {:?} ({} bytes, {} segments x {} bytes)",
                    self.link.peer(),
                    segmenter.path(),
                    descriptor.file_size,
                    descriptor.total_segments,
                    descriptor.segment_size
                );
                Ok(Ok(segmenter))
            }
            Err(code) => {
                self.link
                    .send(&ControlMessage::error(code).to_bytes())
                    .await?;
                Ok(Err(code))
            }
        }
    }

    /// BROADCASTING: 모든 세그먼트 전송 후 END
    async fn broadcast(&mut self, segmenter: &Segmenter) -> Result<()> {
        let total = segmenter.descriptor().total_segments;
        let mut next: Sequence = 0;
        while next < total {
            let end = next.saturating_add(READ_BATCH as Sequence).min(total);
            for (sequence, payload) in segmenter.read_payloads((next..end).collect()).await? {
                self.link.send(&segment::encode(sequence, &payload)).await?;
                self.stats.data_frames += 1;
                self.stats.total_bytes += payload.len() as u64;
            }
            next = end;
        }
        self.end_round().await?;

        debug!(
            "[{}] 첫 라운드 완료: {} frames, 피드백 {}ms 대기",
            self.link.peer(),
            self.stats.data_frames,
            self.config.feedback_timeout_ms
        );
        Ok(())
    }

    /// AWAITING_FEEDBACK: NACK → 재전송, COMPLETE → 종료, 침묵 → 완료 간주
    async fn await_feedback(&mut self) -> Result<SessionState> {
        loop {
            let Some(datagram) = self.link.recv(self.config.feedback_timeout()).await? else {
                debug!("[{}] 피드백 타임아웃", self.link.peer());
                return Ok(SessionState::Closed(SessionOutcome::AssumedComplete));
            };

            match ControlMessage::parse(&datagram) {
                Ok(ControlMessage::Completion) => {
                    return Ok(SessionState::Closed(SessionOutcome::Confirmed));
                }
                Ok(ControlMessage::RetransmitRequest { sequences }) => {
                    self.stats.nacks += 1;
                    return Ok(SessionState::Retransmitting(sequences));
                }
                Ok(other) => {
                    debug!("[{}] 피드백 대기 중 {} 무시", self.link.peer(), other.kind());
                }
                Err(e) => {
                    warn!("[{}] 피드백 파싱 실패: {}", self.link.peer(), e);
                }
            }
        }
    }

    /// RETRANSMITTING: 범위 내 요청 시퀀스만 재전송 후 END
    async fn retransmit(&mut self, segmenter: &Segmenter, mut sequences: Vec<Sequence>) -> Result<()> {
        sequences.sort_unstable();
        sequences.dedup();

        let mut resent = 0u64;
        for batch in sequences.chunks(READ_BATCH) {
            let payloads = segmenter.read_payloads(batch.to_vec()).await?;
            if payloads.len() < batch.len() {
                debug!("범위 밖 NACK 시퀀스 {}개 무시", batch.len() - payloads.len());
            }
            for (sequence, payload) in payloads {
                self.link.send(&segment::encode(sequence, &payload)).await?;
                self.stats.data_frames += 1;
                self.stats.total_bytes += payload.len() as u64;
                resent += 1;
            }
        }
        self.stats.retransmitted_segments += resent;
        self.end_round().await?;

        debug!("[{}] 재전송 {} segments", self.link.peer(), resent);
        Ok(())
    }

    async fn end_round(&mut self) -> Result<()> {
        self.stats.rounds += 1;
        self.link.send(&ControlMessage::RoundEnd.to_bytes()).await
    }
}

/// 이름 해석 후 파일 열기 (블로킹), 거절이면 에러 코드
fn open_served(
    root: &Path,
    name: &str,
    segment_size: usize,
) -> Result<std::result::Result<Segmenter, &'static str>> {
    let Some(path) = resolve_served_path(root, name) else {
        return Ok(Err(ERROR_NOT_FOUND));
    };
    match Segmenter::open(&path, segment_size) {
        Ok(segmenter) => Ok(Ok(segmenter)),
        Err(Error::TransferTooLarge { file_size }) => {
            warn!("파일이 너무 큼: {:?} ({} bytes)", path, file_size);
            Ok(Err(ERROR_TOO_LARGE))
        }
        Err(Error::Io(e)) => {
            warn!("파일 열기 실패: {:?}: {}", path, e);
            Ok(Err(ERROR_NOT_FOUND))
        }
        Err(e) => Err(e),
    }
}

/// 요청 이름을 서비스 루트 안의 일반 파일 경로로 해석
///
/// 루트를 벗어나는 경로 (`..`, 심볼릭 링크 포함)는 없는 파일과 동일하게 `None`.
/// 선행 `/`는 루트 기준 상대 경로로 취급.
pub fn resolve_served_path(root: &Path, name: &str) -> Option<PathBuf> {
    let relative = Path::new(name.trim_start_matches(['/', '\\']));

    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    let root = root.canonicalize().ok()?;
    let candidate = root.join(relative).canonicalize().ok()?;

    if candidate.starts_with(&root) && candidate.is_file() {
        Some(candidate)
    } else {
        None
    }
}
