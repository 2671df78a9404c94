//! 수신 루프 (클라이언트측)
//!
//! 상태 흐름:
//! `REQUESTING → AWAITING_PARAMETERS → RECEIVING_ROUND → (NACK → RECEIVING_ROUND)* → REASSEMBLING → DONE`
//!
//! - 수신 테이블은 한 `Receiver::fetch` 호출이 독점하고 라운드마다 명시적으로 전달
//! - 데이터그램 단위 오류(프레이밍, 체크섬)는 라운드 안에서 복구
//! - 모든 세그먼트가 검증되기 전에는 출력 파일을 만들지 않음

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::message::{self, ControlMessage, Inbound, ERROR_NOT_FOUND};
use crate::segment::{DecodedSegment, Sequence};
use crate::segmenter::TransferDescriptor;
use crate::stats::TransferStats;
use crate::transport::{Link, PeerLink};
use crate::{Config, Error, Result};

/// 세그먼트 수락 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 처음 검증된 세그먼트
    Stored,

    /// 이미 검증된 시퀀스의 재수신 (덮어씀)
    Duplicate,

    /// 체크섬 또는 길이 불일치
    Corrupted,

    /// 전송 범위 밖 시퀀스
    OutOfRange,
}

/// 수신 테이블: 검증된 페이로드 + 손상 표시
#[derive(Debug, Clone)]
pub struct ReceptionTable {
    descriptor: TransferDescriptor,
    segments: BTreeMap<Sequence, Bytes>,
    corrupted: BTreeSet<Sequence>,
}

impl ReceptionTable {
    pub fn new(descriptor: TransferDescriptor) -> Self {
        Self {
            descriptor,
            segments: BTreeMap::new(),
            corrupted: BTreeSet::new(),
        }
    }

    pub fn descriptor(&self) -> TransferDescriptor {
        self.descriptor
    }

    /// 디코딩된 세그먼트 검증 후 반영
    ///
    /// 이미 검증된 시퀀스의 손상 사본은 기존 페이로드를 건드리지 않는다.
    pub fn admit(&mut self, segment: DecodedSegment) -> Admission {
        let sequence = segment.sequence;
        let Some(expected_len) = self.descriptor.payload_len(sequence) else {
            return Admission::OutOfRange;
        };

        let intact = segment.is_intact() && segment.payload.len() == expected_len;
        if !intact {
            if !self.segments.contains_key(&sequence) {
                self.corrupted.insert(sequence);
            }
            return Admission::Corrupted;
        }

        self.corrupted.remove(&sequence);
        match self.segments.insert(sequence, segment.payload) {
            Some(_) => Admission::Duplicate,
            None => Admission::Stored,
        }
    }

    /// 검증된 세그먼트 수
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn contains(&self, sequence: Sequence) -> bool {
        self.segments.contains_key(&sequence)
    }

    /// 아직 검증된 페이로드가 없는 시퀀스
    pub fn missing(&self) -> Vec<Sequence> {
        (0..self.descriptor.total_segments)
            .filter(|sequence| !self.segments.contains_key(sequence))
            .collect()
    }

    /// 손상으로 표시된 시퀀스
    pub fn corrupted(&self) -> Vec<Sequence> {
        self.corrupted.iter().copied().collect()
    }

    /// NACK 대상: missing ∪ corrupted (오름차순, 중복 없음)
    pub fn retransmit_list(&self) -> Vec<Sequence> {
        let mut wanted: BTreeSet<Sequence> = self.missing().into_iter().collect();
        wanted.extend(self.corrupted.iter().copied());
        wanted.into_iter().collect()
    }

    /// 키 집합이 {0..total_segments-1}와 같으면 완료
    pub fn is_complete(&self) -> bool {
        self.segments.len() == self.descriptor.total_segments as usize
            && self.corrupted.is_empty()
    }

    fn first_missing(&self) -> Option<Sequence> {
        (0..self.descriptor.total_segments).find(|sequence| !self.segments.contains_key(sequence))
    }

    /// 시퀀스 순서대로 페이로드만 기록
    ///
    /// 누락이 있으면 아무것도 쓰지 않고 `MissingSegment` (프로토콜 로직 결함).
    pub fn reassemble<W: Write>(&self, out: &mut W) -> Result<u64> {
        if let Some(sequence) = self.first_missing() {
            return Err(Error::MissingSegment { sequence });
        }

        let mut written = 0u64;
        for payload in self.segments.values() {
            out.write_all(payload)?;
            written += payload.len() as u64;
        }
        Ok(written)
    }
}

/// 장애 주입 (첫 라운드에만 적용)
#[derive(Debug, Clone, Default)]
pub struct FaultInjection {
    drop_sequences: BTreeSet<Sequence>,
    loss_ratio: f64,
}

impl FaultInjection {
    pub fn none() -> Self {
        Self::default()
    }

    /// 첫 라운드에서 지정 시퀀스 버림
    pub fn drop_sequences(sequences: impl IntoIterator<Item = Sequence>) -> Self {
        Self {
            drop_sequences: sequences.into_iter().collect(),
            loss_ratio: 0.0,
        }
    }

    /// 첫 라운드에서 무작위로 버릴 비율 (0.0 ~ 1.0)
    pub fn with_loss_ratio(mut self, ratio: f64) -> Self {
        self.loss_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn is_active(&self) -> bool {
        !self.drop_sequences.is_empty() || self.loss_ratio > 0.0
    }

    fn should_drop(&self, sequence: Sequence, round: u32) -> bool {
        if round != 1 {
            return false;
        }
        self.drop_sequences.contains(&sequence)
            || (self.loss_ratio > 0.0 && rand::random::<f64>() < self.loss_ratio)
    }
}

/// 완료된 전송 (모든 세그먼트 검증됨)
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    table: ReceptionTable,
}

impl ReceivedFile {
    pub fn descriptor(&self) -> TransferDescriptor {
        self.table.descriptor()
    }

    pub fn table(&self) -> &ReceptionTable {
        &self.table
    }

    /// 조립된 파일 바이트
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.descriptor().file_size as usize);
        self.table.reassemble(&mut out)?;
        Ok(out)
    }

    /// REASSEMBLING: 출력 파일 기록
    ///
    /// 같은 디렉터리의 임시 파일에 모두 쓴 뒤 rename. 도중에 실패하면 대상 경로는 그대로.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<u64> {
        if let Some(sequence) = self.table.first_missing() {
            return Err(Error::MissingSegment { sequence });
        }

        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut out = BufWriter::new(NamedTempFile::new_in(dir)?);
        let written = self.table.reassemble(&mut out)?;
        let staged = out.into_inner().map_err(|e| e.into_error())?;
        staged.as_file().sync_all()?;
        staged.persist(path).map_err(|e| e.error)?;
        Ok(written)
    }
}

/// 라운드 집계
#[derive(Debug, Default)]
struct RoundReport {
    datagrams: u64,
    saw_round_end: bool,
}

/// 수신자
pub struct Receiver<L: Link> {
    link: L,
    config: Config,
    faults: FaultInjection,
    stats: TransferStats,
}

impl Receiver<PeerLink> {
    /// 임시 포트에 바인딩해 서버용 수신자 생성
    pub async fn connect(server_addr: SocketAddr, config: Config) -> Result<Self> {
        config.validate()?;
        let local: SocketAddr = if server_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let link = PeerLink::bind(local, server_addr, config.recv_buffer_size).await?;
        info!("Bound to local address: {}", link.local_addr()?);
        Ok(Self::new(link, config))
    }
}

impl<L: Link> Receiver<L> {
    pub fn new(link: L, config: Config) -> Self {
        Self {
            link,
            config,
            faults: FaultInjection::none(),
            stats: TransferStats::new(),
        }
    }

    /// 장애 주입 설정
    pub fn with_faults(mut self, faults: FaultInjection) -> Self {
        self.faults = faults;
        self
    }

    /// 통계 반환
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 파일 요청부터 모든 세그먼트 검증까지
    pub async fn fetch(&mut self, name: &str) -> Result<ReceivedFile> {
        self.stats = TransferStats::new();

        let descriptor = self.request_parameters(name).await?;
        info!(
            "Server ready: file_size={}, segment_size={}, total_segments={}",
            descriptor.file_size, descriptor.segment_size, descriptor.total_segments
        );

        let mut table = ReceptionTable::new(descriptor);
        let mut silent_rounds = 0u32;

        while !table.is_complete() {
            if self.stats.rounds >= self.config.max_rounds {
                return Err(Error::RoundLimitExceeded {
                    rounds: self.stats.rounds,
                    outstanding: table.retransmit_list().len(),
                });
            }

            if self.stats.rounds > 0 {
                let outstanding = table.retransmit_list();
                let batch = message::retransmit_batch(&outstanding);
                info!(
                    "Requesting retransmission of {} segments (NACK, {} outstanding)",
                    batch.len(),
                    outstanding.len()
                );
                let nack = ControlMessage::RetransmitRequest {
                    sequences: batch.to_vec(),
                };
                self.link.send(&nack.to_bytes()).await?;
                self.stats.nacks += 1;
            }

            self.stats.rounds += 1;
            let round = self.stats.rounds;
            let report = self.receive_round(&mut table, round).await?;

            debug!(
                "라운드 {} 종료: datagrams={}, END={}, {}/{} 검증, 손상 {}",
                round,
                report.datagrams,
                report.saw_round_end,
                table.len(),
                descriptor.total_segments,
                table.corrupted().len()
            );

            if report.datagrams == 0 {
                silent_rounds += 1;
                if silent_rounds >= self.config.max_silent_rounds {
                    return Err(Error::Timeout {
                        waited_ms: silent_rounds as u64 * self.config.round_idle_timeout_ms,
                    });
                }
            } else {
                silent_rounds = 0;
            }
        }

        self.link
            .send(&ControlMessage::Completion.to_bytes())
            .await?;
        info!("All segments received and verified | {}", self.stats.summary());

        Ok(ReceivedFile { table })
    }

    /// REQUESTING + AWAITING_PARAMETERS
    async fn request_parameters(&mut self, name: &str) -> Result<TransferDescriptor> {
        let request = ControlMessage::request(name).to_bytes();

        for attempt in 1..=self.config.request_attempts {
            self.link.send(&request).await?;
            debug!("GET {} -> {} (attempt {})", name, self.link.peer(), attempt);

            let deadline = tokio::time::Instant::now() + self.config.request_timeout();
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let Some(datagram) = self.link.recv(remaining).await? else {
                    break;
                };

                match Inbound::classify(datagram)? {
                    Inbound::Control(ControlMessage::Parameters(descriptor)) => {
                        descriptor.validate()?;
                        return Ok(descriptor);
                    }
                    Inbound::Control(ControlMessage::Error { code }) => {
                        return Err(if code == ERROR_NOT_FOUND {
                            Error::NotFound {
                                name: name.to_string(),
                            }
                        } else {
                            Error::ServerError { code }
                        });
                    }
                    Inbound::Control(other) => {
                        debug!("파라미터 대기 중 {} 무시", other.kind());
                    }
                    Inbound::Data(_) => {
                        debug!("파라미터 이전 데이터 프레임 무시");
                    }
                }
            }
        }

        warn!("Timeout waiting for server response");
        Err(Error::PeerUnreachable)
    }

    /// RECEIVING_ROUND: END 또는 유휴 타임아웃까지
    async fn receive_round(&mut self, table: &mut ReceptionTable, round: u32) -> Result<RoundReport> {
        let mut report = RoundReport::default();

        loop {
            let Some(datagram) = self.link.recv(self.config.round_idle_timeout()).await? else {
                debug!("라운드 {} 유휴 타임아웃", round);
                return Ok(report);
            };
            report.datagrams += 1;

            match Inbound::classify(datagram) {
                Ok(Inbound::Data(frame)) => self.ingest(table, frame, round),
                Ok(Inbound::Control(ControlMessage::RoundEnd)) => {
                    report.saw_round_end = true;
                    return Ok(report);
                }
                Ok(Inbound::Control(ControlMessage::Error { code })) => {
                    return Err(Error::ServerError { code });
                }
                Ok(Inbound::Control(other)) => {
                    debug!("라운드 중 {} 무시", other.kind());
                }
                Err(e) => {
                    self.stats.malformed_frames += 1;
                    warn!("제어 메시지 파싱 실패: {}", e);
                }
            }
        }
    }

    /// 데이터 프레임 하나 처리 (실패는 로그만 남기고 버림)
    fn ingest(&mut self, table: &mut ReceptionTable, frame: Bytes, round: u32) {
        let segment = match DecodedSegment::decode(frame) {
            Ok(segment) => segment,
            Err(e) => {
                self.stats.malformed_frames += 1;
                warn!("잘못된 패킷: {}", e);
                return;
            }
        };

        let sequence = segment.sequence;
        if self.faults.should_drop(sequence, round) {
            self.stats.injected_drops += 1;
            debug!("Simulation: dropping segment {}", sequence);
            return;
        }

        self.stats.data_frames += 1;
        let len = segment.payload.len() as u64;
        match table.admit(segment) {
            Admission::Stored => self.stats.total_bytes += len,
            Admission::Duplicate => self.stats.duplicate_segments += 1,
            Admission::Corrupted => {
                self.stats.corrupted_segments += 1;
                warn!("Segment {} failed checksum", sequence);
            }
            Admission::OutOfRange => {
                self.stats.out_of_range_segments += 1;
                warn!("범위 밖 시퀀스 무시: {}", sequence);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment;
    use crate::segmenter::Segmenter;
    use crate::sender::{SenderSession, SessionOutcome};
    use crate::transport::memory::{self, MemoryLink};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            request_timeout_ms: 300,
            round_idle_timeout_ms: 100,
            feedback_timeout_ms: 500,
            ..Config::loopback()
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    fn served(name: &str, data: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(name), data).unwrap();
        dir
    }

    fn spawn_sender(
        link: MemoryLink,
        dir: &tempfile::TempDir,
        name: &str,
        config: Config,
    ) -> tokio::task::JoinHandle<Result<SessionOutcome>> {
        let root = dir.path().to_path_buf();
        let name = name.to_string();
        tokio::spawn(async move { SenderSession::new(link, root, config).run(&name).await })
    }

    fn sent_text(link: &MemoryLink) -> Vec<String> {
        link.sent_log()
            .lock()
            .iter()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .collect()
    }

    fn descriptor(file_size: u64, segment_size: usize) -> TransferDescriptor {
        TransferDescriptor::for_file(file_size, segment_size).unwrap()
    }

    // ─── ReceptionTable ───

    #[test]
    fn test_round_trip_through_table() {
        for (len, segment_size) in [(0, 1), (1, 1), (3000, 1400), (2800, 1400), (1000, 7), (513, 512)] {
            let data = sample(len);
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(&data).unwrap();

            let segmenter = Segmenter::open(file.path(), segment_size).unwrap();
            let mut table = ReceptionTable::new(segmenter.descriptor());
            for item in segmenter.segments().unwrap() {
                let (sequence, payload) = item.unwrap();
                let decoded = DecodedSegment::decode(segment::encode(sequence, &payload)).unwrap();
                assert_eq!(table.admit(decoded), Admission::Stored);
            }

            assert!(table.is_complete(), "len={len} segment_size={segment_size}");
            let mut out = Vec::new();
            assert_eq!(table.reassemble(&mut out).unwrap(), len as u64);
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_idempotent_retransmission() {
        let data = sample(3000);
        let mut table = ReceptionTable::new(descriptor(3000, 1400));
        for (sequence, chunk) in data.chunks(1400).enumerate() {
            table.admit(DecodedSegment::decode(segment::encode(sequence as u32, chunk)).unwrap());
        }
        let before = table.to_owned();

        let again = DecodedSegment::decode(segment::encode(1, &data[1400..2800])).unwrap();
        assert_eq!(table.admit(again), Admission::Duplicate);

        assert_eq!(table.segments, before.segments);
        assert!(table.is_complete());
        let mut out = Vec::new();
        table.reassemble(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_corruption_marks_then_clears() {
        let mut table = ReceptionTable::new(descriptor(10, 4));

        let mut bad = DecodedSegment::decode(segment::encode(1, b"abcd")).unwrap();
        bad.payload = Bytes::from_static(b"abce");
        assert_eq!(table.admit(bad), Admission::Corrupted);
        assert_eq!(table.corrupted(), vec![1]);
        assert!(!table.contains(1));
        assert_eq!(table.retransmit_list(), vec![0, 1, 2]);

        let good = DecodedSegment::decode(segment::encode(1, b"abcd")).unwrap();
        assert_eq!(table.admit(good), Admission::Stored);
        assert!(table.corrupted().is_empty());
        assert_eq!(table.retransmit_list(), vec![0, 2]);
    }

    #[test]
    fn test_corrupt_copy_keeps_valid_payload() {
        let mut table = ReceptionTable::new(descriptor(4, 4));
        table.admit(DecodedSegment::decode(segment::encode(0, b"abcd")).unwrap());

        let mut bad = DecodedSegment::decode(segment::encode(0, b"abcd")).unwrap();
        bad.payload = Bytes::from_static(b"zzzz");
        assert_eq!(table.admit(bad), Admission::Corrupted);

        assert!(table.is_complete());
        assert!(table.retransmit_list().is_empty());
    }

    #[test]
    fn test_wrong_length_and_out_of_range() {
        let mut table = ReceptionTable::new(descriptor(10, 4));

        // 체크섬은 맞지만 마지막 세그먼트 길이(2)와 다름
        let short = DecodedSegment::decode(segment::encode(2, b"x")).unwrap();
        assert_eq!(table.admit(short), Admission::Corrupted);

        let beyond = DecodedSegment::decode(segment::encode(3, b"xx")).unwrap();
        assert_eq!(table.admit(beyond), Admission::OutOfRange);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_reassemble_refuses_gaps() {
        let mut table = ReceptionTable::new(descriptor(8, 4));
        table.admit(DecodedSegment::decode(segment::encode(1, b"efgh")).unwrap());

        let mut out = Vec::new();
        assert!(matches!(
            table.reassemble(&mut out),
            Err(Error::MissingSegment { sequence: 0 })
        ));
        assert!(out.is_empty());

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let partial = ReceivedFile { table };
        assert!(partial.write_to(&target).is_err());
        assert!(!target.exists());
    }

    #[test]
    fn test_write_to_leaves_nothing_on_failure() {
        let mut table = ReceptionTable::new(descriptor(4, 4));
        table.admit(DecodedSegment::decode(segment::encode(0, b"abcd")).unwrap());
        let received = ReceivedFile { table };

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        assert_eq!(received.write_to(&target).unwrap(), 4);
        assert_eq!(std::fs::read(&target).unwrap(), b"abcd");

        // 대상이 디렉터리면 rename 실패, 임시 파일도 남지 않음
        let blocked = dir.path().join("taken");
        std::fs::create_dir_all(blocked.join("inner")).unwrap();
        assert!(received.write_to(&blocked).is_err());
        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        names.sort();
        assert_eq!(names, vec!["out.bin", "taken"]);
    }

    #[test]
    fn test_empty_transfer_is_complete() {
        let table = ReceptionTable::new(descriptor(0, 1400));
        assert!(table.is_complete());
        assert!(table.retransmit_list().is_empty());
    }

    // ─── Receiver 루프 (메모리 링크) ───

    #[tokio::test]
    async fn test_scenario_drop_one_then_recover() {
        let data = sample(3000);
        let dir = served("file.bin", &data);
        let (client, server) = memory::pair();
        let sender = spawn_sender(server, &dir, "file.bin", test_config());

        let mut receiver =
            Receiver::new(client, test_config()).with_faults(FaultInjection::drop_sequences([1]));
        let received = receiver.fetch("file.bin").await.unwrap();

        assert_eq!(received.descriptor().total_segments, 3);
        assert_eq!(received.to_bytes().unwrap(), data);
        assert_eq!(
            sent_text(&receiver.link),
            vec!["GET file.bin", "NACK 1", "COMPLETE"]
        );
        assert_eq!(receiver.stats().injected_drops, 1);
        assert_eq!(receiver.stats().rounds, 2);
        assert_eq!(sender.await.unwrap().unwrap(), SessionOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_not_found_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (client, server) = memory::pair();
        tokio::spawn(async move { SenderSession::new(server, root, test_config()).run("nope").await });

        let mut receiver = Receiver::new(client, test_config());
        match receiver.fetch("nope").await {
            Err(Error::NotFound { name }) => assert_eq!(name, "nope"),
            other => panic!("unexpected: {:?}", other.map(|f| f.descriptor())),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let (client, _server) = memory::pair();
        let config = Config {
            request_attempts: 2,
            request_timeout_ms: 50,
            ..test_config()
        };

        let mut receiver = Receiver::new(client, config);
        assert!(matches!(
            receiver.fetch("x").await,
            Err(Error::PeerUnreachable)
        ));
        assert_eq!(sent_text(&receiver.link), vec!["GET x", "GET x"]);
    }

    #[tokio::test]
    async fn test_malformed_parameters_abort() {
        for reply in ["OK 10 4", "OK 3000 1400 5", "OK 10 0 0"] {
            let (client, mut server) = memory::pair();
            let mut receiver = Receiver::new(client, test_config());

            let fake = tokio::spawn(async move {
                server.recv(Duration::from_secs(1)).await.unwrap();
                server.send(reply.as_bytes()).await.unwrap();
                server
            });

            assert!(
                matches!(
                    receiver.fetch("f").await,
                    Err(Error::MalformedControlMessage { .. })
                ),
                "{reply:?} should abort"
            );
            fake.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_corruption_detected_and_repaired() {
        let data = sample(5000);
        let dir = served("c.bin", &data);
        let (client, server) = memory::pair();

        // 시퀀스 2의 첫 전송만 비트 반전
        let corrupted_once = Arc::new(AtomicUsize::new(0));
        let counter = corrupted_once.clone();
        server.set_filter(Box::new(move |datagram: Bytes| {
            if datagram.len() > crate::SEGMENT_HEADER_LEN
                && datagram[..4] == 2u32.to_be_bytes()
                && counter.fetch_add(1, Ordering::SeqCst) == 0
            {
                let mut flipped = datagram.to_vec();
                flipped[crate::SEGMENT_HEADER_LEN + 10] ^= 0x40;
                return Some(Bytes::from(flipped));
            }
            Some(datagram)
        }));
        let sender = spawn_sender(server, &dir, "c.bin", test_config());

        let mut receiver = Receiver::new(client, test_config());
        let received = receiver.fetch("c.bin").await.unwrap();

        assert_eq!(received.to_bytes().unwrap(), data);
        assert_eq!(receiver.stats().corrupted_segments, 1);
        assert_eq!(sent_text(&receiver.link)[1], "NACK 2");
        assert_eq!(sender.await.unwrap().unwrap(), SessionOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_loss_recovery_converges_without_round_end() {
        let data = sample(20_000);
        let dir = served("lossy.bin", &data);
        let (client, server) = memory::pair();

        // 처음 두 라운드: 짝수 시퀀스와 END 모두 손실
        let ends = Arc::new(AtomicUsize::new(0));
        let seen = ends.clone();
        server.set_filter(Box::new(move |datagram: Bytes| {
            let lossy = seen.load(Ordering::SeqCst) < 2;
            if &datagram[..] == b"END" {
                seen.fetch_add(1, Ordering::SeqCst);
                return if lossy { None } else { Some(datagram) };
            }
            let is_data = matches!(Inbound::classify(datagram.clone()), Ok(Inbound::Data(_)));
            if lossy && is_data && datagram[3] % 2 == 0 {
                return None;
            }
            Some(datagram)
        }));
        let sender = spawn_sender(server, &dir, "lossy.bin", test_config());

        let mut receiver = Receiver::new(client, test_config());
        let received = receiver.fetch("lossy.bin").await.unwrap();

        assert_eq!(received.to_bytes().unwrap(), data);
        assert_eq!(received.table().len(), 15);
        assert!(receiver.stats().rounds >= 3);
        assert!(sender.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_large_nack_split_across_rounds() {
        // 20,000 세그먼트 전부 첫 라운드에서 손실
        let data = sample(200_000);
        let dir = served("many.bin", &data);
        let (client, server) = memory::pair();
        let sender_config = Config {
            segment_size: 10,
            ..test_config()
        };
        let sender = spawn_sender(server, &dir, "many.bin", sender_config);

        let mut receiver = Receiver::new(client, test_config())
            .with_faults(FaultInjection::none().with_loss_ratio(1.0));
        let received = receiver.fetch("many.bin").await.unwrap();

        assert_eq!(received.descriptor().total_segments, 20_000);
        assert_eq!(received.to_bytes().unwrap(), data);

        let log = receiver.link.sent_log();
        let nacks: Vec<Bytes> = log
            .lock()
            .iter()
            .filter(|d| d.starts_with(b"NACK"))
            .cloned()
            .collect();
        assert!(nacks.len() >= 2);
        assert!(nacks.iter().all(|d| d.len() <= message::MAX_CONTROL_LEN));
        assert!(nacks[0].starts_with(b"NACK 0,1,2,"));
        assert_eq!(sender.await.unwrap().unwrap(), SessionOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_malformed_frames_dropped_mid_round() {
        let (client, mut server) = memory::pair();
        let fake = tokio::spawn(async move {
            server.recv(Duration::from_secs(1)).await.unwrap();
            server.send(b"OK 8 4 2").await.unwrap();
            server.send(&segment::encode(0, b"abcd")).await.unwrap();

            // 헤더보다 짧은 프레임
            server.send(&[0u8; 10]).await.unwrap();

            // payload_len이 버퍼를 넘는 프레임
            let mut overrun = segment::encode(1, b"efgh").to_vec();
            overrun[4..8].copy_from_slice(&1000u32.to_be_bytes());
            server.send(&overrun).await.unwrap();

            server.send(&segment::encode(1, b"efgh")).await.unwrap();
            server.send(b"END").await.unwrap();
            server.recv(Duration::from_secs(1)).await.unwrap()
        });

        let mut receiver = Receiver::new(client, test_config());
        let received = receiver.fetch("f").await.unwrap();

        assert_eq!(received.to_bytes().unwrap(), b"abcdefgh");
        assert_eq!(receiver.stats().malformed_frames, 2);
        assert_eq!(receiver.stats().rounds, 1);
        assert_eq!(receiver.stats().nacks, 0);
        assert_eq!(fake.await.unwrap().as_deref(), Some(&b"COMPLETE"[..]));
    }

    #[tokio::test]
    async fn test_round_limit() {
        let data = sample(3000);
        let dir = served("stuck.bin", &data);
        let (client, server) = memory::pair();

        // 시퀀스 0은 절대 도착하지 않음
        server.set_filter(Box::new(|datagram: Bytes| {
            if datagram.len() > crate::SEGMENT_HEADER_LEN && datagram[..4] == [0, 0, 0, 0] {
                None
            } else {
                Some(datagram)
            }
        }));
        let _sender = spawn_sender(server, &dir, "stuck.bin", test_config());

        let config = Config {
            max_rounds: 3,
            ..test_config()
        };
        let mut receiver = Receiver::new(client, config);
        match receiver.fetch("stuck.bin").await {
            Err(Error::RoundLimitExceeded { rounds, outstanding }) => {
                assert_eq!(rounds, 3);
                assert_eq!(outstanding, 1);
            }
            other => panic!("unexpected: {:?}", other.map(|f| f.descriptor())),
        }
    }

    #[tokio::test]
    async fn test_empty_file_completes_immediately() {
        let dir = served("empty", b"");
        let (client, server) = memory::pair();
        let sender = spawn_sender(server, &dir, "empty", test_config());

        let mut receiver = Receiver::new(client, test_config());
        let received = receiver.fetch("empty").await.unwrap();

        assert_eq!(received.descriptor().total_segments, 0);
        assert!(received.to_bytes().unwrap().is_empty());
        assert_eq!(receiver.stats().rounds, 0);
        assert_eq!(sent_text(&receiver.link), vec!["GET empty", "COMPLETE"]);
        assert_eq!(sender.await.unwrap().unwrap(), SessionOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_silent_server_after_parameters() {
        let (client, mut server) = memory::pair();
        let fake = tokio::spawn(async move {
            server.recv(Duration::from_secs(1)).await.unwrap();
            server.send(b"OK 10 4 3").await.unwrap();
            // 데이터 없이 침묵
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let config = Config {
            max_silent_rounds: 2,
            ..test_config()
        };
        let mut receiver = Receiver::new(client, config);
        assert!(matches!(
            receiver.fetch("f").await,
            Err(Error::Timeout { .. })
        ));
        fake.abort();
    }
}
