//! 프로토콜 메시지 정의
//!
//! 제어 메시지는 짧은 텍스트 프레임, 데이터는 바이너리 프레임 ([`crate::segment`]).
//! 제어 메시지는 닫힌 variant 집합으로 한 번에 파싱된다.

use std::fmt;

use bytes::Bytes;
use tracing::debug;

use crate::segment::{DecodedSegment, Sequence};
use crate::segmenter::TransferDescriptor;
use crate::{Error, Result};

/// 에러 코드: 파일 없음 (루트 밖 경로 포함)
pub const ERROR_NOT_FOUND: &str = "NOTFOUND";

/// 에러 코드: 세그먼트 수가 시퀀스 범위를 넘음
pub const ERROR_TOO_LARGE: &str = "TOOLARGE";

/// 에러 코드: 빈 파일 이름
pub const ERROR_BAD_REQUEST: &str = "BADREQUEST";

/// 제어 메시지 한 개의 최대 크기 (UDP 페이로드 한도)
pub const MAX_CONTROL_LEN: usize = crate::MAX_SEGMENT_SIZE + crate::SEGMENT_HEADER_LEN;

const REQUEST: &str = "GET";
const PARAMETERS: &str = "OK";
const ERROR_PREFIX: &str = "ERROR:";
const ROUND_END: &str = "END";
const RETRANSMIT: &str = "NACK";
const COMPLETION: &str = "COMPLETE";

/// 제어 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `GET <name>` (수신자 → 송신자)
    Request { name: String },

    /// `OK <file_size> <segment_size> <total_segments>` (송신자 → 수신자)
    Parameters(TransferDescriptor),

    /// `ERROR:<code>` (송신자 → 수신자)
    Error { code: String },

    /// `END` 라운드 종료 마커
    RoundEnd,

    /// `NACK <csv>` 재전송 요청
    RetransmitRequest { sequences: Vec<Sequence> },

    /// `COMPLETE` 수신 완료 확인
    Completion,
}

impl ControlMessage {
    pub fn request(name: impl Into<String>) -> Self {
        ControlMessage::Request { name: name.into() }
    }

    pub fn error(code: impl Into<String>) -> Self {
        ControlMessage::Error { code: code.into() }
    }

    /// 메시지 종류 이름 (로그용)
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Request { .. } => "Request",
            ControlMessage::Parameters(_) => "Parameters",
            ControlMessage::Error { .. } => "Error",
            ControlMessage::RoundEnd => "RoundEnd",
            ControlMessage::RetransmitRequest { .. } => "RetransmitRequest",
            ControlMessage::Completion => "Completion",
        }
    }

    /// 와이어 바이트로 직렬화
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_string())
    }

    /// 텍스트 프레임 파싱
    ///
    /// 알려진 형식이 아니면 `MalformedControlMessage`.
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(datagram)
            .map_err(|_| Error::malformed_control("not valid UTF-8"))?
            .trim();

        if let Some(code) = text.strip_prefix(ERROR_PREFIX) {
            let code = code.trim();
            if code.is_empty() {
                return Err(Error::malformed_control("ERROR without code"));
            }
            return Ok(ControlMessage::error(code));
        }

        let (keyword, rest) = match text.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (text, ""),
        };

        match keyword {
            ROUND_END if rest.is_empty() => Ok(ControlMessage::RoundEnd),
            COMPLETION if rest.is_empty() => Ok(ControlMessage::Completion),
            REQUEST => {
                if rest.is_empty() {
                    return Err(Error::malformed_control("GET without file name"));
                }
                Ok(ControlMessage::request(rest))
            }
            PARAMETERS => parse_parameters(rest).map(ControlMessage::Parameters),
            RETRANSMIT => parse_sequence_list(rest)
                .map(|sequences| ControlMessage::RetransmitRequest { sequences }),
            _ => Err(Error::malformed_control(format!(
                "unknown control message: {:?}",
                truncate_for_log(text)
            ))),
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Request { name } => write!(f, "{REQUEST} {name}"),
            ControlMessage::Parameters(d) => write!(
                f,
                "{PARAMETERS} {} {} {}",
                d.file_size, d.segment_size, d.total_segments
            ),
            ControlMessage::Error { code } => write!(f, "{ERROR_PREFIX}{code}"),
            ControlMessage::RoundEnd => f.write_str(ROUND_END),
            ControlMessage::RetransmitRequest { sequences } => {
                write!(f, "{RETRANSMIT} ")?;
                for (i, sequence) in sequences.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{sequence}")?;
                }
                Ok(())
            }
            ControlMessage::Completion => f.write_str(COMPLETION),
        }
    }
}

fn parse_parameters(rest: &str) -> Result<TransferDescriptor> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(Error::malformed_control(format!(
            "OK expects 3 fields, got {}",
            fields.len()
        )));
    }

    let number = |field: &str| -> Result<u64> {
        field
            .parse::<u64>()
            .map_err(|_| Error::malformed_control(format!("OK field not a number: {field:?}")))
    };
    let narrow = |value: u64, name: &str| -> Result<u32> {
        u32::try_from(value)
            .map_err(|_| Error::malformed_control(format!("{name} out of range: {value}")))
    };

    Ok(TransferDescriptor {
        file_size: number(fields[0])?,
        segment_size: narrow(number(fields[1])?, "segment_size")?,
        total_segments: narrow(number(fields[2])?, "total_segments")?,
    })
}

/// NACK 한 개에 담을 수 있는 앞부분 (오름차순 목록이면 가장 낮은 시퀀스부터)
///
/// 나머지는 다음 라운드에서 다시 요청된다.
pub fn retransmit_batch(sequences: &[Sequence]) -> &[Sequence] {
    let mut len = RETRANSMIT.len() + 1;
    for (i, sequence) in sequences.iter().enumerate() {
        let entry = decimal_len(*sequence) + usize::from(i > 0);
        if len + entry > MAX_CONTROL_LEN {
            return &sequences[..i];
        }
        len += entry;
    }
    sequences
}

fn decimal_len(value: u32) -> usize {
    value.checked_ilog10().map_or(1, |digits| digits as usize + 1)
}

/// 시퀀스 번호가 아닌 항목 (u32 범위 초과 포함)은 건너뛰고, 남는 항목이 없을 때만 실패
fn parse_sequence_list(rest: &str) -> Result<Vec<Sequence>> {
    let mut sequences = Vec::new();
    let mut skipped = 0usize;
    for entry in rest.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        match entry.parse::<Sequence>() {
            Ok(sequence) => sequences.push(sequence),
            Err(_) => skipped += 1,
        }
    }

    if sequences.is_empty() {
        return Err(Error::malformed_control(format!(
            "NACK without valid sequence numbers: {:?}",
            truncate_for_log(rest)
        )));
    }
    if skipped > 0 {
        debug!("NACK 항목 {}개 무시 (시퀀스 번호 아님)", skipped);
    }
    Ok(sequences)
}

fn truncate_for_log(text: &str) -> &str {
    match text.char_indices().nth(32) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// 수신한 데이터그램 분류 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    /// 세그먼트 코덱으로 넘길 바이너리 프레임
    Data(Bytes),
}

impl Inbound {
    /// 제어 키워드로 시작하면 제어 메시지로 파싱, 아니면 데이터 프레임
    ///
    /// 키워드로 시작하지만 파싱되지 않는 데이터그램은 온전한 세그먼트 프레임일 때만 데이터.
    pub fn classify(datagram: Bytes) -> Result<Self> {
        if !looks_like_control(&datagram) {
            return Ok(Inbound::Data(datagram));
        }
        match ControlMessage::parse(&datagram) {
            Ok(message) => Ok(Inbound::Control(message)),
            Err(_) if is_intact_frame(&datagram) => Ok(Inbound::Data(datagram)),
            Err(e) => Err(e),
        }
    }
}

fn is_intact_frame(datagram: &Bytes) -> bool {
    DecodedSegment::decode(datagram.clone()).is_ok_and(|segment| segment.is_intact())
}

fn looks_like_control(datagram: &[u8]) -> bool {
    const PREFIXES: [&[u8]; 6] = [
        b"GET ",
        b"OK ",
        b"ERROR:",
        b"END",
        b"NACK",
        b"COMPLETE",
    ];
    PREFIXES.iter().any(|prefix| datagram.starts_with(prefix))
}
