//! 파일 → 세그먼트 분할
//!
//! - 순차 분할: `Segmenter::segments()` (지연 평가, 재시작 가능)
//! - 재전송용 임의 접근: `Segmenter::payload_at()` (오프셋 읽기)
//! - 비동기 세션용: `Segmenter::read_payloads()` (블로킹 풀에서 실행)

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::segment::Sequence;
use crate::{Error, Result};

/// 전송 파라미터 (전송당 한 번 협상, 이후 불변)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    /// 원본 파일 크기 (바이트)
    pub file_size: u64,

    /// 마지막을 제외한 모든 세그먼트의 페이로드 크기
    pub segment_size: u32,

    /// ceil(file_size / segment_size)
    pub total_segments: u32,
}

impl TransferDescriptor {
    /// 파일 크기와 세그먼트 크기로 계산
    pub fn for_file(file_size: u64, segment_size: usize) -> Result<Self> {
        if segment_size == 0 || segment_size > u32::MAX as usize {
            return Err(Error::InvalidConfig {
                reason: format!("segment_size out of range: {segment_size}"),
            });
        }
        let total = file_size.div_ceil(segment_size as u64);
        let total_segments =
            u32::try_from(total).map_err(|_| Error::TransferTooLarge { file_size })?;

        Ok(Self {
            file_size,
            segment_size: segment_size as u32,
            total_segments,
        })
    }

    /// 피어가 보낸 파라미터의 내부 일관성 검사
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            return Err(Error::malformed_control("segment_size is zero"));
        }
        let expected = self.file_size.div_ceil(self.segment_size as u64);
        if expected != self.total_segments as u64 {
            return Err(Error::malformed_control(format!(
                "total_segments {} does not match ceil({} / {}) = {}",
                self.total_segments, self.file_size, self.segment_size, expected
            )));
        }
        Ok(())
    }

    /// 시퀀스의 파일 내 오프셋
    pub fn offset_of(&self, sequence: Sequence) -> u64 {
        sequence as u64 * self.segment_size as u64
    }

    /// 범위 내 시퀀스인지
    pub fn contains(&self, sequence: Sequence) -> bool {
        sequence < self.total_segments
    }

    /// 시퀀스의 기대 페이로드 길이 (범위 밖이면 None)
    pub fn payload_len(&self, sequence: Sequence) -> Option<usize> {
        if !self.contains(sequence) {
            return None;
        }
        let remaining = self.file_size - self.offset_of(sequence);
        Some(remaining.min(self.segment_size as u64) as usize)
    }
}

/// 송신측 파일 분할기
///
/// 복제본은 같은 파일 핸들(커서 포함)을 공유하므로 한 세션 안에서 순서대로만 읽는다.
#[derive(Debug, Clone)]
pub struct Segmenter {
    path: PathBuf,
    file: Arc<File>,
    descriptor: TransferDescriptor,
}

/// 블로킹 파일 I/O를 tokio 블로킹 풀에서 실행
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

impl Segmenter {
    /// 파일을 열고 전송 파라미터 계산
    pub fn open(path: impl AsRef<Path>, segment_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        let descriptor = TransferDescriptor::for_file(file_size, segment_size)?;

        Ok(Self {
            path,
            file: Arc::new(file),
            descriptor,
        })
    }

    pub fn descriptor(&self) -> TransferDescriptor {
        self.descriptor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 처음부터 순차 분할하는 새 이터레이터 (호출마다 독립 핸들)
    pub fn segments(&self) -> Result<Segments> {
        let file = File::open(&self.path)?;
        Ok(Segments {
            reader: BufReader::new(file),
            segment_size: self.descriptor.segment_size as u64,
            next: 0,
            finished: false,
        })
    }

    /// 오프셋 읽기로 단일 세그먼트 페이로드 조회 (범위 밖이면 None)
    pub fn payload_at(&self, sequence: Sequence) -> Result<Option<Bytes>> {
        if !self.descriptor.contains(sequence) {
            return Ok(None);
        }

        let mut file = &*self.file;
        file.seek(SeekFrom::Start(self.descriptor.offset_of(sequence)))?;

        let mut buf = Vec::with_capacity(self.descriptor.segment_size as usize);
        file.take(self.descriptor.segment_size as u64)
            .read_to_end(&mut buf)?;

        Ok(Some(Bytes::from(buf)))
    }

    /// 여러 시퀀스의 페이로드를 블로킹 풀에서 읽음 (범위 밖 시퀀스는 건너뜀)
    pub async fn read_payloads(&self, sequences: Vec<Sequence>) -> Result<Vec<(Sequence, Bytes)>> {
        let segmenter = self.clone();
        run_blocking(move || {
            let mut payloads = Vec::with_capacity(sequences.len());
            for sequence in sequences {
                if let Some(payload) = segmenter.payload_at(sequence)? {
                    payloads.push((sequence, payload));
                }
            }
            Ok(payloads)
        })
        .await
    }
}

/// 순차 세그먼트 이터레이터
pub struct Segments {
    reader: BufReader<File>,
    segment_size: u64,
    next: Sequence,
    finished: bool,
}

impl Iterator for Segments {
    type Item = Result<(Sequence, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut buf = Vec::with_capacity(self.segment_size as usize);
        match self
            .reader
            .by_ref()
            .take(self.segment_size)
            .read_to_end(&mut buf)
        {
            Ok(0) => {
                self.finished = true;
                None
            }
            Ok(n) => {
                // 짧은 창은 마지막 세그먼트
                if (n as u64) < self.segment_size {
                    self.finished = true;
                }
                let sequence = self.next;
                self.next += 1;
                Some(Ok((sequence, Bytes::from(buf))))
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e.into()))
            }
        }
    }
}
