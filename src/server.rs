//! 서버 (송신자) 수신 루프
//!
//! 하나의 UDP 소켓을 공유하고, 피어 주소별로 독립 세션 태스크에 데이터그램을 분배한다.
//! 세션 간 공유 상태는 읽기 전용 파일 시스템뿐.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::ControlMessage;
use crate::sender::{SenderSession, SessionOutcome};
use crate::stats::ServerStats;
use crate::transport::SessionLink;
use crate::{Config, Error, Result};

/// 파일 서버
pub struct Server {
    config: Config,
    root: PathBuf,
    socket: Arc<UdpSocket>,
    sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl Server {
    /// 소켓 바인딩 및 서비스 루트 확인
    pub async fn bind(bind_addr: SocketAddr, root: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;

        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::InvalidConfig {
                reason: format!("served root is not a directory: {}", root.display()),
            });
        }

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("Server listening on {}, serving {:?}", socket.local_addr()?, root);

        Ok(Self {
            config,
            root,
            socket,
            sessions: Arc::new(DashMap::new()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 진행 중인 세션 수
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// 세션 결과 집계 스냅샷
    pub fn stats(&self) -> ServerStats {
        self.stats.read().clone()
    }

    /// 수신 및 분배 루프 (프로세스 종료까지)
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; self.config.recv_buffer_size];

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("수신 에러: {}", e);
                    continue;
                }
            };
            self.dispatch(Bytes::copy_from_slice(&buf[..len]), from);
        }
    }

    /// 기존 세션이면 세션 큐로, 아니면 GET만 새 세션으로
    fn dispatch(&self, datagram: Bytes, from: SocketAddr) {
        let inbox = self.sessions.get(&from).map(|entry| entry.value().clone());
        if let Some(inbox) = inbox {
            match inbox.try_send(datagram) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("[{}] 세션 큐 가득 참, 데이터그램 버림", from);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("[{}] 종료 중인 세션으로 온 데이터그램 버림", from);
                }
            }
            return;
        }

        match ControlMessage::parse(&datagram) {
            Ok(ControlMessage::Request { name }) => {
                info!("Request from {}: GET {}", from, name);
                self.spawn_session(from, name);
            }
            Ok(other) => debug!("[{}] 세션 없는 피어의 {} 무시", from, other.kind()),
            Err(e) => debug!("[{}] 알 수 없는 데이터그램 무시: {}", from, e),
        }
    }

    fn spawn_session(&self, peer: SocketAddr, name: String) {
        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.session_queue_depth);
        self.sessions.insert(peer, inbox_tx);
        self.stats.write().sessions_started += 1;

        let link = SessionLink::new(self.socket.clone(), peer, inbox_rx);
        let mut session = SenderSession::new(link, self.root.clone(), self.config.clone());
        let sessions = self.sessions.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let result = session.run(&name).await;
            sessions.remove(&peer);

            let mut stats = stats.write();
            stats.retransmitted_segments += session.stats().retransmitted_segments;
            match result {
                Ok(SessionOutcome::Confirmed) => stats.confirmed += 1,
                Ok(SessionOutcome::AssumedComplete) => stats.assumed_complete += 1,
                Ok(SessionOutcome::Rejected { .. }) => stats.rejected += 1,
                Err(e) => {
                    warn!("[{}] 세션 실패: {}", peer, e);
                    stats.failed += 1;
                }
            }
        });
    }
}
