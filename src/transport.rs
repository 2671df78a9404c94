//! 데이터그램 전송 능력
//!
//! 프로토콜 코어는 "피어에게 데이터그램 송신" / "타임아웃 내 데이터그램 수신"만 사용한다.
//! - `PeerLink`: 클라이언트측, 자기 소켓 + 고정 서버 주소
//! - `SessionLink`: 서버측, 공유 소켓 + 세션 전용 수신 큐

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Error, Result};

/// 한 피어와의 데이터그램 링크
pub trait Link: Send {
    /// 상대 주소
    fn peer(&self) -> SocketAddr;

    /// 데이터그램 송신 (전달 보장 없음)
    fn send(&self, datagram: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// 다음 데이터그램 수신, `timeout` 동안 없으면 `Ok(None)`
    fn recv(&mut self, timeout: Duration) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// 클라이언트측 링크
pub struct PeerLink {
    socket: UdpSocket,
    peer: SocketAddr,
    buf: Vec<u8>,
}

impl PeerLink {
    /// 로컬 주소에 바인딩
    pub async fn bind(local: SocketAddr, peer: SocketAddr, buffer_size: usize) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::from_socket(socket, peer, buffer_size))
    }

    pub fn from_socket(socket: UdpSocket, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            socket,
            peer,
            buf: vec![0u8; buffer_size],
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Link for PeerLink {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn send(&self, datagram: &[u8]) -> Result<()> {
        self.socket.send_to(datagram, self.peer).await?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => {
                    // ICMP unreachable 등은 데이터그램 손실과 동일하게 취급
                    warn!("수신 에러: {}", e);
                }
                Ok(Ok((len, from))) => {
                    if from != self.peer {
                        debug!("다른 주소의 데이터그램 무시: {}", from);
                        continue;
                    }
                    return Ok(Some(Bytes::copy_from_slice(&self.buf[..len])));
                }
            }
        }
    }
}

/// 서버측 세션 링크
///
/// 송신은 서버 공유 소켓으로, 수신은 디스패처가 채워주는 세션 전용 큐에서.
pub struct SessionLink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbox: mpsc::Receiver<Bytes>,
}

impl SessionLink {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, inbox: mpsc::Receiver<Bytes>) -> Self {
        Self {
            socket,
            peer,
            inbox,
        }
    }
}

impl Link for SessionLink {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn send(&self, datagram: &[u8]) -> Result<()> {
        self.socket.send_to(datagram, self.peer).await?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(datagram)) => Ok(Some(datagram)),
            Ok(None) => Err(Error::ConnectionClosed),
        }
    }
}
