//! nackft 서버 (송신자)
//!
//! 디렉터리의 파일을 UDP로 제공. 요청(피어 주소)마다 독립 세션.
//!
//! 사용법:
//!   cargo run --release --bin nackft-server -- <PORT> <FOLDER> [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin nackft-server -- 9000 ./shared
//!   RUST_LOG=debug cargo run --release --bin nackft-server -- 9000 ./shared --segment-size 1200

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nackft::{Config, Server, DEFAULT_SEGMENT_SIZE};

#[derive(Parser, Debug)]
#[command(name = "nackft-server")]
#[command(about = "NACK 기반 UDP 파일 전송 서버", long_about = None)]
#[command(version)]
struct Args {
    /// UDP 포트
    port: u16,

    /// 제공할 파일 디렉터리
    folder: PathBuf,

    /// 바인드 IP
    #[arg(long, short = 'b', default_value = "0.0.0.0")]
    bind: IpAddr,

    /// 세그먼트 크기 (바이트)
    #[arg(long, default_value_t = DEFAULT_SEGMENT_SIZE)]
    segment_size: usize,

    /// 피드백(NACK/COMPLETE) 대기 시간 (밀리초)
    #[arg(long, default_value_t = 5000)]
    feedback_timeout_ms: u64,

    /// 불안정한 네트워크용 프리셋 사용
    #[arg(long)]
    unstable: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let base = if args.unstable {
        Config::unstable_network()
    } else {
        Config::default()
    };
    let config = Config {
        segment_size: args.segment_size,
        feedback_timeout_ms: args.feedback_timeout_ms,
        ..base
    };

    info!("nackft server starting...");
    info!("Segment size: {} bytes", config.segment_size);
    info!("Feedback timeout: {} ms", config.feedback_timeout_ms);

    let server = Server::bind(SocketAddr::new(args.bind, args.port), &args.folder, config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Server shutting down (Ctrl+C)");
            let stats = server.stats();
            info!(
                "Sessions: {} started, {} confirmed, {} assumed complete, {} rejected, {} failed",
                stats.sessions_started,
                stats.confirmed,
                stats.assumed_complete,
                stats.rejected,
                stats.failed
            );
        }
    }

    Ok(())
}
