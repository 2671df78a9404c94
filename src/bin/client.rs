//! nackft 클라이언트 (수신자)
//!
//! 파일 하나를 요청해 모든 세그먼트를 검증한 뒤에만 저장.
//!
//! 사용법:
//!   cargo run --release --bin nackft-client -- @HOST:PORT/filename [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin nackft-client -- @127.0.0.1:9000/report.pdf
//!
//!   # 첫 라운드에서 3, 7, 9번 세그먼트를 버려 재전송 경로 확인
//!   cargo run --release --bin nackft-client -- @127.0.0.1:9000/report.pdf -d 3,7,9

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nackft::{Config, FaultInjection, Receiver, Sequence};

#[derive(Parser, Debug)]
#[command(name = "nackft-client")]
#[command(about = "NACK 기반 UDP 파일 전송 클라이언트", long_about = None)]
#[command(version)]
struct Args {
    /// 대상: @HOST:PORT/filename
    #[arg(value_parser = parse_target)]
    target: Target,

    /// 첫 라운드에서 버릴 시퀀스 목록 (예: 3,7,9)
    #[arg(long, short = 'd', value_delimiter = ',')]
    drop: Vec<Sequence>,

    /// 첫 라운드 무작위 손실 비율 (0.0 ~ 1.0)
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// 저장 경로 (기본: received_<filename>)
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,

    /// 최대 라운드 수
    #[arg(long, default_value_t = 64)]
    max_rounds: u32,

    /// 불안정한 네트워크용 프리셋 사용
    #[arg(long)]
    unstable: bool,
}

#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
    filename: String,
}

fn parse_target(raw: &str) -> Result<Target, String> {
    let body = raw
        .strip_prefix('@')
        .ok_or_else(|| "target must start with '@'".to_string())?;
    let (hostport, filename) = body
        .split_once('/')
        .ok_or_else(|| "target must contain '/' between host:port and file".to_string())?;
    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid host:port: {hostport:?}"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port: {port:?}"))?;
    if filename.is_empty() {
        return Err("file name is empty".into());
    }

    Ok(Target {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
        filename: filename.to_string(),
    })
}

fn default_output(filename: &str) -> PathBuf {
    PathBuf::from(format!("received_{}", filename.replace('/', "_")))
}

async fn resolve(target: &Target) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let mut addrs = tokio::net::lookup_host((target.host.as_str(), target.port)).await?;
    addrs
        .next()
        .ok_or_else(|| format!("cannot resolve {}", target.host).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let server_addr = resolve(&args.target).await?;

    let base = if args.unstable {
        Config::unstable_network()
    } else {
        Config::default()
    };
    let config = Config {
        max_rounds: args.max_rounds,
        ..base
    };

    let faults = FaultInjection::drop_sequences(args.drop)
        .with_loss_ratio(args.loss);
    if faults.is_active() {
        info!("Fault injection enabled for the first round");
    }

    info!("nackft client starting...");
    info!("Server address: {}", server_addr);
    info!("Requesting: {}", args.target.filename);

    let mut receiver = Receiver::connect(server_addr, config).await?.with_faults(faults);

    let received = match receiver.fetch(&args.target.filename).await {
        Ok(received) => received,
        Err(e) => {
            error!("Transfer failed: {}", e);
            return Err(e.into());
        }
    };

    let out = args
        .out
        .unwrap_or_else(|| default_output(&args.target.filename));
    let written = received.write_to(&out)?;

    info!(
        "File saved to {:?} ({} bytes, {} expected)",
        out,
        written,
        received.descriptor().file_size
    );
    info!("{}", receiver.stats().summary());

    Ok(())
}
