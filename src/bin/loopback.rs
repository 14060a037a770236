//! CFT 루프백 데모
//!
//! 프로세스 안에서 송신 서비스와 수신 서비스를 채널로 연결해 파일 하나를 전송한다.
//! 윈도우 단위로 전달 순서를 섞어 재정렬 동작을 확인할 수 있다.
//!
//! 사용법:
//!   cargo run --release --bin cft-loopback -- --file <PATH> [OPTIONS]
//!
//! 예시:
//!   # 메모리 수신
//!   cargo run --release --bin cft-loopback -- --file photo.jpg
//!
//!   # 디스크 수신 + 8개 단위로 순서 섞기
//!   cargo run --release --bin cft-loopback -- -f photo.jpg -o ./incoming --shuffle 8

use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cft::{
    Config, Contact, FileMeta, FsStorage, PeerMessage, ProgressEvent, SendSource, TransferService,
};

/// 유휴 상태에서 섞기 버퍼를 비우는 시간
const FLUSH_IDLE: Duration = Duration::from_millis(500);

/// 데모 설정
#[derive(Default)]
struct LoopbackConfig {
    file: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    shuffle_window: usize,
    fragment_size: Option<usize>,
    adaptive: bool,
}

fn parse_args() -> Result<LoopbackConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = LoopbackConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--out" | "-o" => {
                if i + 1 < args.len() {
                    config.output_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--shuffle" | "-s" => {
                if i + 1 < args.len() {
                    config.shuffle_window = args[i + 1]
                        .parse()
                        .map_err(|_| format!("유효한 숫자 필요: {}", args[i + 1]))?;
                    i += 1;
                }
            }
            "--fragment-size" => {
                if i + 1 < args.len() {
                    config.fragment_size = Some(
                        args[i + 1]
                            .parse()
                            .map_err(|_| format!("유효한 숫자 필요: {}", args[i + 1]))?,
                    );
                    i += 1;
                }
            }
            "--adaptive" | "-a" => {
                config.adaptive = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"CFT Loopback - 청크 파일 전송 루프백 데모

송신 서비스와 수신 서비스를 프로세스 안에서 연결해 파일을 전송하고
수신 결과를 원본 SHA-256과 비교한다.

사용법:
  cargo run --release --bin cft-loopback -- --file <PATH> [OPTIONS]

옵션:
  -f, --file <PATH>         전송할 파일 (필수)
  -o, --out <DIR>           수신 파일 저장 디렉터리 (없으면 메모리 수신)
  -s, --shuffle <N>         N개 단위로 전달 순서 섞기 (기본: 0 = 섞지 않음)
  --fragment-size <BYTES>   청크 크기 (기본: 8192)
  -a, --adaptive            파일 크기별 pacing 사용
  -h, --help                이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => {
                warn!("알 수 없는 옵션 무시: {}", other);
            }
        }
        i += 1;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;
    let path = args.file.ok_or("--file 옵션 필요 (--help 참고)")?;

    let data = tokio::fs::read(&path).await?;
    let hash = hex::encode(Sha256::digest(&data));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or("파일 이름을 읽을 수 없음")?
        .to_string();
    let meta = FileMeta::new(name, data.len() as u64, hash.clone());

    let mut send_config = if args.adaptive {
        Config::size_adaptive()
    } else {
        Config::default()
    };
    if let Some(fragment_size) = args.fragment_size {
        send_config.fragment_size = fragment_size;
    }
    let plan = send_config.send_plan(meta.size);

    let receive_config = match &args.output_dir {
        Some(dir) => Config::persisted(dir),
        None => Config::default(),
    };

    info!("CFT Loopback starting...");
    info!("  File: {} ({} bytes)", path.display(), meta.size);
    info!("  SHA-256: {}", hash);
    info!(
        "  Fragment: {} bytes, interval {}ms",
        plan.fragment_size,
        plan.interval.as_millis()
    );
    info!("  Shuffle window: {}", args.shuffle_window);

    // 송신측 → 수신측, 수신측 → 송신측
    let (to_receiver_tx, mut to_receiver_rx) = mpsc::unbounded_channel::<(Contact, PeerMessage)>();
    let (to_sender_tx, mut to_sender_rx) = mpsc::unbounded_channel::<(Contact, PeerMessage)>();
    let (send_events_tx, mut send_events) = mpsc::unbounded_channel::<ProgressEvent>();
    let (recv_events_tx, mut recv_events) = mpsc::unbounded_channel::<ProgressEvent>();

    let sender = TransferService::start(send_config, FsStorage::new(), to_receiver_tx, send_events_tx);
    let receiver =
        TransferService::start(receive_config, FsStorage::new(), to_sender_tx, recv_events_tx);

    // 수신 → 송신 (취소 메시지)
    let sender_bridge = sender.clone();
    tokio::spawn(async move {
        while let Some((_, message)) = to_sender_rx.recv().await {
            if sender_bridge.deliver(message).await.is_err() {
                break;
            }
        }
    });

    // 송신 → 수신 (윈도우 단위 섞기)
    let receiver_bridge = receiver.clone();
    let window = args.shuffle_window;
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut buffer: Vec<Vec<u8>> = Vec::new();

        loop {
            let next = tokio::time::timeout(FLUSH_IDLE, to_receiver_rx.recv()).await;
            let idle = next.is_err();
            let closed = matches!(next, Ok(None));

            if let Ok(Some((_, message))) = next {
                match message.to_bytes() {
                    Ok(raw) => buffer.push(raw),
                    Err(e) => warn!("메시지 직렬화 실패: {}", e),
                }
            }

            if buffer.len() >= window.max(1) || idle || closed {
                buffer.shuffle(&mut rng);
                for raw in buffer.drain(..) {
                    if receiver_bridge.deliver_raw(raw).await.is_err() {
                        return;
                    }
                }
            }

            if closed {
                break;
            }
        }
    });

    receiver
        .receive_file(meta.clone(), Contact::new("sender"), Some(plan.fragment_size))
        .await?;
    let started = Instant::now();
    sender
        .send_file(meta.clone(), Contact::new("receiver"), SendSource::Path(path.clone()))
        .await?;

    let mut last_report = 0u64;
    let outcome = loop {
        match recv_events.recv().await {
            Some(ProgressEvent::Progress { processed, .. }) => {
                // 10% 단위 진행 보고
                let percent = processed * 100 / meta.size.max(1);
                if percent >= last_report + 10 || processed == meta.size {
                    info!("Progress: {}% ({}/{} bytes)", percent, processed, meta.size);
                    last_report = percent;
                }
            }
            Some(ProgressEvent::Complete(completion)) => break Ok(completion),
            Some(ProgressEvent::Error { error, .. }) => break Err(error),
            Some(ProgressEvent::PeerCancel { hash }) => {
                warn!("송신측 취소: {}", hash);
            }
            None => return Err("수신 이벤트 채널 닫힘".into()),
        }
    };

    let elapsed = started.elapsed();
    let completion = outcome?;

    // 수신 결과 검증
    let verified = match (&completion.path, completion.concat_blocks()) {
        (Some(path), _) => {
            info!("  Saved: {}", path.display());
            completion.digest.as_deref() == Some(hash.as_str())
        }
        (None, Some(received)) => hex::encode(Sha256::digest(&received)) == hash,
        (None, None) => false,
    };

    // 송신측 완료 대기
    while let Some(event) = send_events.recv().await {
        if matches!(event, ProgressEvent::Complete(_) | ProgressEvent::Error { .. }) {
            break;
        }
    }

    info!("═══════════════════════════════════════════════════════════════");
    info!("Transfer complete: {} bytes in {:.2}s", meta.size, elapsed.as_secs_f64());
    info!(
        "Throughput: {:.2} KB/s",
        meta.size as f64 / 1024.0 / elapsed.as_secs_f64().max(0.001)
    );
    info!("Digest: {}", if verified { "OK" } else { "MISMATCH" });
    info!("Sender:   {}", sender.stats().summary());
    info!("Receiver: {}", receiver.stats().summary());
    info!("═══════════════════════════════════════════════════════════════");

    sender.stop().await;
    receiver.stop().await;

    if !verified {
        return Err("수신 데이터 검증 실패".into());
    }
    Ok(())
}
