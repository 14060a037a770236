//! 전송 서비스
//!
//! 엔진 하나를 소유하는 단일 태스크와 그 핸들.
//! - 명령 채널로 송신/수신 시작, 인바운드 메시지, 취소를 받는다
//! - ticker 태스크가 주기적으로 Tick을 넣고 엔진은 실제 경과 시간만큼 논리 시계를 전진

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::TransferEngine;
use crate::message::{Contact, PeerChannel, PeerMessage};
use crate::progress::TaskProgress;
use crate::sink::Storage;
use crate::stats::TransferStats;
use crate::transfer::FileMeta;
use crate::{Config, Error, Result};

/// 송신 원본
#[derive(Debug, Clone)]
pub enum SendSource {
    /// 메모리 데이터
    Bytes(Bytes),

    /// 로컬 파일
    Path(PathBuf),
}

/// 내부 명령
enum EngineCmd {
    StartSend {
        meta: FileMeta,
        contact: Contact,
        source: SendSource,
        reply: oneshot::Sender<Result<()>>,
    },
    StartReceive {
        meta: FileMeta,
        contact: Contact,
        fragment_size: Option<usize>,
        reply: oneshot::Sender<Result<()>>,
    },
    Deliver(PeerMessage),
    DeliverRaw(Vec<u8>),
    Cancel {
        hash: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Tick,
    Stop,
}

/// 서비스 핸들 (외부에서 제어용)
#[derive(Clone)]
pub struct TransferService {
    cmd_tx: mpsc::Sender<EngineCmd>,
    stats: Arc<RwLock<TransferStats>>,
    running: Arc<AtomicBool>,
}

impl TransferService {
    /// 서비스 생성 및 시작
    pub fn start<S, C, P>(config: Config, storage: S, channel: C, progress: P) -> Self
    where
        S: Storage,
        C: PeerChannel,
        P: TaskProgress,
    {
        Self::spawn(config, storage, channel, progress, None)
    }

    /// 피어 채널 준비 신호를 받은 뒤 명령 처리 시작
    ///
    /// 신호 전에 들어온 명령은 채널에 쌓여 있다가 순서대로 처리된다.
    pub fn start_when_ready<S, C, P>(
        config: Config,
        storage: S,
        channel: C,
        progress: P,
        ready: oneshot::Receiver<()>,
    ) -> Self
    where
        S: Storage,
        C: PeerChannel,
        P: TaskProgress,
    {
        Self::spawn(config, storage, channel, progress, Some(ready))
    }

    fn spawn<S, C, P>(
        config: Config,
        storage: S,
        channel: C,
        progress: P,
        ready: Option<oneshot::Receiver<()>>,
    ) -> Self
    where
        S: Storage,
        C: PeerChannel,
        P: TaskProgress,
    {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<EngineCmd>(config.cmd_buffer_size.max(1));
        let stats = Arc::new(RwLock::new(TransferStats::new()));
        let running = Arc::new(AtomicBool::new(true));

        let granularity = Duration::from_millis(config.tick_granularity_ms.max(1));
        let mut engine = TransferEngine::new(config, storage, channel, progress);

        let cmd_tx_tick = cmd_tx.downgrade();
        let stats_main = stats.clone();
        let running_main = running.clone();

        tokio::spawn(async move {
            if let Some(ready) = ready {
                if ready.await.is_err() {
                    warn!("준비 신호 없이 채널 종료, 서비스 중단");
                    running_main.store(false, Ordering::SeqCst);
                    return;
                }
            }

            info!("CFT 전송 서비스 시작: tick={}ms", granularity.as_millis());
            spawn_ticker(cmd_tx_tick, running_main.clone(), granularity);

            let mut last_tick = Instant::now();

            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    EngineCmd::StartSend {
                        meta,
                        contact,
                        source,
                        reply,
                    } => {
                        let result = start_send(&mut engine, meta, contact, source).await;
                        let _ = reply.send(result);
                    }
                    EngineCmd::StartReceive {
                        meta,
                        contact,
                        fragment_size,
                        reply,
                    } => {
                        let result = engine.start_receive(meta, contact, fragment_size).await;
                        let _ = reply.send(result);
                    }
                    EngineCmd::Deliver(message) => {
                        if let Err(e) = engine.handle_message(message).await {
                            debug!("인바운드 메시지 거부: {}", e);
                        }
                    }
                    EngineCmd::DeliverRaw(bytes) => {
                        if let Err(e) = engine.handle_raw(&bytes).await {
                            debug!("인바운드 메시지 거부: {}", e);
                        }
                    }
                    EngineCmd::Cancel { hash, reply } => {
                        let _ = reply.send(engine.cancel(&hash));
                    }
                    EngineCmd::Tick => {
                        let now = Instant::now();
                        engine.advance(now.duration_since(last_tick)).await;
                        last_tick = now;
                    }
                    EngineCmd::Stop => {
                        break;
                    }
                }

                // 통계 업데이트
                *stats_main.write() = engine.stats().clone();
            }

            running_main.store(false, Ordering::SeqCst);
            info!(
                "CFT 전송 서비스 종료: active={}, {}",
                engine.active_transfers(),
                engine.stats().summary()
            );
        });

        Self {
            cmd_tx,
            stats,
            running,
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> EngineCmd,
    ) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| Error::ServiceStopped)?;
        reply_rx.await.map_err(|_| Error::ServiceStopped)?
    }

    /// 송신 시작, 검증 결과 반환
    pub async fn send_file(&self, meta: FileMeta, contact: Contact, source: SendSource) -> Result<()> {
        self.request(|reply| EngineCmd::StartSend {
            meta,
            contact,
            source,
            reply,
        })
        .await
    }

    /// 수신 시작, 검증 결과 반환
    pub async fn receive_file(
        &self,
        meta: FileMeta,
        contact: Contact,
        fragment_size: Option<usize>,
    ) -> Result<()> {
        self.request(|reply| EngineCmd::StartReceive {
            meta,
            contact,
            fragment_size,
            reply,
        })
        .await
    }

    /// 인바운드 메시지 전달
    pub async fn deliver(&self, message: PeerMessage) -> Result<()> {
        self.cmd_tx
            .send(EngineCmd::Deliver(message))
            .await
            .map_err(|_| Error::ServiceStopped)
    }

    /// 인바운드 원시 JSON 전달
    pub async fn deliver_raw(&self, bytes: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(EngineCmd::DeliverRaw(bytes))
            .await
            .map_err(|_| Error::ServiceStopped)
    }

    /// 로컬 취소
    pub async fn cancel(&self, hash: &str) -> Result<()> {
        let hash = hash.to_string();
        self.request(|reply| EngineCmd::Cancel { hash, reply }).await
    }

    /// 정지
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(EngineCmd::Stop).await;
    }

    /// 통계 반환
    pub fn stats(&self) -> TransferStats {
        self.stats.read().clone()
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn start_send<S, C, P>(
    engine: &mut TransferEngine<S, C, P>,
    meta: FileMeta,
    contact: Contact,
    source: SendSource,
) -> Result<()>
where
    S: Storage,
    C: PeerChannel,
    P: TaskProgress,
{
    match source {
        SendSource::Bytes(data) => engine.start_send(meta, contact, &data[..]).await,
        SendSource::Path(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| Error::storage(&path, e))?;
            engine.start_send(meta, contact, file).await
        }
    }
}

/// 핸들이 모두 drop되면 명령 채널이 닫히도록 약한 참조만 보관
fn spawn_ticker(cmd_tx: mpsc::WeakSender<EngineCmd>, running: Arc<AtomicBool>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while running.load(Ordering::SeqCst) {
            interval.tick().await;

            let Some(cmd_tx) = cmd_tx.upgrade() else {
                break;
            };
            if cmd_tx.send(EngineCmd::Tick).await.is_err() {
                break;
            }
        }
    });
}
