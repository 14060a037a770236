//! 전송 엔진
//!
//! - 레지스트리와 tick 스케줄러 소유
//! - 수신 drain tick: cursor 청크 소비 또는 miss 누적
//! - 송신 tick: FIFO 큐 앞 청크를 피어 채널로 전송
//! - 모든 상태 변경은 이 구조체의 `&mut self` 메서드에서 직렬로 일어난다

use std::time::Duration;

use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

use crate::fragment::SourceChunker;
use crate::message::{Contact, FileChunkMessage, PeerChannel, PeerMessage};
use crate::progress::TaskProgress;
use crate::registry::TransferRegistry;
use crate::reorder::EnqueueResult;
use crate::scheduler::{TickId, TickScheduler};
use crate::sink::{OutputSink, Storage};
use crate::stats::TransferStats;
use crate::transfer::{Direction, FileMeta, TransferState};
use crate::verifier::CompletionVerifier;
use crate::{Config, Error, Result};

/// miss 로그 간격 (tick 수)
const MISS_LOG_EVERY: u32 = 50;

pub struct TransferEngine<S, C, P> {
    config: Config,
    registry: TransferRegistry,
    scheduler: TickScheduler,
    storage: S,
    channel: C,
    progress: P,
    stats: TransferStats,
}

impl<S, C, P> TransferEngine<S, C, P>
where
    S: Storage,
    C: PeerChannel,
    P: TaskProgress,
{
    pub fn new(config: Config, storage: S, channel: C, progress: P) -> Self {
        Self {
            config,
            registry: TransferRegistry::new(),
            scheduler: TickScheduler::new(),
            storage,
            channel,
            progress,
            stats: TransferStats::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 논리 시각
    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    pub fn lookup(&self, hash: &str) -> Result<&TransferState> {
        self.registry.lookup(hash)
    }

    pub fn active_transfers(&self) -> usize {
        self.registry.len()
    }

    /// 생성 전 공통 검증
    fn check_new(&self, meta: &FileMeta) -> Result<()> {
        meta.validate()?;
        if meta.size > self.config.max_transfer_size {
            return Err(Error::TooLarge {
                size: meta.size,
                max: self.config.max_transfer_size,
            });
        }
        if self.registry.contains(&meta.hash) {
            return Err(Error::DuplicateTransfer {
                hash: meta.hash.clone(),
            });
        }
        Ok(())
    }

    fn register(&mut self, state: TransferState, interval: Duration) -> Result<()> {
        let hash = state.hash().to_string();
        self.registry.register(state)?;

        let state = self.registry.lookup_mut(&hash)?;
        state.attach_tick(self.scheduler.schedule(&hash, interval));
        Ok(())
    }

    /// 송신 시작
    ///
    /// 원본을 끝까지 읽어 청크 큐를 만든 뒤 등록한다.
    /// 검증 실패 시 아무것도 등록하지 않고 에러를 반환한다.
    pub async fn start_send<R>(&mut self, meta: FileMeta, contact: Contact, source: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        self.check_new(&meta)?;

        let plan = self.config.send_plan(meta.size);
        if plan.fragment_size == 0 {
            return Err(Error::Validation("청크 크기는 0일 수 없음".into()));
        }

        let chunker = SourceChunker::new(plan.fragment_size);
        let (queue, total) = chunker.read_from(source, meta.size).await?;
        if total != meta.size {
            return Err(Error::Validation(format!(
                "원본 크기 불일치: declared={}, read={}",
                meta.size, total
            )));
        }

        info!(
            "송신 시작: hash={}, name={}, size={}, fragments={}, interval={}ms, to={}",
            meta.hash,
            meta.name,
            meta.size,
            queue.len(),
            plan.interval.as_millis(),
            contact
        );

        let state = TransferState::new_send(meta, contact, plan.fragment_size, queue);
        self.register(state, plan.interval)?;
        self.stats.started_sends += 1;
        Ok(())
    }

    /// 수신 시작
    ///
    /// `fragment_size`는 송신측과 같아야 한다. None이면 설정값 사용.
    pub async fn start_receive(
        &mut self,
        meta: FileMeta,
        contact: Contact,
        fragment_size: Option<usize>,
    ) -> Result<()> {
        self.check_new(&meta)?;

        let fragment_size = fragment_size.unwrap_or(self.config.fragment_size);
        if fragment_size == 0 {
            return Err(Error::Validation("청크 크기는 0일 수 없음".into()));
        }

        let sink = match &self.config.data_path {
            Some(dir) => {
                if !meta.is_plain_name() {
                    return Err(Error::Validation(format!(
                        "파일 이름에 경로 포함: {}",
                        meta.name
                    )));
                }
                let path = dir.join(&meta.name);
                if self.registry.output_in_use(&path) {
                    return Err(Error::Validation(format!(
                        "다른 수신이 사용 중인 파일: {}",
                        path.display()
                    )));
                }
                OutputSink::persisted(path)
            }
            None => OutputSink::memory(),
        };
        sink.open(&self.storage).await?;

        let state = TransferState::new_receive(meta, contact, fragment_size, sink);
        info!(
            "수신 시작: hash={}, name={}, size={}, max_position={}, from={}",
            state.hash(),
            state.meta().name,
            state.meta().size,
            state.max_position(),
            state.contact()
        );

        let interval = self.config.receive_interval();
        self.register(state, interval)?;
        self.stats.started_receives += 1;
        Ok(())
    }

    /// 원시 JSON 메시지 처리
    pub async fn handle_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let message = PeerMessage::from_bytes(bytes).map_err(|e| {
            warn!("피어 메시지 파싱 실패: {}", e);
            e
        })?;
        self.handle_message(message).await
    }

    /// 명령 종류별 분배
    pub async fn handle_message(&mut self, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::FileChunk(chunk) => self.on_fragment(chunk).await,
            PeerMessage::FileCancel(cancel) => {
                self.on_peer_cancel(&cancel.hash);
                Ok(())
            }
        }
    }

    /// 인바운드 청크 처리
    ///
    /// 등록되지 않은 hash는 에러 보고 후 버린다 (전송을 만들지 않음).
    /// 디코딩 실패, 선언 길이 불일치, 위치에 맞지 않는 오프셋이나 길이는
    /// 해당 전송을 즉시 실패시킨다.
    pub async fn on_fragment(&mut self, message: FileChunkMessage) -> Result<()> {
        let hash = message.hash.clone();

        let state = match self.registry.lookup_mut(&hash) {
            Ok(state) => state,
            Err(e) => {
                self.stats.unknown_fragments += 1;
                error!("전송을 찾을 수 없음: hash={}, pos={}", hash, message.pos);
                self.progress.on_error(&hash, e);
                return Err(Error::UnknownTransfer { hash });
            }
        };

        if state.direction() != Direction::Receive {
            warn!("송신 중인 전송으로 청크 도착: hash={}", hash);
            return Ok(());
        }

        if state.is_cancelled() {
            debug!("취소된 전송의 청크 무시: hash={}, pos={}", hash, message.pos);
            return Ok(());
        }

        let fragment = match message.to_fragment() {
            Ok(fragment) => fragment,
            Err(e) => {
                self.fail(&hash, e).await;
                return Ok(());
            }
        };

        let position = fragment.position;
        if position <= state.max_position() {
            let (offset, length) = state.expected_geometry(position);
            let mismatch = if fragment.offset != offset {
                Some(Error::OffsetMismatch {
                    position,
                    expected: offset,
                    received: fragment.offset,
                })
            } else if fragment.length != length {
                Some(Error::LengthMismatch {
                    position,
                    declared: length,
                    received: fragment.length,
                })
            } else {
                None
            };

            if let Some(e) = mismatch {
                self.fail(&hash, e).await;
                return Ok(());
            }
        }

        match state.enqueue(fragment) {
            Some(EnqueueResult::Buffered) | None => {}
            Some(EnqueueResult::Replaced) => {
                self.stats.duplicate_fragments += 1;
                debug!("중복 청크 덮어씀: hash={}, pos={}", hash, position);
            }
            Some(EnqueueResult::Stale) => {
                self.stats.stale_fragments += 1;
                debug!(
                    "이미 소비된 청크 무시: hash={}, pos={}, cursor={}",
                    hash,
                    position,
                    state.cursor()
                );
            }
            Some(EnqueueResult::OutOfRange) => {
                let max_position = state.max_position();
                warn!(
                    "범위 밖 청크 무시: hash={}, pos={}, max_position={}",
                    hash, position, max_position
                );
                return Err(Error::PositionOutOfRange {
                    position,
                    max_position,
                });
            }
        }

        Ok(())
    }

    /// 로컬 취소
    ///
    /// 다음 tick에서 정리된다. 상대에게 취소 메시지를 보낸다.
    pub fn cancel(&mut self, hash: &str) -> Result<()> {
        let state = self.registry.lookup_mut(hash)?;
        if state.is_cancelled() {
            return Ok(());
        }

        state.cancel(None);
        info!("전송 취소 요청: hash={}", hash);

        if let Err(e) = self
            .channel
            .send_message(state.contact(), &PeerMessage::cancel(hash))
        {
            warn!("취소 메시지 전송 실패: hash={}, {}", hash, e);
        }
        Ok(())
    }

    /// 피어가 보낸 취소
    ///
    /// 유예 시간 동안은 상태를 유지하며 도착하는 청크를 조용히 버린다.
    pub fn on_peer_cancel(&mut self, hash: &str) {
        self.progress.on_peer_cancel(hash);

        let teardown_at = self.scheduler.now() + self.config.peer_cancel_grace();
        match self.registry.lookup_mut(hash) {
            Ok(state) => {
                state.cancel(Some(teardown_at));
                info!(
                    "피어가 전송 취소: hash={}, {}ms 후 정리",
                    hash, self.config.peer_cancel_grace_ms
                );
            }
            Err(_) => debug!("취소할 전송 없음: hash={}", hash),
        }
    }

    /// 논리 시계를 전진시키고 도래한 tick 실행
    pub async fn advance(&mut self, elapsed: Duration) {
        let until = self.scheduler.now() + elapsed;

        while let Some((id, hash)) = self.scheduler.pop_due(until) {
            self.tick(id, &hash).await;
        }

        self.scheduler.settle(until);
    }

    async fn tick(&mut self, id: TickId, hash: &str) {
        let direction = match self.registry.lookup(hash) {
            Ok(state) if state.tick_id() == Some(id) => state.direction(),
            _ => {
                error!("해제된 전송의 tick 발화: hash={}", hash);
                return;
            }
        };

        match direction {
            Direction::Receive => self.tick_receive(hash).await,
            Direction::Send => self.tick_send(hash).await,
        }
    }

    /// 수신 drain tick
    async fn tick_receive(&mut self, hash: &str) {
        let now = self.scheduler.now();
        let Ok(state) = self.registry.lookup_mut(hash) else {
            return;
        };

        if state.is_cancelled() {
            if !state.teardown_pending(now) {
                self.finish_cancelled(hash).await;
            }
            return;
        }

        if state.is_terminal() {
            self.complete_receive(hash).await;
            return;
        }

        let Some(fragment) = state.consume_next() else {
            let misses = state.record_miss();
            let position = state.cursor();

            if misses >= self.config.max_miss_ticks {
                self.fail(hash, Error::StalledPosition { position }).await;
            } else if misses % MISS_LOG_EVERY == 0 {
                debug!(
                    "청크 대기 중: hash={}, pos={}, misses={}, pending={}",
                    hash,
                    position,
                    misses,
                    state.pending_len()
                );
            }
            return;
        };

        let position = fragment.position;
        let length = fragment.length;
        let written = match state.sink_mut() {
            Some(sink) => sink.append(&self.storage, fragment.data).await,
            None => Ok(()),
        };

        if let Err(e) = written {
            self.fail(hash, e).await;
            return;
        }

        let processed = state.record_consumed(length);
        self.stats.fragments_consumed += 1;
        self.stats.bytes_written += length as u64;

        debug!(
            "청크 기록: hash={}, pos={}, processed={}/{}",
            hash,
            position,
            processed,
            state.meta().size
        );
        self.progress.on_progress(hash, processed);
    }

    /// 송신 tick
    async fn tick_send(&mut self, hash: &str) {
        let now = self.scheduler.now();
        let Ok(state) = self.registry.lookup_mut(hash) else {
            return;
        };

        if state.is_cancelled() {
            if !state.teardown_pending(now) {
                self.finish_cancelled(hash).await;
            }
            return;
        }

        if state.is_send_finished() {
            self.complete_send(hash);
            return;
        }

        let Some(fragment) = state.pop_queued() else {
            return;
        };

        let message = PeerMessage::FileChunk(FileChunkMessage::from_fragment(hash, &fragment));
        if let Err(e) = self.channel.send_message(state.contact(), &message) {
            self.fail(hash, e).await;
            return;
        }

        let processed = state.record_sent(fragment.length);
        self.stats.fragments_sent += 1;
        self.stats.bytes_sent += fragment.length as u64;

        debug!(
            "청크 전송: hash={}, pos={}, processed={}/{}",
            hash,
            fragment.position,
            processed,
            state.meta().size
        );
        self.progress.on_progress(hash, processed);
    }

    /// tick 해제와 부분 출력 삭제
    async fn teardown(&mut self, state: &mut TransferState) {
        if let Some(handle) = state.take_tick() {
            self.scheduler.release(handle);
        }

        if let Some(sink) = state.sink_mut() {
            if let Err(e) = sink.discard(&self.storage).await {
                warn!("부분 출력 삭제 실패: hash={}, {}", state.hash(), e);
            }
        }
    }

    /// 치명적 에러로 전송 종료 (한 번만 보고)
    async fn fail(&mut self, hash: &str, error: Error) {
        let Some(mut state) = self.registry.remove(hash) else {
            return;
        };
        self.teardown(&mut state).await;

        match error {
            Error::StalledPosition { .. } => self.stats.timed_out += 1,
            _ => self.stats.failed += 1,
        }

        error!(
            "전송 실패: hash={}, processed={}/{}, {}",
            hash,
            state.processed_bytes(),
            state.meta().size,
            error
        );
        self.progress.on_error(hash, error);
    }

    async fn finish_cancelled(&mut self, hash: &str) {
        let Some(mut state) = self.registry.remove(hash) else {
            return;
        };
        self.teardown(&mut state).await;
        self.stats.cancelled += 1;

        info!(
            "전송 취소 완료: hash={}, processed={}/{}",
            hash,
            state.processed_bytes(),
            state.meta().size
        );
    }

    async fn complete_receive(&mut self, hash: &str) {
        let Some(mut state) = self.registry.remove(hash) else {
            return;
        };
        if let Some(handle) = state.take_tick() {
            self.scheduler.release(handle);
        }

        let verified = match state.sink_mut() {
            Some(sink) => {
                CompletionVerifier::new(&self.storage)
                    .verify_receive(hash, sink)
                    .await
            }
            None => Ok(CompletionVerifier::new(&self.storage).verify_send(hash)),
        };

        match verified {
            Ok(completion) => {
                self.stats.completed += 1;
                info!(
                    "수신 완료: hash={}, processed={}, digest={}",
                    hash,
                    state.processed_bytes(),
                    completion.digest.as_deref().unwrap_or("-")
                );
                self.progress.on_complete(completion);
            }
            Err(e) => {
                self.teardown(&mut state).await;
                self.stats.failed += 1;
                error!("수신 검증 실패: hash={}, {}", hash, e);
                self.progress.on_error(hash, e);
            }
        }
    }

    fn complete_send(&mut self, hash: &str) {
        let Some(mut state) = self.registry.remove(hash) else {
            return;
        };
        if let Some(handle) = state.take_tick() {
            self.scheduler.release(handle);
        }

        self.stats.completed += 1;
        info!(
            "송신 완료: hash={}, processed={}",
            hash,
            state.processed_bytes()
        );
        self.progress
            .on_complete(CompletionVerifier::new(&self.storage).verify_send(hash));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentPayload;
    use crate::progress::{Completion, ProgressEvent};
    use crate::sink::FsStorage;
    use bytes::Bytes;
    use rand::seq::SliceRandom;
    use sha2::{Digest, Sha256};
    use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

    const RX_TICK: Duration = Duration::from_millis(100);
    const TX_TICK: Duration = Duration::from_millis(250);

    type Wire = UnboundedSender<(Contact, PeerMessage)>;
    type Events = UnboundedSender<ProgressEvent>;

    struct Harness {
        engine: TransferEngine<FsStorage, Wire, Events>,
        wire: UnboundedReceiver<(Contact, PeerMessage)>,
        events: UnboundedReceiver<ProgressEvent>,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let (wire_tx, wire) = mpsc::unbounded_channel();
            let (events_tx, events) = mpsc::unbounded_channel();
            Self {
                engine: TransferEngine::new(config, FsStorage::new(), wire_tx, events_tx),
                wire,
                events,
            }
        }

        fn events(&mut self) -> Vec<ProgressEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn wire(&mut self) -> Vec<PeerMessage> {
            let mut out = Vec::new();
            while let Ok((_, message)) = self.wire.try_recv() {
                out.push(message);
            }
            out
        }

        async fn ticks(&mut self, count: usize, interval: Duration) {
            for _ in 0..count {
                self.engine.advance(interval).await;
            }
        }

        fn processed(&self, hash: &str) -> u64 {
            self.engine.lookup(hash).unwrap().processed_bytes()
        }
    }

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn chunk(hash: &str, data: &[u8], fragment_size: usize, pos: usize) -> FileChunkMessage {
        let start = pos * fragment_size;
        let end = (start + fragment_size).min(data.len());
        let fragment = FragmentPayload::new(
            pos as u64,
            start as u64,
            Bytes::copy_from_slice(&data[start..end]),
        );
        FileChunkMessage::from_fragment(hash, &fragment)
    }

    fn completions(events: &[ProgressEvent]) -> Vec<&Completion> {
        events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Complete(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn errors(events: &[ProgressEvent]) -> Vec<&Error> {
        events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Error { error, .. } => Some(error),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_out_of_order_scenario() {
        let mut h = Harness::new(Config::default());
        let data = test_data(20000);
        let meta = FileMeta::new("a.bin", 20000, "h1");

        h.engine
            .start_receive(meta, Contact::new("alice"), None)
            .await
            .unwrap();
        assert_eq!(h.engine.lookup("h1").unwrap().max_position(), 2);
        assert_eq!(h.processed("h1"), 0);

        h.engine.on_fragment(chunk("h1", &data, 8192, 0)).await.unwrap();
        h.engine.advance(RX_TICK).await;
        assert_eq!(h.processed("h1"), 8192);

        h.engine.on_fragment(chunk("h1", &data, 8192, 2)).await.unwrap();
        h.engine.advance(RX_TICK).await;
        assert_eq!(h.processed("h1"), 8192);
        assert_eq!(h.engine.lookup("h1").unwrap().miss_count(), 1);
        assert_eq!(h.engine.lookup("h1").unwrap().cursor(), 1);

        h.engine.on_fragment(chunk("h1", &data, 8192, 1)).await.unwrap();
        h.engine.advance(RX_TICK).await;
        assert_eq!(h.processed("h1"), 16384);
        assert_eq!(h.engine.lookup("h1").unwrap().miss_count(), 0);

        h.engine.advance(RX_TICK).await;
        assert_eq!(h.processed("h1"), 20000);

        // 종료 조건은 다음 tick에서 처리
        h.engine.advance(RX_TICK).await;
        assert!(h.engine.lookup("h1").is_err());

        let events = h.events();
        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Progress { processed, .. } => Some(*processed),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![8192, 16384, 20000]);

        let done = completions(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].digest.as_deref(), Some("h1"));
        assert_eq!(done[0].concat_blocks().unwrap(), data);
    }

    #[tokio::test]
    async fn test_order_invariance_end_to_end() {
        let data = test_data(50_000);
        let mut rng = rand::thread_rng();

        for round in 0..5 {
            let hash = format!("perm-{round}");
            let meta = FileMeta::new("p.bin", data.len() as u64, hash.clone());

            let mut tx = Harness::new(Config::default());
            tx.engine
                .start_send(meta.clone(), Contact::new("bob"), &data[..])
                .await
                .unwrap();
            tx.ticks(10, TX_TICK).await;
            let mut wire = tx.wire();
            assert_eq!(wire.len(), 7);
            wire.shuffle(&mut rng);

            let mut rx = Harness::new(Config::default());
            rx.engine
                .start_receive(meta, Contact::new("alice"), None)
                .await
                .unwrap();
            for message in wire {
                rx.engine.handle_message(message).await.unwrap();
            }
            rx.ticks(8, RX_TICK).await;

            let events = rx.events();
            let done = completions(&events);
            assert_eq!(done.len(), 1);
            assert_eq!(done[0].concat_blocks().unwrap(), data);
            assert!(rx.engine.lookup(&hash).is_err());
        }
    }

    #[tokio::test]
    async fn test_consumed_redelivery_is_noop() {
        let mut h = Harness::new(Config::default());
        let data = test_data(20000);

        h.engine
            .start_receive(FileMeta::new("a", 20000, "h"), Contact::new("x"), None)
            .await
            .unwrap();
        h.engine.on_fragment(chunk("h", &data, 8192, 0)).await.unwrap();
        h.engine.advance(RX_TICK).await;

        h.engine.on_fragment(chunk("h", &data, 8192, 0)).await.unwrap();
        h.engine.advance(RX_TICK).await;

        let state = h.engine.lookup("h").unwrap();
        assert_eq!(state.processed_bytes(), 8192);
        assert_eq!(state.cursor(), 1);
        assert_eq!(state.pending_len(), 0);
        assert_eq!(h.engine.stats().stale_fragments, 1);
    }

    #[tokio::test]
    async fn test_timeout_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(Config::persisted(dir.path()));
        let data = test_data(20000);
        let path = dir.path().join("slow.bin");

        h.engine
            .start_receive(FileMeta::new("slow.bin", 20000, "h"), Contact::new("x"), None)
            .await
            .unwrap();

        // cursor 1 청크를 보류
        h.engine.on_fragment(chunk("h", &data, 8192, 0)).await.unwrap();
        h.engine.on_fragment(chunk("h", &data, 8192, 2)).await.unwrap();
        h.engine.advance(RX_TICK).await;
        assert_eq!(std::fs::read(&path).unwrap().len(), 8192);

        h.ticks(299, RX_TICK).await;
        let state = h.engine.lookup("h").unwrap();
        assert_eq!(state.miss_count(), 299);
        assert!(errors(&h.events()).is_empty());

        h.engine.advance(RX_TICK).await;
        assert!(h.engine.lookup("h").is_err());
        assert!(!path.exists());

        let events = h.events();
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], Error::StalledPosition { position: 1 }));
        assert_eq!(h.engine.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_single_completion() {
        let mut h = Harness::new(Config::default());
        let data = test_data(100);

        h.engine
            .start_receive(FileMeta::new("a", 100, "h"), Contact::new("x"), None)
            .await
            .unwrap();
        h.engine.on_fragment(chunk("h", &data, 8192, 0)).await.unwrap();
        h.ticks(20, RX_TICK).await;

        let events = h.events();
        assert_eq!(completions(&events).len(), 1);
        assert!(h.engine.lookup("h").is_err());
        assert_eq!(h.engine.active_transfers(), 0);
        assert_eq!(h.engine.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_cancel_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(Config::persisted(dir.path()));
        let data = test_data(20000);
        let path = dir.path().join("c.bin");

        h.engine
            .start_receive(FileMeta::new("c.bin", 20000, "h"), Contact::new("alice"), None)
            .await
            .unwrap();
        h.engine.on_fragment(chunk("h", &data, 8192, 0)).await.unwrap();
        h.engine.advance(RX_TICK).await;
        assert!(path.exists());

        h.engine.cancel("h").unwrap();
        let wire = h.wire();
        assert_eq!(wire, vec![PeerMessage::cancel("h")]);

        // 취소는 다음 tick에서 적용
        assert!(h.engine.lookup("h").is_ok());
        h.engine.advance(RX_TICK).await;
        assert!(h.engine.lookup("h").is_err());
        assert!(!path.exists());
        assert!(errors(&h.events()).is_empty());

        let result = h.engine.on_fragment(chunk("h", &data, 8192, 1)).await;
        assert!(matches!(result, Err(Error::UnknownTransfer { .. })));

        let events = h.events();
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], Error::UnknownTransfer { .. }));
        assert_eq!(h.engine.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_length_mismatch_fails_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(Config::persisted(dir.path()));
        let data = test_data(300);
        let path = dir.path().join("m.bin");

        h.engine
            .start_receive(FileMeta::new("m.bin", 300, "h"), Contact::new("x"), Some(100))
            .await
            .unwrap();
        h.engine.on_fragment(chunk("h", &data, 100, 0)).await.unwrap();
        h.engine.advance(RX_TICK).await;
        assert_eq!(std::fs::read(&path).unwrap().len(), 100);

        let mut bad = chunk("h", &data, 90, 1);
        bad.pos = 1;
        bad.length = 100;
        h.engine.on_fragment(bad).await.unwrap();

        assert!(h.engine.lookup("h").is_err());
        assert!(!path.exists());

        let events = h.events();
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert!(matches!(
            errs[0],
            Error::LengthMismatch {
                position: 1,
                declared: 100,
                received: 90
            }
        ));
    }

    #[tokio::test]
    async fn test_send_paced_by_tick() {
        let mut h = Harness::new(Config::default());
        let data = test_data(20000);

        h.engine
            .start_send(FileMeta::new("s.bin", 20000, "h"), Contact::new("bob"), &data[..])
            .await
            .unwrap();

        h.engine.advance(Duration::from_millis(249)).await;
        assert!(h.wire().is_empty());

        h.engine.advance(Duration::from_millis(1)).await;
        let wire = h.wire();
        assert_eq!(wire.len(), 1);
        match &wire[0] {
            PeerMessage::FileChunk(m) => {
                assert_eq!((m.pos, m.offset, m.length), (0, 0, 8192));
                assert_eq!(m.hash, "h");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        h.ticks(2, TX_TICK).await;
        let wire = h.wire();
        let lengths: Vec<usize> = wire
            .iter()
            .filter_map(|m| match m {
                PeerMessage::FileChunk(c) => Some(c.length),
                _ => None,
            })
            .collect();
        assert_eq!(lengths, vec![8192, 3616]);
        assert!(h.engine.lookup("h").is_ok());

        h.engine.advance(TX_TICK).await;
        assert!(h.engine.lookup("h").is_err());

        let events = h.events();
        let done = completions(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].hash, "h");
        assert!(done[0].digest.is_none() && done[0].blocks.is_none());
        assert_eq!(h.engine.stats().fragments_sent, 3);
    }

    #[tokio::test]
    async fn test_closed_channel_fails_send() {
        let mut h = Harness::new(Config::default());
        let data = test_data(100);

        h.engine
            .start_send(FileMeta::new("s", 100, "h"), Contact::new("bob"), &data[..])
            .await
            .unwrap();
        h.wire.close();
        h.engine.advance(TX_TICK).await;

        assert!(h.engine.lookup("h").is_err());
        let events = h.events();
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], Error::Channel(_)));
        assert_eq!(h.engine.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_send_validation() {
        let mut h = Harness::new(Config::default());
        let data = test_data(100);

        let too_large = FileMeta::new("big", 10_000_001, "big");
        assert!(matches!(
            h.engine
                .start_send(too_large, Contact::new("b"), &data[..])
                .await,
            Err(Error::TooLarge { .. })
        ));

        let unnamed = FileMeta::new("", 100, "h");
        assert!(matches!(
            h.engine.start_send(unnamed, Contact::new("b"), &data[..]).await,
            Err(Error::Validation(_))
        ));

        let short = FileMeta::new("short", 200, "h");
        assert!(matches!(
            h.engine.start_send(short, Contact::new("b"), &data[..]).await,
            Err(Error::Validation(_))
        ));

        let long = FileMeta::new("long", 50, "h");
        assert!(matches!(
            h.engine.start_send(long, Contact::new("b"), &data[..]).await,
            Err(Error::Validation(_))
        ));

        assert_eq!(h.engine.active_transfers(), 0);

        let ok = FileMeta::new("ok", 100, "h");
        h.engine
            .start_send(ok.clone(), Contact::new("b"), &data[..])
            .await
            .unwrap();
        assert!(matches!(
            h.engine.start_send(ok, Contact::new("b"), &data[..]).await,
            Err(Error::DuplicateTransfer { .. })
        ));
    }

    #[tokio::test]
    async fn test_receive_rejects_path_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(Config::persisted(dir.path()));

        let result = h
            .engine
            .start_receive(FileMeta::new("../x.bin", 10, "h"), Contact::new("x"), None)
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(h.engine.active_transfers(), 0);
    }

    #[tokio::test]
    async fn test_receive_rejects_output_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(Config::persisted(dir.path()));
        let path = dir.path().join("x.bin");
        let first = vec![0xAAu8; 100];

        h.engine
            .start_receive(FileMeta::new("x.bin", 100, "ha"), Contact::new("x"), None)
            .await
            .unwrap();
        h.engine.on_fragment(chunk("ha", &first, 8192, 0)).await.unwrap();
        h.engine.advance(RX_TICK).await;

        let second = h
            .engine
            .start_receive(FileMeta::new("x.bin", 100, "hb"), Contact::new("y"), None)
            .await;
        assert!(matches!(second, Err(Error::Validation(_))));
        assert!(h.engine.lookup("hb").is_err());

        // 기존 수신의 부분 출력은 그대로
        assert_eq!(std::fs::read(&path).unwrap(), first);

        h.engine.advance(RX_TICK).await;
        let events = h.events();
        let done = completions(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].hash, "ha");
        assert_eq!(
            done[0].digest.as_deref(),
            Some(hex::encode(Sha256::digest(&first)).as_str())
        );

        // 완료 후에는 같은 이름으로 다시 수신 가능
        h.engine
            .start_receive(FileMeta::new("x.bin", 100, "hb"), Contact::new("y"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_fragment_fails_transfer() {
        let mut h = Harness::new(Config::default());
        let source = test_data(40000);

        h.engine
            .start_receive(FileMeta::new("a", 20000, "h"), Contact::new("x"), None)
            .await
            .unwrap();

        // 헤더는 스스로 일관되지만 마지막 위치에 8192 바이트
        for pos in 0..3 {
            h.engine.on_fragment(chunk("h", &source, 8192, pos)).await.unwrap();
        }
        h.ticks(5, RX_TICK).await;

        assert!(h.engine.lookup("h").is_err());
        let events = h.events();
        assert!(completions(&events).is_empty());
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert!(matches!(
            errs[0],
            Error::LengthMismatch {
                position: 2,
                declared: 3616,
                received: 8192
            }
        ));
    }

    #[tokio::test]
    async fn test_misplaced_offset_fails_transfer() {
        let mut h = Harness::new(Config::default());
        let data = test_data(20000);

        h.engine
            .start_receive(FileMeta::new("a", 20000, "h"), Contact::new("x"), None)
            .await
            .unwrap();

        let mut misplaced = chunk("h", &data, 8192, 1);
        misplaced.offset = 0;
        h.engine.on_fragment(misplaced).await.unwrap();

        assert!(h.engine.lookup("h").is_err());
        let events = h.events();
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert!(matches!(
            errs[0],
            Error::OffsetMismatch {
                position: 1,
                expected: 8192,
                received: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_peer_cancel_grace() {
        let mut h = Harness::new(Config::default());
        let data = test_data(20000);

        h.engine
            .start_receive(FileMeta::new("a", 20000, "h"), Contact::new("x"), None)
            .await
            .unwrap();
        h.engine
            .handle_raw(br#"{"cmd":"fcancel","hash":"h"}"#)
            .await
            .unwrap();

        // 유예 중 도착한 청크는 에러 없이 버림
        h.engine.on_fragment(chunk("h", &data, 8192, 0)).await.unwrap();
        h.engine.advance(Duration::from_millis(900)).await;
        assert!(h.engine.lookup("h").is_ok());
        assert_eq!(h.processed("h"), 0);

        h.engine.advance(Duration::from_millis(100)).await;
        assert!(h.engine.lookup("h").is_err());

        let events = h.events();
        assert!(matches!(events[0], ProgressEvent::PeerCancel { ref hash } if hash == "h"));
        assert!(errors(&events).is_empty());
        assert!(completions(&events).is_empty());
    }

    #[tokio::test]
    async fn test_peer_cancel_stops_sender() {
        let mut h = Harness::new(Config::default());
        let data = test_data(20000);

        h.engine
            .start_send(FileMeta::new("s", 20000, "h"), Contact::new("bob"), &data[..])
            .await
            .unwrap();
        h.engine.advance(TX_TICK).await;
        h.engine.on_peer_cancel("h");
        h.ticks(8, TX_TICK).await;

        assert_eq!(h.wire().len(), 1);
        assert!(h.engine.lookup("h").is_err());
        assert!(completions(&h.events()).is_empty());
        assert_eq!(h.engine.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_storage_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("incoming");
        let mut h = Harness::new(Config::persisted(&data_dir));
        let data = test_data(20000);

        h.engine
            .start_receive(FileMeta::new("f.bin", 20000, "h"), Contact::new("x"), None)
            .await
            .unwrap();
        std::fs::remove_dir_all(&data_dir).unwrap();

        h.engine.on_fragment(chunk("h", &data, 8192, 0)).await.unwrap();
        h.engine.advance(RX_TICK).await;

        assert!(h.engine.lookup("h").is_err());
        let events = h.events();
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], Error::Storage { .. }));
    }

    #[tokio::test]
    async fn test_persisted_digest_matches_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(Config::persisted(dir.path()));
        let data = test_data(20000);
        let expected = hex::encode(Sha256::digest(&data));

        h.engine
            .start_receive(
                FileMeta::new("d.bin", 20000, expected.clone()),
                Contact::new("x"),
                None,
            )
            .await
            .unwrap();
        for pos in [2, 1, 0] {
            h.engine.on_fragment(chunk(&expected, &data, 8192, pos)).await.unwrap();
        }
        h.ticks(4, RX_TICK).await;

        let events = h.events();
        let done = completions(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].digest.as_deref(), Some(expected.as_str()));
        assert_eq!(done[0].path.as_deref(), Some(dir.path().join("d.bin").as_path()));
        assert_eq!(std::fs::read(dir.path().join("d.bin")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_out_of_range_dropped() {
        let mut h = Harness::new(Config::default());
        let data = test_data(40000);

        h.engine
            .start_receive(FileMeta::new("a", 20000, "h"), Contact::new("x"), None)
            .await
            .unwrap();

        let result = h.engine.on_fragment(chunk("h", &data, 8192, 4)).await;
        assert!(matches!(
            result,
            Err(Error::PositionOutOfRange {
                position: 4,
                max_position: 2
            })
        ));
        assert_eq!(h.engine.lookup("h").unwrap().pending_len(), 0);
    }

    #[tokio::test]
    async fn test_transfers_are_independent() {
        let mut h = Harness::new(Config::default());
        let data = test_data(100);

        h.engine
            .start_receive(FileMeta::new("a", 100, "stalled"), Contact::new("x"), None)
            .await
            .unwrap();
        h.engine
            .start_receive(FileMeta::new("b", 100, "flowing"), Contact::new("y"), None)
            .await
            .unwrap();

        let mut bad = chunk("stalled", &data, 8192, 0);
        bad.length = 1;
        h.engine.on_fragment(bad).await.unwrap();
        h.engine.on_fragment(chunk("flowing", &data, 8192, 0)).await.unwrap();
        h.ticks(2, RX_TICK).await;

        let events = h.events();
        assert_eq!(errors(&events).len(), 1);
        assert_eq!(completions(&events).len(), 1);
        assert_eq!(completions(&events)[0].hash, "flowing");
    }
}
