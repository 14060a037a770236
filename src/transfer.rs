//! 전송 상태
//!
//! 한 hash에 대한 진행 중 전송 하나의 집합 상태.
//! 인바운드 청크 전달과 자기 tick에 의해서만 변경된다.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use crate::fragment::{max_position, FragmentPayload, Position};
use crate::message::Contact;
use crate::reorder::{EnqueueResult, ReorderBuffer};
use crate::scheduler::{TickHandle, TickId};
use crate::sink::OutputSink;
use crate::{Error, Result};

/// 파일 메타데이터 (전송 생성 시 고정)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub hash: String,
    pub media_type: Option<String>,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, size: u64, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            hash: hash.into(),
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// 생성 전 검증
    pub fn validate(&self) -> Result<()> {
        if self.hash.is_empty() {
            return Err(Error::Validation("hash 없음".into()));
        }
        if self.name.is_empty() {
            return Err(Error::Validation("파일 이름 없음".into()));
        }
        if self.size == 0 {
            return Err(Error::Validation("빈 파일은 전송할 수 없음".into()));
        }
        Ok(())
    }

    /// 디렉터리 구성요소가 없는 순수 파일 이름인지
    pub fn is_plain_name(&self) -> bool {
        Path::new(&self.name).file_name().and_then(|n| n.to_str()) == Some(self.name.as_str())
    }
}

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// 방향별 대기 청크
#[derive(Debug)]
enum Pending {
    /// 송신 FIFO 큐
    Send {
        queue: VecDeque<FragmentPayload>,
        next_position: Position,
    },

    /// 수신 재정렬 버퍼와 출력
    Receive {
        buffer: ReorderBuffer,
        sink: OutputSink,
    },
}

/// 전송 상태
#[derive(Debug)]
pub struct TransferState {
    meta: FileMeta,
    contact: Contact,
    fragment_size: usize,
    max_position: Position,
    processed_bytes: u64,
    miss_count: u32,
    cancelled: bool,

    /// 피어 취소 유예 종료 시각 (논리 시계)
    teardown_at: Option<Duration>,

    pending: Pending,
    tick: Option<TickHandle>,
}

impl TransferState {
    /// 송신 상태 생성
    pub fn new_send(
        meta: FileMeta,
        contact: Contact,
        fragment_size: usize,
        queue: VecDeque<FragmentPayload>,
    ) -> Self {
        Self::new(
            meta,
            contact,
            fragment_size,
            |_| Pending::Send {
                queue,
                next_position: 0,
            },
        )
    }

    /// 수신 상태 생성
    pub fn new_receive(
        meta: FileMeta,
        contact: Contact,
        fragment_size: usize,
        sink: OutputSink,
    ) -> Self {
        Self::new(meta, contact, fragment_size, |max_position| Pending::Receive {
            buffer: ReorderBuffer::new(max_position),
            sink,
        })
    }

    fn new(
        meta: FileMeta,
        contact: Contact,
        fragment_size: usize,
        pending: impl FnOnce(Position) -> Pending,
    ) -> Self {
        let max_position = max_position(meta.size, fragment_size);
        Self {
            meta,
            contact,
            fragment_size,
            max_position,
            processed_bytes: 0,
            miss_count: 0,
            cancelled: false,
            teardown_at: None,
            pending: pending(max_position),
            tick: None,
        }
    }

    pub fn hash(&self) -> &str {
        &self.meta.hash
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn direction(&self) -> Direction {
        match self.pending {
            Pending::Send { .. } => Direction::Send,
            Pending::Receive { .. } => Direction::Receive,
        }
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn max_position(&self) -> Position {
        self.max_position
    }

    /// 다음 위치 (수신: 소비할 위치, 송신: 보낼 위치)
    pub fn cursor(&self) -> Position {
        match &self.pending {
            Pending::Send { next_position, .. } => *next_position,
            Pending::Receive { buffer, .. } => buffer.cursor(),
        }
    }

    pub fn processed_bytes(&self) -> u64 {
        self.processed_bytes
    }

    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// 취소 표시 (한 번 설정되면 해제되지 않음)
    ///
    /// `teardown_at`이 있으면 그 시각까지 상태를 유지해 진행 중 청크를 흡수한다.
    pub fn cancel(&mut self, teardown_at: Option<Duration>) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.teardown_at = teardown_at;
    }

    /// 취소 유예 중인지
    pub fn teardown_pending(&self, now: Duration) -> bool {
        matches!(self.teardown_at, Some(at) if now < at)
    }

    /// 위치별 기대 (오프셋, 길이)
    ///
    /// 마지막 위치만 fragment_size보다 짧을 수 있다.
    pub fn expected_geometry(&self, position: Position) -> (u64, usize) {
        let fragment_size = self.fragment_size as u64;
        let offset = position.saturating_mul(fragment_size);
        let length = self.meta.size.saturating_sub(offset).min(fragment_size);
        (offset, length as usize)
    }

    /// 수신 종료 조건
    pub fn is_terminal(&self) -> bool {
        self.processed_bytes >= self.meta.size || self.cursor() > self.max_position
    }

    /// 송신 종료 조건: 큐가 비었고 선언 크기만큼 전송
    pub fn is_send_finished(&self) -> bool {
        match &self.pending {
            Pending::Send { queue, .. } => {
                queue.is_empty() && self.processed_bytes >= self.meta.size
            }
            Pending::Receive { .. } => false,
        }
    }

    /// 보관 중인 청크 수
    pub fn pending_len(&self) -> usize {
        match &self.pending {
            Pending::Send { queue, .. } => queue.len(),
            Pending::Receive { buffer, .. } => buffer.pending_len(),
        }
    }

    pub fn attach_tick(&mut self, handle: TickHandle) {
        debug_assert!(self.tick.is_none(), "전송당 tick은 하나");
        self.tick = Some(handle);
    }

    pub fn tick_id(&self) -> Option<TickId> {
        self.tick.as_ref().map(TickHandle::id)
    }

    pub fn take_tick(&mut self) -> Option<TickHandle> {
        self.tick.take()
    }

    /// 수신 청크 보관
    pub fn enqueue(&mut self, fragment: FragmentPayload) -> Option<EnqueueResult> {
        match &mut self.pending {
            Pending::Receive { buffer, .. } => Some(buffer.enqueue(fragment)),
            Pending::Send { .. } => None,
        }
    }

    /// cursor 청크 꺼내기 (수신)
    pub fn consume_next(&mut self) -> Option<FragmentPayload> {
        match &mut self.pending {
            Pending::Receive { buffer, .. } => buffer.try_consume_next(),
            Pending::Send { .. } => None,
        }
    }

    /// 소비 완료 기록, 누적 처리 바이트 반환
    pub fn record_consumed(&mut self, length: usize) -> u64 {
        self.processed_bytes += length as u64;
        self.miss_count = 0;
        self.processed_bytes
    }

    /// miss 기록, 연속 miss 수 반환
    pub fn record_miss(&mut self) -> u32 {
        self.miss_count += 1;
        self.miss_count
    }

    /// 송신 큐 앞 청크 꺼내기
    pub fn pop_queued(&mut self) -> Option<FragmentPayload> {
        match &mut self.pending {
            Pending::Send { queue, .. } => queue.pop_front(),
            Pending::Receive { .. } => None,
        }
    }

    /// 송신 완료 기록, 누적 처리 바이트 반환
    pub fn record_sent(&mut self, length: usize) -> u64 {
        if let Pending::Send { next_position, .. } = &mut self.pending {
            *next_position += 1;
        }
        self.record_consumed(length)
    }

    pub fn sink(&self) -> Option<&OutputSink> {
        match &self.pending {
            Pending::Receive { sink, .. } => Some(sink),
            Pending::Send { .. } => None,
        }
    }

    pub fn sink_mut(&mut self) -> Option<&mut OutputSink> {
        match &mut self.pending {
            Pending::Receive { sink, .. } => Some(sink),
            Pending::Send { .. } => None,
        }
    }
}
