//! 위치 기반 재정렬 버퍼 (수신측)
//!
//! 도착 순서와 무관하게 청크를 position으로 보관하고,
//! cursor 위치의 청크만 꺼내 오름차순 바이트 순서를 보장한다.

use std::collections::BTreeMap;

use crate::fragment::{FragmentPayload, Position};

/// 청크 삽입 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// 새 청크 보관
    Buffered,

    /// 아직 소비되지 않은 같은 위치의 청크를 덮어씀
    Replaced,

    /// 이미 소비된 위치 (무시)
    Stale,

    /// max_position을 넘는 위치 (무시)
    OutOfRange,
}

/// 재정렬 버퍼
#[derive(Debug)]
pub struct ReorderBuffer {
    /// 아직 소비되지 않은 청크
    pending: BTreeMap<Position, FragmentPayload>,

    /// 다음에 소비할 위치
    cursor: Position,

    /// 마지막 청크 위치
    max_position: Position,
}

impl ReorderBuffer {
    pub fn new(max_position: Position) -> Self {
        Self {
            pending: BTreeMap::new(),
            cursor: 0,
            max_position,
        }
    }

    /// 청크 삽입
    pub fn enqueue(&mut self, fragment: FragmentPayload) -> EnqueueResult {
        let position = fragment.position;

        if position < self.cursor {
            return EnqueueResult::Stale;
        }
        if position > self.max_position {
            return EnqueueResult::OutOfRange;
        }

        match self.pending.insert(position, fragment) {
            Some(_) => EnqueueResult::Replaced,
            None => EnqueueResult::Buffered,
        }
    }

    /// cursor 위치의 청크를 꺼내고 cursor 전진
    ///
    /// tick마다 한 번 호출된다. 없으면 None (miss).
    pub fn try_consume_next(&mut self) -> Option<FragmentPayload> {
        let fragment = self.pending.remove(&self.cursor)?;
        self.cursor += 1;
        Some(fragment)
    }

    /// 다음에 소비할 위치
    pub fn cursor(&self) -> Position {
        self.cursor
    }

    pub fn max_position(&self) -> Position {
        self.max_position
    }

    /// 보관 중인 청크 수
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
