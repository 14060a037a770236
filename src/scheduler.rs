//! 논리 시계 기반 tick 스케줄러
//!
//! 전송마다 고정 주기의 tick 하나를 소유한다.
//! 실제 타이머 대신 논리 시계를 `advance`로 전진시키므로
//! 테스트에서 가상 시간을 결정적으로 진행할 수 있다.

use std::collections::BTreeMap;
use std::time::Duration;

/// tick 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickId(u64);

/// tick 소유권
///
/// Clone 불가. `TickScheduler::release`로 소비되면 다시 발화할 수 없다.
#[derive(Debug, PartialEq, Eq)]
pub struct TickHandle {
    id: TickId,
}

impl TickHandle {
    pub fn id(&self) -> TickId {
        self.id
    }
}

#[derive(Debug)]
struct TickEntry {
    hash: String,
    interval: Duration,
    next_due: Duration,
}

/// tick 스케줄러
#[derive(Debug, Default)]
pub struct TickScheduler {
    /// 논리 시각 (시작 이후 경과)
    now: Duration,
    next_id: u64,
    entries: BTreeMap<TickId, TickEntry>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 현재 논리 시각
    pub fn now(&self) -> Duration {
        self.now
    }

    /// 주기 tick 등록, 첫 발화는 now + interval
    pub fn schedule(&mut self, hash: &str, interval: Duration) -> TickHandle {
        let interval = interval.max(Duration::from_millis(1));
        let id = TickId(self.next_id);
        self.next_id += 1;

        self.entries.insert(
            id,
            TickEntry {
                hash: hash.to_string(),
                interval,
                next_due: self.now + interval,
            },
        );

        TickHandle { id }
    }

    /// tick 해제 (종료 전이에서 정확히 한 번)
    pub fn release(&mut self, handle: TickHandle) -> bool {
        self.entries.remove(&handle.id).is_some()
    }

    /// `until` 이전에 도래한 가장 이른 tick을 꺼낸다
    ///
    /// 시각은 해당 tick의 예정 시각으로 전진하고 다음 발화가 예약된다.
    /// 같은 시각이면 먼저 등록된 tick이 우선.
    pub fn pop_due(&mut self, until: Duration) -> Option<(TickId, String)> {
        let (&id, _) = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.next_due <= until)
            .min_by_key(|(id, entry)| (entry.next_due, **id))?;

        let entry = self.entries.get_mut(&id)?;
        self.now = self.now.max(entry.next_due);
        entry.next_due += entry.interval;

        Some((id, entry.hash.clone()))
    }

    /// 도래한 tick을 모두 꺼낸 후 시각을 `until`로 맞춤
    pub fn settle(&mut self, until: Duration) {
        self.now = self.now.max(until);
    }

    /// 활성 tick 수
    pub fn active(&self) -> usize {
        self.entries.len()
    }
}
