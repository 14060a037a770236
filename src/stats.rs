//! 전송 통계

use std::time::{Duration, Instant};

/// 엔진 전체 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 시작된 송신 수
    pub started_sends: u64,

    /// 시작된 수신 수
    pub started_receives: u64,

    /// 완료된 전송 수
    pub completed: u64,

    /// 취소된 전송 수
    pub cancelled: u64,

    /// 타임아웃된 전송 수
    pub timed_out: u64,

    /// 그 외 에러로 실패한 전송 수
    pub failed: u64,

    /// 송신한 청크 수
    pub fragments_sent: u64,

    /// 소비(기록)한 청크 수
    pub fragments_consumed: u64,

    /// 소비 전 중복 도착 청크 수
    pub duplicate_fragments: u64,

    /// 이미 소비된 위치로 도착한 청크 수
    pub stale_fragments: u64,

    /// 등록되지 않은 hash로 도착한 청크 수
    pub unknown_fragments: u64,

    /// 출력에 기록한 바이트
    pub bytes_written: u64,

    /// 송신한 바이트
    pub bytes_sent: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            started_sends: 0,
            started_receives: 0,
            completed: 0,
            cancelled: 0,
            timed_out: 0,
            failed: 0,
            fragments_sent: 0,
            fragments_consumed: 0,
            duplicate_fragments: 0,
            stale_fragments: 0,
            unknown_fragments: 0,
            bytes_written: 0,
            bytes_sent: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 진행 중 전송 수
    pub fn in_flight(&self) -> u64 {
        (self.started_sends + self.started_receives)
            .saturating_sub(self.completed + self.cancelled + self.timed_out + self.failed)
    }

    /// 중복 도착률 (소비된 청크 대비)
    pub fn duplicate_ratio(&self) -> f64 {
        let total = self.fragments_consumed + self.duplicate_fragments + self.stale_fragments;
        if total == 0 {
            return 0.0;
        }
        (self.duplicate_fragments + self.stale_fragments) as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Transfers: {} done, {} cancelled, {} timed out, {} failed, {} active | Sent: {} frags / {} bytes | Written: {} frags / {} bytes | Dup: {:.2}% | Unknown: {}",
            self.elapsed().as_secs_f64(),
            self.completed,
            self.cancelled,
            self.timed_out,
            self.failed,
            self.in_flight(),
            self.fragments_sent,
            self.bytes_sent,
            self.fragments_consumed,
            self.bytes_written,
            self.duplicate_ratio() * 100.0,
            self.unknown_fragments,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
