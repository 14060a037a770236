//! 전송 엔진 설정

use std::path::PathBuf;
use std::time::Duration;

use crate::{
    DEFAULT_FRAGMENT_SIZE, DEFAULT_MAX_MISS_TICKS, DEFAULT_RECEIVE_INTERVAL_MS,
    DEFAULT_SEND_INTERVAL_MS, MAX_TRANSFER_SIZE,
};

/// 송신 pacing 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingPolicy {
    /// 파일 크기와 무관하게 `fragment_size` / `send_interval_ms` 고정
    Fixed,

    /// 파일 크기 구간별로 청크 크기와 전송 간격 선택
    SizeAdaptive,
}

/// 한 송신 전송에 적용할 청크 크기와 tick 간격
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPlan {
    pub fragment_size: usize,
    pub interval: Duration,
}

/// CFT 엔진 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 청크 크기 (바이트), 한 전송 동안 고정
    pub fragment_size: usize,

    /// 송신 tick 간격 (밀리초)
    pub send_interval_ms: u64,

    /// 수신 drain tick 간격 (밀리초)
    pub receive_interval_ms: u64,

    /// 연속 miss tick 한도
    /// 기본 300 = 100ms 간격에서 30초
    pub max_miss_ticks: u32,

    /// 최대 전송 크기 (바이트)
    pub max_transfer_size: u64,

    /// 피어 취소 후 로컬 상태 정리까지의 유예 시간 (밀리초)
    pub peer_cancel_grace_ms: u64,

    /// 수신 파일 저장 디렉터리
    /// None이면 메모리 블록 리스트로 수신
    pub data_path: Option<PathBuf>,

    /// 송신 pacing 정책
    pub pacing: PacingPolicy,

    /// 서비스 명령 채널 크기
    pub cmd_buffer_size: usize,

    /// 서비스 ticker 주기 (밀리초)
    pub tick_granularity_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            send_interval_ms: DEFAULT_SEND_INTERVAL_MS,       // 250ms
            receive_interval_ms: DEFAULT_RECEIVE_INTERVAL_MS, // 100ms
            max_miss_ticks: DEFAULT_MAX_MISS_TICKS,           // 30초
            max_transfer_size: MAX_TRANSFER_SIZE,             // 10MB
            peer_cancel_grace_ms: 1000,
            data_path: None,
            pacing: PacingPolicy::Fixed,
            cmd_buffer_size: 1000,
            tick_granularity_ms: 50,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 수신 파일을 디스크에 저장하는 설정
    pub fn persisted(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: Some(data_path.into()),
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            max_miss_ticks: 600,          // 60초
            peer_cancel_grace_ms: 3000,
            send_interval_ms: 300,
            ..Self::default()
        }
    }

    /// 크기 구간별 pacing 설정
    pub fn size_adaptive() -> Self {
        Self {
            pacing: PacingPolicy::SizeAdaptive,
            ..Self::default()
        }
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn receive_interval(&self) -> Duration {
        Duration::from_millis(self.receive_interval_ms)
    }

    pub fn peer_cancel_grace(&self) -> Duration {
        Duration::from_millis(self.peer_cancel_grace_ms)
    }

    /// 파일 크기에 맞는 송신 계획 계산
    pub fn send_plan(&self, size: u64) -> SendPlan {
        let (fragment_size, interval_ms) = match self.pacing {
            PacingPolicy::Fixed => (self.fragment_size, self.send_interval_ms),
            PacingPolicy::SizeAdaptive => match size {
                0..=100_000 => (self.fragment_size, 150),
                100_001..=1_000_000 => (8192, 200),
                1_000_001..=4_000_000 => (16384, 250),
                4_000_001..=10_000_000 => (16384, 300),
                _ => (16384, 400),
            },
        };

        SendPlan {
            fragment_size,
            interval: Duration::from_millis(interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_plan_ignores_size() {
        let config = Config::default();
        let small = config.send_plan(10);
        let large = config.send_plan(9_000_000);

        assert_eq!(small, large);
        assert_eq!(small.fragment_size, 8192);
        assert_eq!(small.interval, Duration::from_millis(250));
    }

    #[test]
    fn test_adaptive_plan_table() {
        let config = Config::size_adaptive();

        assert_eq!(config.send_plan(50_000).interval, Duration::from_millis(150));
        assert_eq!(config.send_plan(500_000).fragment_size, 8192);
        assert_eq!(config.send_plan(2_000_000).fragment_size, 16384);
        assert_eq!(config.send_plan(2_000_000).interval, Duration::from_millis(250));
        assert_eq!(config.send_plan(10_000_000).interval, Duration::from_millis(300));
        assert_eq!(config.send_plan(10_000_001).interval, Duration::from_millis(400));
    }
}
