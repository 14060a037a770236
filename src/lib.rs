//! # CFT (Chunked File Transfer)
//!
//! 메시지 채널 위의 청크 단위 파일 전송 신뢰성 엔진
//!
//! ## 핵심 특징
//! - **위치 기반 재정렬**: 순서 없이 도착한 청크를 position 순으로 소비
//! - **주기 drain tick**: 전송마다 tick 하나, 한 tick에 최대 한 청크
//! - **miss 카운트 타임아웃**: cursor 청크가 오지 않으면 연속 miss로 실패 판정
//! - **송신 pacing**: 고정 간격 또는 파일 크기 구간별 간격
//! - **단일 태스크 직렬화**: tick, 인바운드 처리, 레지스트리 변경이 한 태스크에서 실행

pub mod config;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod message;
pub mod progress;
pub mod registry;
pub mod reorder;
pub mod scheduler;
pub mod service;
pub mod sink;
pub mod stats;
pub mod transfer;
pub mod verifier;

pub use config::{Config, PacingPolicy, SendPlan};
pub use engine::TransferEngine;
pub use error::{Error, Result};
pub use fragment::{FragmentPayload, Position, SourceChunker};
pub use message::{Contact, FileCancelMessage, FileChunkMessage, PeerChannel, PeerMessage};
pub use progress::{Completion, ProgressEvent, TaskProgress};
pub use reorder::{EnqueueResult, ReorderBuffer};
pub use service::{SendSource, TransferService};
pub use sink::{FsStorage, OutputSink, Storage};
pub use stats::TransferStats;
pub use transfer::{Direction, FileMeta, TransferState};

/// 기본 청크 크기 (바이트)
pub const DEFAULT_FRAGMENT_SIZE: usize = 8192;

/// 기본 송신 tick 간격 (밀리초)
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 250;

/// 기본 수신 drain tick 간격 (밀리초)
pub const DEFAULT_RECEIVE_INTERVAL_MS: u64 = 100;

/// 기본 연속 miss 한도
pub const DEFAULT_MAX_MISS_TICKS: u32 = 300;

/// 최대 전송 크기 (바이트)
pub const MAX_TRANSFER_SIZE: u64 = 10_000_000; // 10MB
