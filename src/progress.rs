//! 진행 상황 보고 (외부 작업 추적기 인터페이스)

use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Error;

/// 완료 보고
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// 전송 식별자
    pub hash: String,

    /// 검증된 다이제스트
    /// 영속 수신: 파일 다이제스트, 메모리 수신: 원래 hash, 송신: None
    pub digest: Option<String>,

    /// 저장 경로 (영속 수신만)
    pub path: Option<PathBuf>,

    /// 위치 순 블록 (메모리 수신만)
    pub blocks: Option<Vec<Bytes>>,
}

impl Completion {
    /// 블록을 이어붙인 전체 데이터 (메모리 수신)
    pub fn concat_blocks(&self) -> Option<Vec<u8>> {
        self.blocks
            .as_ref()
            .map(|blocks| blocks.iter().flat_map(|b| b.iter().copied()).collect())
    }
}

/// 작업 진행 추적기
///
/// 모든 콜백은 스케줄링 컨텍스트 안에서 동기 호출된다.
pub trait TaskProgress: Send + Sync + 'static {
    fn on_progress(&self, hash: &str, processed: u64);
    fn on_complete(&self, completion: Completion);

    /// 전송당 한 번만 호출된다
    fn on_error(&self, hash: &str, error: Error);

    fn on_peer_cancel(&self, hash: &str);
}

/// 채널로 전달되는 진행 이벤트
#[derive(Debug)]
pub enum ProgressEvent {
    Progress { hash: String, processed: u64 },
    Complete(Completion),
    Error { hash: String, error: Error },
    PeerCancel { hash: String },
}

impl TaskProgress for mpsc::UnboundedSender<ProgressEvent> {
    fn on_progress(&self, hash: &str, processed: u64) {
        let _ = self.send(ProgressEvent::Progress {
            hash: hash.to_string(),
            processed,
        });
    }

    fn on_complete(&self, completion: Completion) {
        let _ = self.send(ProgressEvent::Complete(completion));
    }

    fn on_error(&self, hash: &str, error: Error) {
        let _ = self.send(ProgressEvent::Error {
            hash: hash.to_string(),
            error,
        });
    }

    fn on_peer_cancel(&self, hash: &str) {
        let _ = self.send(ProgressEvent::PeerCancel {
            hash: hash.to_string(),
        });
    }
}
