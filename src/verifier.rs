//! 완료 검증
//!
//! 영속 수신은 완성된 파일의 다이제스트를 계산하고,
//! 메모리 수신은 별도 다이제스트 없이 원래 hash를 식별자로 사용한다.

use crate::progress::Completion;
use crate::sink::{OutputSink, Storage};
use crate::Result;

pub struct CompletionVerifier<'a, S> {
    storage: &'a S,
}

impl<'a, S: Storage> CompletionVerifier<'a, S> {
    pub fn new(storage: &'a S) -> Self {
        Self { storage }
    }

    /// 수신 완료 보고 생성
    pub async fn verify_receive(&self, hash: &str, sink: &mut OutputSink) -> Result<Completion> {
        if let Some(path) = sink.path() {
            let digest = self.storage.compute_digest(path).await?;
            return Ok(Completion {
                hash: hash.to_string(),
                digest: Some(digest),
                path: Some(path.to_path_buf()),
                blocks: None,
            });
        }

        Ok(Completion {
            hash: hash.to_string(),
            digest: Some(hash.to_string()),
            path: None,
            blocks: sink.take_blocks(),
        })
    }

    /// 송신 완료 보고 (페이로드 없음)
    pub fn verify_send(&self, hash: &str) -> Completion {
        Completion {
            hash: hash.to_string(),
            digest: None,
            path: None,
            blocks: None,
        }
    }
}
