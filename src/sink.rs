//! 수신 출력 저장소
//!
//! - Storage: 디스크 저장소 인터페이스 (append 전용 + 삭제 + 다이제스트)
//! - OutputSink: 영속 파일 / 메모리 블록 리스트 두 가지 출력

use std::future::Future;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::{Error, Result};

/// 저장소 인터페이스
///
/// 모든 연산은 비동기로 수행되며 스케줄링 컨텍스트를 블로킹하지 않는다.
pub trait Storage: Send + Sync + 'static {
    /// 빈 파일 생성 (기존 내용은 잘라냄)
    fn create_file(&self, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// 파일 끝에 추가
    fn append_bytes(&self, path: &Path, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// 파일 삭제 (없으면 성공)
    fn delete_file(&self, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// 파일 내용 다이제스트 (hex)
    fn compute_digest(&self, path: &Path) -> impl Future<Output = Result<String>> + Send;
}

/// tokio::fs 기반 저장소, SHA-256 다이제스트
#[derive(Debug, Clone, Default)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Storage for FsStorage {
    async fn create_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(path, e))?;
        }
        fs::File::create(path)
            .await
            .map_err(|e| Error::storage(path, e))?;
        Ok(())
    }

    async fn append_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .map_err(|e| Error::storage(path, e))?;

        file.write_all(bytes)
            .await
            .map_err(|e| Error::storage(path, e))?;
        file.flush().await.map_err(|e| Error::storage(path, e))?;
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(path, e)),
        }
    }

    async fn compute_digest(&self, path: &Path) -> Result<String> {
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| Error::storage(path, e))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| Error::storage(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// 수신 출력
#[derive(Debug)]
pub enum OutputSink {
    /// append 전용 영속 파일
    Persisted { path: PathBuf },

    /// 메모리 블록 리스트 (위치 순)
    Memory { blocks: Vec<Bytes> },
}

impl OutputSink {
    pub fn persisted(path: impl Into<PathBuf>) -> Self {
        OutputSink::Persisted { path: path.into() }
    }

    pub fn memory() -> Self {
        OutputSink::Memory { blocks: Vec::new() }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            OutputSink::Persisted { path } => Some(path),
            OutputSink::Memory { .. } => None,
        }
    }

    /// 출력 준비 (영속 모드면 빈 파일 생성)
    pub async fn open<S: Storage>(&self, storage: &S) -> Result<()> {
        match self {
            OutputSink::Persisted { path } => storage.create_file(path).await,
            OutputSink::Memory { .. } => Ok(()),
        }
    }

    /// 블록 추가
    pub async fn append<S: Storage>(&mut self, storage: &S, bytes: Bytes) -> Result<()> {
        match self {
            OutputSink::Persisted { path } => storage.append_bytes(path, &bytes).await,
            OutputSink::Memory { blocks } => {
                blocks.push(bytes);
                Ok(())
            }
        }
    }

    /// 부분 출력 폐기
    pub async fn discard<S: Storage>(&mut self, storage: &S) -> Result<()> {
        match self {
            OutputSink::Persisted { path } => {
                debug!("부분 출력 삭제: {}", path.display());
                storage.delete_file(path).await
            }
            OutputSink::Memory { blocks } => {
                blocks.clear();
                Ok(())
            }
        }
    }

    /// 메모리 블록 꺼내기
    pub fn take_blocks(&mut self) -> Option<Vec<Bytes>> {
        match self {
            OutputSink::Memory { blocks } => Some(std::mem::take(blocks)),
            OutputSink::Persisted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_append_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let storage = FsStorage::new();

        let mut sink = OutputSink::persisted(&path);
        sink.open(&storage).await.unwrap();
        sink.append(&storage, Bytes::from_static(b"ab")).await.unwrap();
        sink.append(&storage, Bytes::from_static(b"c")).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abc");

        // sha256("abc")
        assert_eq!(
            storage.compute_digest(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_open_truncates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"stale content").unwrap();

        let storage = FsStorage::new();
        OutputSink::persisted(&path).open(&storage).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_discard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let storage = FsStorage::new();

        let mut sink = OutputSink::persisted(&path);
        sink.open(&storage).await.unwrap();
        sink.append(&storage, Bytes::from_static(b"xyz")).await.unwrap();
        sink.discard(&storage).await.unwrap();

        assert!(!path.exists());
        // 두 번째 삭제도 성공
        sink.discard(&storage).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_order() {
        let storage = FsStorage::new();
        let mut sink = OutputSink::memory();

        sink.append(&storage, Bytes::from_static(b"1")).await.unwrap();
        sink.append(&storage, Bytes::from_static(b"2")).await.unwrap();

        assert!(sink.path().is_none());
        let blocks = sink.take_blocks().unwrap();
        assert_eq!(blocks, vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
    }
}
