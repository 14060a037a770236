//! 에러 타입 정의

use thiserror::Error;

/// CFT 전송 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("base64 디코딩 에러: {0}")]
    Decode(#[from] base64::DecodeError),

    /// 전송 생성 전 검증 실패 (레지스트리에 등록되지 않음)
    #[error("유효하지 않은 전송 요청: {0}")]
    Validation(String),

    #[error("최대 전송 크기 초과: {size} bytes (최대 {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("이미 등록된 전송: hash={hash}")]
    DuplicateTransfer { hash: String },

    #[error("청크 길이 불일치: position={position}, declared={declared}, received={received}")]
    LengthMismatch {
        position: u64,
        declared: usize,
        received: usize,
    },

    #[error("청크 오프셋 불일치: position={position}, expected={expected}, received={received}")]
    OffsetMismatch {
        position: u64,
        expected: u64,
        received: u64,
    },

    #[error("빈 청크: position={position}")]
    EmptyFragment { position: u64 },

    #[error("전송을 찾을 수 없음: hash={hash}")]
    UnknownTransfer { hash: String },

    #[error("전송 타임아웃: position {position}의 청크를 받지 못함")]
    StalledPosition { position: u64 },

    #[error("유효하지 않은 청크 위치: position={position}, max_position={max_position}")]
    PositionOutOfRange { position: u64, max_position: u64 },

    #[error("저장소 에러 ({path}): {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("피어 채널 에러: {0}")]
    Channel(String),

    /// 서비스 태스크가 종료되어 명령을 받을 수 없음
    #[error("전송 서비스 종료됨")]
    ServiceStopped,
}

impl Error {
    /// 저장소 에러 생성 헬퍼
    pub fn storage(path: &std::path::Path, source: std::io::Error) -> Self {
        Error::Storage {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
