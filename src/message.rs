//! 피어 메시지 정의
//!
//! 송신측 → 수신측 청크 메시지와 취소 메시지 두 가지뿐.
//! JSON 형태: `{ "cmd": "fsend", "hash", "pos", "offset", "length", "chunk" }`

use std::fmt;

use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::fragment::{FragmentPayload, Position};
use crate::{Error, Result};

/// 청크 전송 명령 ID
pub const CMD_FILE_SEND: &str = "fsend";

/// 취소 명령 ID
pub const CMD_FILE_CANCEL: &str = "fcancel";

/// 전송 상대
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
}

impl Contact {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// 청크 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkMessage {
    /// 전송 식별자
    pub hash: String,

    /// 청크 위치
    pub pos: Position,

    /// 파일 내 오프셋
    pub offset: u64,

    /// 선언된 데이터 길이
    pub length: usize,

    /// base64 인코딩된 데이터
    pub chunk: String,
}

impl FileChunkMessage {
    /// 청크를 wire 메시지로 인코딩
    pub fn from_fragment(hash: &str, fragment: &FragmentPayload) -> Self {
        Self {
            hash: hash.to_string(),
            pos: fragment.position,
            offset: fragment.offset,
            length: fragment.length,
            chunk: base64::engine::general_purpose::STANDARD.encode(&fragment.data),
        }
    }

    /// 디코딩 후 선언 길이 검증
    pub fn to_fragment(&self) -> Result<FragmentPayload> {
        let data = base64::engine::general_purpose::STANDARD.decode(self.chunk.as_bytes())?;
        FragmentPayload::with_declared_length(self.pos, self.offset, self.length, Bytes::from(data))
    }
}

/// 취소 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCancelMessage {
    pub hash: String,
}

/// 통합 피어 메시지 (cmd 필드로 구분)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum PeerMessage {
    #[serde(rename = "fsend")]
    FileChunk(FileChunkMessage),

    #[serde(rename = "fcancel")]
    FileCancel(FileCancelMessage),
}

impl PeerMessage {
    pub fn cancel(hash: &str) -> Self {
        PeerMessage::FileCancel(FileCancelMessage {
            hash: hash.to_string(),
        })
    }

    /// 명령 ID 반환
    pub fn cmd(&self) -> &'static str {
        match self {
            PeerMessage::FileChunk(_) => CMD_FILE_SEND,
            PeerMessage::FileCancel(_) => CMD_FILE_CANCEL,
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            PeerMessage::FileChunk(m) => &m.hash,
            PeerMessage::FileCancel(m) => &m.hash,
        }
    }

    /// JSON 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// JSON 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// 피어 채널 (외부 연결 계층)
///
/// 연결 수립과 시그널링은 이 크레이트 밖에서 처리하고
/// 엔진은 메시지 전달만 요청한다.
pub trait PeerChannel: Send + Sync + 'static {
    fn send_message(&self, contact: &Contact, message: &PeerMessage) -> Result<()>;
}

impl PeerChannel for mpsc::UnboundedSender<(Contact, PeerMessage)> {
    fn send_message(&self, contact: &Contact, message: &PeerMessage) -> Result<()> {
        self.send((contact.clone(), message.clone()))
            .map_err(|_| Error::Channel(format!("{} 채널 닫힘", contact)))
    }
}
