//! 청크(fragment) 정의와 송신측 분할기
//!
//! - FragmentPayload: 파일의 고정 위치 조각 (position, offset, length, bytes)
//! - SourceChunker: 원본 바이트 스트림을 고정 크기 조각으로 분할

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result};

/// 청크 위치 (파일 내 인덱스)
pub type Position = u64;

/// 청크 (전송 단위, 생성 후 불변)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPayload {
    /// 파일 내 위치
    pub position: Position,

    /// 파일 내 바이트 오프셋
    pub offset: u64,

    /// 데이터 길이
    pub length: usize,

    /// 실제 데이터
    pub data: Bytes,
}

impl FragmentPayload {
    /// 새 청크 생성 (길이는 데이터에서 계산)
    pub fn new(position: Position, offset: u64, data: Bytes) -> Self {
        Self {
            position,
            offset,
            length: data.len(),
            data,
        }
    }

    /// 선언된 길이를 검증하며 청크 생성
    ///
    /// 수신측에서 wire 메시지의 `length`와 실제 디코딩된 바이트 수가
    /// 다르면 잘라내거나 채우지 않고 에러를 반환한다.
    pub fn with_declared_length(
        position: Position,
        offset: u64,
        declared: usize,
        data: Bytes,
    ) -> Result<Self> {
        if declared != data.len() {
            return Err(Error::LengthMismatch {
                position,
                declared,
                received: data.len(),
            });
        }
        if data.is_empty() {
            return Err(Error::EmptyFragment { position });
        }
        Ok(Self::new(position, offset, data))
    }
}

/// 마지막 청크 위치 계산: ceil(size / fragment_size) - 1
pub fn max_position(size: u64, fragment_size: usize) -> Position {
    let fragment_size = fragment_size.max(1) as u64;
    size.div_ceil(fragment_size).saturating_sub(1)
}

/// 청크 분할기 (송신측)
pub struct SourceChunker {
    fragment_size: usize,
}

impl SourceChunker {
    pub fn new(fragment_size: usize) -> Self {
        Self {
            fragment_size: fragment_size.max(1),
        }
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// 메모리 데이터를 청크 큐로 분할
    pub fn split(&self, data: &[u8]) -> VecDeque<FragmentPayload> {
        data.chunks(self.fragment_size)
            .enumerate()
            .map(|(idx, chunk_data)| {
                FragmentPayload::new(
                    idx as Position,
                    (idx * self.fragment_size) as u64,
                    Bytes::copy_from_slice(chunk_data),
                )
            })
            .collect()
    }

    /// 스트림을 끝까지 읽어 청크 큐로 분할
    ///
    /// `limit` 바이트를 넘겨서는 읽지 않고 한 바이트만 더 읽어
    /// 선언 크기보다 큰 원본을 호출자가 감지할 수 있게 한다.
    /// 반환값: (청크 큐, 읽은 총 바이트)
    pub async fn read_from<R>(&self, reader: R, limit: u64) -> Result<(VecDeque<FragmentPayload>, u64)>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = reader.take(limit.saturating_add(1));
        let mut queue = VecDeque::new();
        let mut offset = 0u64;
        let mut position: Position = 0;

        loop {
            let mut buf = vec![0u8; self.fragment_size];
            let mut filled = 0;

            while filled < buf.len() {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }

            if filled == 0 {
                break;
            }

            buf.truncate(filled);
            queue.push_back(FragmentPayload::new(position, offset, Bytes::from(buf)));
            offset += filled as u64;
            position += 1;

            // 마지막 조각
            if filled < self.fragment_size {
                break;
            }
        }

        Ok((queue, offset))
    }
}
