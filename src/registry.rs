//! 전송 레지스트리
//!
//! hash → TransferState. 단일 스케줄링 컨텍스트에서만 접근하므로 락 없음.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;

use crate::sink::OutputSink;
use crate::transfer::TransferState;
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct TransferRegistry {
    transfers: HashMap<String, TransferState>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 등록, 같은 hash가 있으면 실패
    pub fn register(&mut self, state: TransferState) -> Result<()> {
        match self.transfers.entry(state.hash().to_string()) {
            Entry::Occupied(entry) => Err(Error::DuplicateTransfer {
                hash: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(state);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, hash: &str) -> Result<&TransferState> {
        self.transfers.get(hash).ok_or_else(|| Error::UnknownTransfer {
            hash: hash.to_string(),
        })
    }

    pub fn lookup_mut(&mut self, hash: &str) -> Result<&mut TransferState> {
        self.transfers
            .get_mut(hash)
            .ok_or_else(|| Error::UnknownTransfer {
                hash: hash.to_string(),
            })
    }

    /// 제거 (없어도 무해)
    pub fn remove(&mut self, hash: &str) -> Option<TransferState> {
        self.transfers.remove(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.transfers.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// 진행 중 수신이 이 경로에 기록하고 있는지
    pub fn output_in_use(&self, path: &Path) -> bool {
        self.transfers
            .values()
            .any(|state| state.sink().and_then(OutputSink::path) == Some(path))
    }
}
