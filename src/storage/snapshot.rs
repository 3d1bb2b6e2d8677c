//! 存储快照
//!
//! 快照是存储内容的完整、不透明序列化：
//!
//! ```text
//! +--------+---------+-----------+----------------------------+
//! | magic  | version | crc32     | zstd(json(SnapshotBody))   |
//! | 4 字节 | 1 字节  | 4 字节 LE | 变长                       |
//! +--------+---------+-----------+----------------------------+
//! ```

use super::StoreError;
use crate::model::Entity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAGIC: &[u8; 4] = b"MGSN";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 9;
const ZSTD_LEVEL: i32 = 3;

/// 快照内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBody {
    /// 生成时间（毫秒）
    pub taken_at: i64,

    /// 生成时存储的 generation
    pub generation: u64,

    /// 表名 -> 实体列表
    pub tables: BTreeMap<String, Vec<Entity>>,
}

/// 不透明快照字节
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    bytes: Vec<u8>,
}

impl Snapshot {
    /// 从传输层收到的原始字节构造（解码延迟到 restore 时进行）
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 编码
    pub fn encode(body: &SnapshotBody) -> Result<Self, StoreError> {
        let json = serde_json::to_vec(body).map_err(|e| StoreError::Encode(e.to_string()))?;
        let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
            .map_err(|e| StoreError::Encode(format!("zstd: {}", e)))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&compressed);
        let crc = hasher.finalize();

        let mut bytes = Vec::with_capacity(HEADER_LEN + compressed.len());
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes.extend_from_slice(&compressed);
        Ok(Self { bytes })
    }

    /// 解码并校验
    pub fn decode(&self) -> Result<SnapshotBody, StoreError> {
        if self.bytes.len() < HEADER_LEN {
            return Err(StoreError::Decode(format!(
                "snapshot too short: {} bytes",
                self.bytes.len()
            )));
        }
        if &self.bytes[0..4] != MAGIC {
            return Err(StoreError::Decode("bad snapshot magic".to_string()));
        }
        if self.bytes[4] != FORMAT_VERSION {
            return Err(StoreError::Decode(format!(
                "unsupported snapshot format version {}",
                self.bytes[4]
            )));
        }

        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&self.bytes[5..HEADER_LEN]);
        let expected = u32::from_le_bytes(crc_bytes);
        let payload = &self.bytes[HEADER_LEN..];

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        let actual = hasher.finalize();
        if actual != expected {
            return Err(StoreError::Checksum { expected, actual });
        }

        let json = zstd::decode_all(payload).map_err(|e| StoreError::Decode(format!("zstd: {}", e)))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::Decode(e.to_string()))
    }
}
