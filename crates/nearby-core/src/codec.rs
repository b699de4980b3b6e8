//! 负载编解码
//!
//! 快照以 camelCase JSON 传输，与 Android 端的字段命名一致。
//! 没有版本字段：解码对缺失字段宽容（回退为默认值），对未知字段忽略。

use log::trace;

use crate::error::DecodeError;
use crate::snapshot::UserSnapshot;

/// 单次负载的默认上限，与平台 BYTES 负载上限一致
pub const MAX_PAYLOAD_BYTES: usize = 32 * 1024;

/// 编码快照
pub fn encode(snapshot: &UserSnapshot) -> Result<Vec<u8>, serde_json::Error> {
    let bytes = serde_json::to_vec(snapshot)?;
    trace!("Encoded snapshot for '{}': {} bytes", snapshot.user_id, bytes.len());
    Ok(bytes)
}

/// 解码快照，使用默认上限
pub fn decode(bytes: &[u8]) -> Result<UserSnapshot, DecodeError> {
    decode_with_limit(bytes, MAX_PAYLOAD_BYTES)
}

/// 解码快照
///
/// 只有结构上不合法（不是 JSON 对象、字段类型错误、负数）或超过上限时才返回错误。
pub fn decode_with_limit(bytes: &[u8], max: usize) -> Result<UserSnapshot, DecodeError> {
    if bytes.len() > max {
        return Err(DecodeError::TooLarge {
            size: bytes.len(),
            max,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}
