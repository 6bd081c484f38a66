use bytes::Bytes;
use postgres_types::Type;

use crate::value::Value;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported type {0}")]
    UnsupportedType(Type),
    #[error("malformed value for type {ty}: {message}")]
    Malformed { ty: Type, message: String },
}

impl CodecError {
    pub fn malformed(ty: &Type, message: impl Into<String>) -> Self {
        Self::Malformed {
            ty: ty.clone(),
            message: message.into(),
        }
    }
}

/// Converts individual column values between wire binary format and native
/// values, keyed by the column type tag. Read-only and process-wide.
pub trait BinaryValueCodec: Send + Sync {
    fn decode(&self, ty: &Type, raw: &[u8]) -> Result<Value, CodecError>;

    fn encode(&self, ty: &Type, value: &Value) -> Result<Bytes, CodecError>;

    fn column_length(&self, value: &Value) -> i32;
}
