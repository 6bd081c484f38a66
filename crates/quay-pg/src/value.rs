//! Decoding of wire parameter payloads into native values and the
//! standard-scalar binary value codec.

use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use postgres_types::{FromSql, Type};
use quay_types::{
    codec::{BinaryValueCodec, CodecError},
    value::Value,
};

use crate::sql_state::SqlState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i16)]
pub enum FormatCode {
    Text = 0,
    Binary,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown format code {0}")]
pub struct UnknownFormatCode(pub i16);

impl TryFrom<i16> for FormatCode {
    type Error = UnknownFormatCode;

    fn try_from(code: i16) -> Result<Self, UnknownFormatCode> {
        match code {
            0 => Ok(FormatCode::Text),
            1 => Ok(FormatCode::Binary),
            n => Err(UnknownFormatCode(n)),
        }
    }
}

/// Expands a format-code list to one entry per parameter: no codes means all
/// text, a single code applies to every parameter.
pub fn expand_format_codes(codes: &[FormatCode], len: usize) -> Option<Vec<FormatCode>> {
    match codes.len() {
        0 => Some(vec![FormatCode::Text; len]),
        1 => Some(vec![codes[0]; len]),
        n if n == len => Some(codes.to_vec()),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BindDecodeError {
    #[error(transparent)]
    UnknownFormat(#[from] UnknownFormatCode),
    #[error("parameter format codes do not match parameter count")]
    FormatCount,
    #[error("missing parameter type at index {0}")]
    MissingType(usize),
    #[error("malformed parameter at index {index}: {source}")]
    Parameter { index: usize, source: CodecError },
}

impl BindDecodeError {
    pub fn sql_state(&self) -> SqlState {
        match self {
            BindDecodeError::Parameter { .. } => SqlState::INVALID_PARAMETER_VALUE,
            _ => SqlState::PROTOCOL_VIOLATION,
        }
    }
}

/// Decodes every raw parameter of a Bind frame according to the statement's
/// declared types. Binary payloads go through the binary value codec, text
/// payloads are parsed from their string form.
pub fn decode_bind_parameters(
    codec: &dyn BinaryValueCodec,
    types: &[Type],
    format_codes: &[i16],
    raw: &[Option<Bytes>],
) -> Result<Vec<Value>, BindDecodeError> {
    let formats = format_codes
        .iter()
        .map(|&code| FormatCode::try_from(code))
        .collect::<Result<Vec<_>, _>>()?;
    let formats = expand_format_codes(&formats, raw.len()).ok_or(BindDecodeError::FormatCount)?;

    let mut values = Vec::with_capacity(raw.len());
    for (i, param) in raw.iter().enumerate() {
        let value = match param {
            None => Value::Null,
            Some(bytes) => {
                let ty = types.get(i).ok_or(BindDecodeError::MissingType(i))?;
                let decoded = match formats[i] {
                    FormatCode::Text => decode_text(ty, bytes),
                    FormatCode::Binary => codec.decode(ty, bytes),
                };
                decoded.map_err(|source| BindDecodeError::Parameter { index: i, source })?
            }
        };
        values.push(value);
    }
    Ok(values)
}

fn parse_text<T: FromStr>(ty: &Type, s: &str) -> Result<T, CodecError>
where
    T::Err: std::fmt::Display,
{
    T::from_str(s).map_err(|e| CodecError::malformed(ty, e.to_string()))
}

/// Parses a text-format parameter into a native value.
pub fn decode_text(ty: &Type, raw: &[u8]) -> Result<Value, CodecError> {
    let s = std::str::from_utf8(raw).map_err(|e| CodecError::malformed(ty, e.to_string()))?;
    if *ty == Type::BOOL {
        match s {
            "t" | "true" | "on" | "1" => Ok(Value::Bool(true)),
            "f" | "false" | "off" | "0" => Ok(Value::Bool(false)),
            other => Err(CodecError::malformed(ty, format!("invalid bool: {other}"))),
        }
    } else if *ty == Type::INT2 {
        Ok(Value::Int2(parse_text(ty, s)?))
    } else if *ty == Type::INT4 {
        Ok(Value::Int4(parse_text(ty, s)?))
    } else if *ty == Type::INT8 {
        Ok(Value::Int8(parse_text(ty, s)?))
    } else if *ty == Type::FLOAT4 {
        Ok(Value::Float4(parse_text(ty, s)?))
    } else if *ty == Type::FLOAT8 {
        Ok(Value::Float8(parse_text(ty, s)?))
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
        Ok(Value::Text(s.to_owned()))
    } else if *ty == Type::BYTEA {
        // "\x6869" hex form when present, raw bytes otherwise
        let hex_body = s.strip_prefix("\\x").unwrap_or(s);
        match hex::decode(hex_body) {
            Ok(decoded) => Ok(Value::Bytes(decoded)),
            Err(_) => Ok(Value::Bytes(raw.to_vec())),
        }
    } else {
        Err(CodecError::UnsupportedType(ty.clone()))
    }
}

fn from_sql<'a, T: FromSql<'a>>(ty: &Type, raw: &'a [u8]) -> Result<T, CodecError> {
    T::from_sql(ty, raw).map_err(|e| CodecError::malformed(ty, e.to_string()))
}

/// Binary value codec for the standard scalar types. Read-only and shared by
/// every connection.
pub struct ScalarCodec;

impl BinaryValueCodec for ScalarCodec {
    fn decode(&self, ty: &Type, raw: &[u8]) -> Result<Value, CodecError> {
        if *ty == Type::BOOL {
            Ok(Value::Bool(from_sql(ty, raw)?))
        } else if *ty == Type::INT2 {
            Ok(Value::Int2(from_sql(ty, raw)?))
        } else if *ty == Type::INT4 {
            Ok(Value::Int4(from_sql(ty, raw)?))
        } else if *ty == Type::INT8 {
            Ok(Value::Int8(from_sql(ty, raw)?))
        } else if *ty == Type::FLOAT4 {
            Ok(Value::Float4(from_sql(ty, raw)?))
        } else if *ty == Type::FLOAT8 {
            Ok(Value::Float8(from_sql(ty, raw)?))
        } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
            Ok(Value::Text(from_sql::<String>(ty, raw)?))
        } else if *ty == Type::BYTEA {
            Ok(Value::Bytes(raw.to_vec()))
        } else {
            Err(CodecError::UnsupportedType(ty.clone()))
        }
    }

    fn encode(&self, ty: &Type, value: &Value) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        match value {
            Value::Null => {
                return Err(CodecError::malformed(ty, "null has no binary representation"))
            }
            Value::Bool(v) => buf.put_u8(*v as u8),
            Value::Int2(v) => buf.put_i16(*v),
            Value::Int4(v) => buf.put_i32(*v),
            Value::Int8(v) => buf.put_i64(*v),
            Value::Float4(v) => buf.put_f32(*v),
            Value::Float8(v) => buf.put_f64(*v),
            Value::Text(v) => buf.put_slice(v.as_bytes()),
            Value::Bytes(v) => buf.put_slice(v),
        }
        Ok(buf.freeze())
    }

    fn column_length(&self, value: &Value) -> i32 {
        match value {
            Value::Null => -1,
            Value::Bool(_) => 1,
            Value::Int2(_) => 2,
            Value::Int4(_) | Value::Float4(_) => 4,
            Value::Int8(_) | Value::Float8(_) => 8,
            Value::Text(v) => v.len() as i32,
            Value::Bytes(v) => v.len() as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_round_trip_is_byte_identical() {
        let codec = ScalarCodec;
        let cases: Vec<(Type, Vec<u8>)> = vec![
            (Type::BOOL, vec![1]),
            (Type::INT2, 257i16.to_be_bytes().to_vec()),
            (Type::INT4, (-42i32).to_be_bytes().to_vec()),
            (Type::INT8, i64::MAX.to_be_bytes().to_vec()),
            (Type::FLOAT4, 1.5f32.to_be_bytes().to_vec()),
            (Type::FLOAT8, (-0.25f64).to_be_bytes().to_vec()),
            (Type::TEXT, b"hello world".to_vec()),
            (Type::BYTEA, vec![0, 1, 2, 254, 255]),
        ];
        for (ty, bytes) in cases {
            let value = codec.decode(&ty, &bytes).unwrap();
            let encoded = codec.encode(&ty, &value).unwrap();
            assert_eq!(encoded.as_ref(), bytes.as_slice(), "type {ty}");
        }
    }

    #[test]
    fn column_length_matches_encoded_width() {
        let codec = ScalarCodec;
        assert_eq!(codec.column_length(&Value::Null), -1);
        assert_eq!(codec.column_length(&Value::Int8(9)), 8);
        assert_eq!(codec.column_length(&Value::Text("abc".into())), 3);
    }

    #[test]
    fn format_code_expansion() {
        assert_eq!(
            expand_format_codes(&[], 3),
            Some(vec![FormatCode::Text; 3])
        );
        assert_eq!(
            expand_format_codes(&[FormatCode::Binary], 2),
            Some(vec![FormatCode::Binary; 2])
        );
        assert_eq!(
            expand_format_codes(&[FormatCode::Text, FormatCode::Binary], 2),
            Some(vec![FormatCode::Text, FormatCode::Binary])
        );
        assert_eq!(expand_format_codes(&[FormatCode::Text; 2], 3), None);
    }

    #[test]
    fn text_parameters_parse_by_declared_type() {
        assert_eq!(
            decode_text(&Type::INT8, b"123").unwrap(),
            Value::Int8(123)
        );
        assert_eq!(decode_text(&Type::BOOL, b"t").unwrap(), Value::Bool(true));
        assert_eq!(
            decode_text(&Type::BYTEA, b"\\x6869").unwrap(),
            Value::Bytes(b"hi".to_vec())
        );
        assert!(decode_text(&Type::INT4, b"not a number").is_err());
    }

    #[test]
    fn null_parameters_skip_decoding() {
        let codec = ScalarCodec;
        let values = decode_bind_parameters(
            &codec,
            &[Type::INT8],
            &[1],
            &[None],
        )
        .unwrap();
        assert_eq!(values, vec![Value::Null]);
    }

    #[test]
    fn malformed_binary_parameter_reports_its_index() {
        let codec = ScalarCodec;
        let err = decode_bind_parameters(
            &codec,
            &[Type::INT8, Type::INT8],
            &[1],
            &[
                Some(Bytes::copy_from_slice(&1i64.to_be_bytes())),
                Some(Bytes::from_static(&[1, 2])),
            ],
        )
        .unwrap_err();
        match err {
            BindDecodeError::Parameter { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            decode_bind_parameters(&codec, &[Type::INT8], &[2], &[None])
                .unwrap_err()
                .sql_state(),
            SqlState::PROTOCOL_VIOLATION
        );
    }
}
