//! Message schemas built at runtime from catalog command definitions.
//!
//! Each declared parameter becomes one field, numbered from 1 in declaration
//! order, whose wire encoding follows its logical type. Values are written
//! with the scalar codecs in `prost::encoding`, so the body is an ordinary
//! protobuf message that any peer holding the same parameter list can parse.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Buf;
use prost::encoding::{self, DecodeContext, WireType};
use telemetry_common::error::EncodeFailure;
use telemetry_common::model::{DeviceCommand, ParameterValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalType {
    Bool,
    Bytes,
    Double,
    Fixed32,
    Fixed64,
    Float,
    Int32,
    Int64,
    SFixed32,
    SFixed64,
    SInt32,
    SInt64,
    String,
    UInt32,
    UInt64,
}

impl LogicalType {
    /// Case-insensitive; `None` for names with no wire mapping.
    pub fn parse(name: &str) -> Option<LogicalType> {
        let parsed = match name.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => LogicalType::Bool,
            "bytes" => LogicalType::Bytes,
            "double" => LogicalType::Double,
            "fixed32" => LogicalType::Fixed32,
            "fixed64" => LogicalType::Fixed64,
            "float" => LogicalType::Float,
            "int32" => LogicalType::Int32,
            "int64" => LogicalType::Int64,
            "sfixed32" => LogicalType::SFixed32,
            "sfixed64" => LogicalType::SFixed64,
            "sint32" => LogicalType::SInt32,
            "sint64" => LogicalType::SInt64,
            "string" => LogicalType::String,
            "uint32" => LogicalType::UInt32,
            "uint64" => LogicalType::UInt64,
            _ => return None,
        };
        Some(parsed)
    }

    pub fn wire_type(self) -> WireType {
        match self {
            LogicalType::Bool
            | LogicalType::Int32
            | LogicalType::Int64
            | LogicalType::SInt32
            | LogicalType::SInt64
            | LogicalType::UInt32
            | LogicalType::UInt64 => WireType::Varint,
            LogicalType::Double | LogicalType::Fixed64 | LogicalType::SFixed64 => {
                WireType::SixtyFourBit
            }
            LogicalType::Float | LogicalType::Fixed32 | LogicalType::SFixed32 => {
                WireType::ThirtyTwoBit
            }
            LogicalType::Bytes | LogicalType::String => WireType::LengthDelimited,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogicalType::Bool => "bool",
            LogicalType::Bytes => "bytes",
            LogicalType::Double => "double",
            LogicalType::Fixed32 => "fixed32",
            LogicalType::Fixed64 => "fixed64",
            LogicalType::Float => "float",
            LogicalType::Int32 => "int32",
            LogicalType::Int64 => "int64",
            LogicalType::SFixed32 => "sfixed32",
            LogicalType::SFixed64 => "sfixed64",
            LogicalType::SInt32 => "sint32",
            LogicalType::SInt64 => "sint64",
            LogicalType::String => "string",
            LogicalType::UInt32 => "uint32",
            LogicalType::UInt64 => "uint64",
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub number: u32,
    pub logical_type: LogicalType,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicSchema {
    command: String,
    fields: Vec<FieldSpec>,
}

impl DynamicSchema {
    /// Fails on the first parameter whose type has no wire mapping.
    pub fn build(command: &DeviceCommand) -> Result<Self, EncodeFailure> {
        let fields = command
            .parameters
            .iter()
            .enumerate()
            .map(|(index, parameter)| {
                let logical_type = LogicalType::parse(&parameter.type_name).ok_or_else(|| {
                    EncodeFailure::UnmappedType {
                        parameter: parameter.name.clone(),
                        type_name: parameter.type_name.clone(),
                    }
                })?;
                Ok(FieldSpec {
                    name: parameter.name.clone(),
                    number: index as u32 + 1,
                    logical_type,
                    required: parameter.required,
                })
            })
            .collect::<Result<Vec<_>, EncodeFailure>>()?;

        Ok(Self {
            command: command.name.clone(),
            fields,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Writes every supplied value in field-number order. Absent optional
    /// parameters are skipped.
    pub fn encode_body(
        &self,
        values: &BTreeMap<String, ParameterValue>,
        buf: &mut Vec<u8>,
    ) -> Result<(), EncodeFailure> {
        if let Some(undeclared) = values.keys().find(|name| self.field(name).is_none()) {
            return Err(EncodeFailure::UndeclaredParameter {
                parameter: undeclared.clone(),
            });
        }

        for field in &self.fields {
            match values.get(&field.name) {
                Some(value) => write_value(field, value, buf)?,
                None if field.required => {
                    return Err(EncodeFailure::MissingParameter {
                        parameter: field.name.clone(),
                    })
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Parses a body written by [`DynamicSchema::encode_body`]. Unknown field
    /// numbers are skipped.
    pub fn decode_body(
        &self,
        mut buf: &[u8],
    ) -> Result<BTreeMap<String, ParameterValue>, EncodeFailure> {
        let mut values = BTreeMap::new();
        while buf.has_remaining() {
            let (tag, wire_type) = encoding::decode_key(&mut buf).map_err(malformed)?;
            match self.fields.iter().find(|f| f.number == tag) {
                Some(field) => {
                    if field.logical_type.wire_type() != wire_type {
                        return Err(EncodeFailure::Malformed(format!(
                            "field {} has wire type {:?}, expected {:?}",
                            field.name,
                            wire_type,
                            field.logical_type.wire_type()
                        )));
                    }
                    let value = read_value(field, wire_type, &mut buf)?;
                    values.insert(field.name.clone(), value);
                }
                None => {
                    encoding::skip_field(wire_type, tag, &mut buf, DecodeContext::default())
                        .map_err(malformed)?;
                }
            }
        }
        Ok(values)
    }
}

fn malformed(e: prost::DecodeError) -> EncodeFailure {
    EncodeFailure::Malformed(e.to_string())
}

fn mistyped(field: &FieldSpec, value: &ParameterValue) -> EncodeFailure {
    EncodeFailure::MistypedValue {
        parameter: field.name.clone(),
        expected: field.logical_type.to_string(),
        actual: value.kind().to_string(),
    }
}

fn int_in_range<T>(field: &FieldSpec, value: &ParameterValue) -> Result<T, EncodeFailure>
where
    T: TryFrom<i64> + TryFrom<u64>,
{
    let converted = match value {
        ParameterValue::Int(i) => <T as TryFrom<i64>>::try_from(*i).ok(),
        ParameterValue::UInt(u) => <T as TryFrom<u64>>::try_from(*u).ok(),
        other => return Err(mistyped(field, other)),
    };
    converted.ok_or_else(|| EncodeFailure::MistypedValue {
        parameter: field.name.clone(),
        expected: field.logical_type.to_string(),
        actual: format!("out of range value {}", display_int(value)),
    })
}

fn display_int(value: &ParameterValue) -> String {
    match value {
        ParameterValue::Int(i) => i.to_string(),
        ParameterValue::UInt(u) => u.to_string(),
        other => other.kind().to_string(),
    }
}

fn float_value(field: &FieldSpec, value: &ParameterValue) -> Result<f64, EncodeFailure> {
    match value {
        ParameterValue::Float(f) => Ok(*f),
        // JSON numbers without a fraction arrive as integers
        ParameterValue::Int(i) => Ok(*i as f64),
        ParameterValue::UInt(u) => Ok(*u as f64),
        other => Err(mistyped(field, other)),
    }
}

fn write_value(
    field: &FieldSpec,
    value: &ParameterValue,
    buf: &mut Vec<u8>,
) -> Result<(), EncodeFailure> {
    let tag = field.number;
    match field.logical_type {
        LogicalType::Bool => match value {
            ParameterValue::Bool(b) => encoding::bool::encode(tag, b, buf),
            other => return Err(mistyped(field, other)),
        },
        LogicalType::String => match value {
            ParameterValue::Text(s) => encoding::string::encode(tag, s, buf),
            other => return Err(mistyped(field, other)),
        },
        LogicalType::Bytes => match value {
            ParameterValue::Bytes(b) => encoding::bytes::encode(tag, b, buf),
            other => return Err(mistyped(field, other)),
        },
        LogicalType::Double => encoding::double::encode(tag, &float_value(field, value)?, buf),
        LogicalType::Float => {
            let f = float_value(field, value)?;
            if f.is_finite() && (f < f32::MIN as f64 || f > f32::MAX as f64) {
                return Err(EncodeFailure::MistypedValue {
                    parameter: field.name.clone(),
                    expected: field.logical_type.to_string(),
                    actual: format!("out of range value {f}"),
                });
            }
            encoding::float::encode(tag, &(f as f32), buf)
        }
        LogicalType::Int32 => {
            let v = int_in_range::<i32>(field, value)?;
            encoding::int32::encode(tag, &v, buf)
        }
        LogicalType::SInt32 => {
            let v = int_in_range::<i32>(field, value)?;
            encoding::sint32::encode(tag, &v, buf)
        }
        LogicalType::SFixed32 => {
            let v = int_in_range::<i32>(field, value)?;
            encoding::sfixed32::encode(tag, &v, buf)
        }
        LogicalType::Int64 => {
            let v = int_in_range::<i64>(field, value)?;
            encoding::int64::encode(tag, &v, buf)
        }
        LogicalType::SInt64 => {
            let v = int_in_range::<i64>(field, value)?;
            encoding::sint64::encode(tag, &v, buf)
        }
        LogicalType::SFixed64 => {
            let v = int_in_range::<i64>(field, value)?;
            encoding::sfixed64::encode(tag, &v, buf)
        }
        LogicalType::UInt32 => {
            let v = int_in_range::<u32>(field, value)?;
            encoding::uint32::encode(tag, &v, buf)
        }
        LogicalType::Fixed32 => {
            let v = int_in_range::<u32>(field, value)?;
            encoding::fixed32::encode(tag, &v, buf)
        }
        LogicalType::UInt64 => {
            let v = int_in_range::<u64>(field, value)?;
            encoding::uint64::encode(tag, &v, buf)
        }
        LogicalType::Fixed64 => {
            let v = int_in_range::<u64>(field, value)?;
            encoding::fixed64::encode(tag, &v, buf)
        }
    }
    Ok(())
}

fn read_value(
    field: &FieldSpec,
    wire_type: WireType,
    buf: &mut &[u8],
) -> Result<ParameterValue, EncodeFailure> {
    let ctx = DecodeContext::default();
    let value = match field.logical_type {
        LogicalType::Bool => {
            let mut v = false;
            encoding::bool::merge(wire_type, &mut v, buf, ctx).map_err(malformed)?;
            ParameterValue::Bool(v)
        }
        LogicalType::String => {
            let mut v = String::new();
            encoding::string::merge(wire_type, &mut v, buf, ctx).map_err(malformed)?;
            ParameterValue::Text(v)
        }
        LogicalType::Bytes => {
            let mut v: Vec<u8> = Vec::new();
            encoding::bytes::merge(wire_type, &mut v, buf, ctx).map_err(malformed)?;
            ParameterValue::Bytes(v)
        }
        LogicalType::Double => {
            let mut v = 0f64;
            encoding::double::merge(wire_type, &mut v, buf, ctx).map_err(malformed)?;
            ParameterValue::Float(v)
        }
        LogicalType::Float => {
            let mut v = 0f32;
            encoding::float::merge(wire_type, &mut v, buf, ctx).map_err(malformed)?;
            ParameterValue::Float(f64::from(v))
        }
        LogicalType::Int32 | LogicalType::SInt32 | LogicalType::SFixed32 => {
            let mut v = 0i32;
            match field.logical_type {
                LogicalType::Int32 => encoding::int32::merge(wire_type, &mut v, buf, ctx),
                LogicalType::SInt32 => encoding::sint32::merge(wire_type, &mut v, buf, ctx),
                _ => encoding::sfixed32::merge(wire_type, &mut v, buf, ctx),
            }
            .map_err(malformed)?;
            ParameterValue::Int(i64::from(v))
        }
        LogicalType::Int64 | LogicalType::SInt64 | LogicalType::SFixed64 => {
            let mut v = 0i64;
            match field.logical_type {
                LogicalType::Int64 => encoding::int64::merge(wire_type, &mut v, buf, ctx),
                LogicalType::SInt64 => encoding::sint64::merge(wire_type, &mut v, buf, ctx),
                _ => encoding::sfixed64::merge(wire_type, &mut v, buf, ctx),
            }
            .map_err(malformed)?;
            ParameterValue::Int(v)
        }
        LogicalType::UInt32 | LogicalType::Fixed32 => {
            let mut v = 0u32;
            match field.logical_type {
                LogicalType::UInt32 => encoding::uint32::merge(wire_type, &mut v, buf, ctx),
                _ => encoding::fixed32::merge(wire_type, &mut v, buf, ctx),
            }
            .map_err(malformed)?;
            ParameterValue::Int(i64::from(v))
        }
        LogicalType::UInt64 | LogicalType::Fixed64 => {
            let mut v = 0u64;
            match field.logical_type {
                LogicalType::UInt64 => encoding::uint64::merge(wire_type, &mut v, buf, ctx),
                _ => encoding::fixed64::merge(wire_type, &mut v, buf, ctx),
            }
            .map_err(malformed)?;
            ParameterValue::from(v)
        }
    };
    Ok(value)
}
