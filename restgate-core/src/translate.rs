//! Schema-directed translation between HTTP inputs and protobuf messages.
//!
//! Decoding binds three input sources into a dynamic message in order:
//! JSON body (per the route's body selector), then path variables, then any
//! query parameters not already bound. Encoding produces canonical protobuf
//! JSON (lowerCamelCase names, enums symbolic, 64-bit integers as strings,
//! defaults omitted).

use std::collections::HashSet;

use base64::Engine as _;
use prost_reflect::{
    Cardinality, DeserializeOptions, DynamicMessage, FieldDescriptor, Kind, MessageDescriptor,
    SerializeOptions, Value,
};

use crate::binding::BodySelector;
use crate::error::{GatewayError, Result};

/// Inputs gathered from one HTTP request.
#[derive(Debug, Default)]
pub struct RequestInput<'a> {
    pub path_vars: &'a [(String, String)],
    pub query: &'a [(String, String)],
    pub body: &'a [u8],
}

/// Build the request message for a route from path/query/body inputs.
pub fn decode_request(
    desc: &MessageDescriptor,
    selector: &BodySelector,
    input: &RequestInput<'_>,
) -> Result<DynamicMessage> {
    let mut bound: HashSet<u32> = HashSet::new();

    let mut msg = match selector {
        BodySelector::All if !input.body.is_empty() => {
            let value = parse_body(input.body)?;
            if !value.is_object() {
                return Err(GatewayError::Binding(
                    "request body must be a JSON object".into(),
                ));
            }
            if let Some(object) = value.as_object() {
                for key in object.keys() {
                    if let Some(field) = field_by_key(desc, key) {
                        bound.insert(field.number());
                    }
                }
            }
            deserialize_body(desc, value)?
        }
        BodySelector::Field(name) if !input.body.is_empty() => {
            let field = field_by_key(desc, name).ok_or_else(|| {
                GatewayError::Binding(format!("body selector names unknown field '{name}'"))
            })?;
            let value = parse_body(input.body)?;
            bound.insert(field.number());
            let wrapped = serde_json::Value::Object(
                [(field.name().to_string(), value)].into_iter().collect(),
            );
            deserialize_body(desc, wrapped)?
        }
        _ => DynamicMessage::new(desc.clone()),
    };

    for (name, raw) in input.path_vars {
        let field = field_by_key(desc, name).ok_or_else(|| {
            GatewayError::Binding(format!("path variable '{name}' has no matching field"))
        })?;
        let value = if field.is_list() {
            Value::List(vec![coerce_scalar(&field, raw)?])
        } else {
            coerce_scalar(&field, raw)?
        };
        msg.set_field(&field, value);
        bound.insert(field.number());
    }

    apply_query(desc, &mut msg, input.query, &bound)?;

    for field in desc.fields() {
        if field.cardinality() == Cardinality::Required && !msg.has_field(&field) {
            return Err(GatewayError::Binding(format!(
                "required field '{}' is unset",
                field.name()
            )));
        }
    }

    Ok(msg)
}

/// Encode a reply message as canonical protobuf JSON.
pub fn encode_response(msg: &DynamicMessage) -> Result<serde_json::Value> {
    let options = SerializeOptions::new()
        .skip_default_fields(true)
        .stringify_64_bit_integers(true);
    msg.serialize_with_options(serde_json::value::Serializer, &options)
        .map_err(|e| GatewayError::Other(format!("failed to encode response: {e}").into()))
}

fn parse_body(body: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::Binding(format!("invalid JSON body: {e}")))
}

fn deserialize_body(desc: &MessageDescriptor, value: serde_json::Value) -> Result<DynamicMessage> {
    // Unknown keys are tolerated; the backend never sees them.
    let options = DeserializeOptions::new().deny_unknown_fields(false);
    DynamicMessage::deserialize_with_options(desc.clone(), value, &options)
        .map_err(|e| GatewayError::Binding(format!("body does not match request schema: {e}")))
}

/// Query parameters bind any field not already covered by body or path.
/// Repeated fields accumulate `?k=a&k=b`; scalars take the last value.
fn apply_query(
    desc: &MessageDescriptor,
    msg: &mut DynamicMessage,
    query: &[(String, String)],
    bound: &HashSet<u32>,
) -> Result<()> {
    let mut grouped: Vec<(&str, Vec<&str>)> = Vec::new();
    for (key, value) in query {
        match grouped.iter_mut().find(|(k, _)| *k == key.as_str()) {
            Some((_, values)) => values.push(value.as_str()),
            None => grouped.push((key.as_str(), vec![value.as_str()])),
        }
    }

    for (key, values) in grouped {
        let field = match field_by_key(desc, key) {
            Some(field) => field,
            // Lenient: unknown parameters are ignored.
            None => continue,
        };
        if bound.contains(&field.number()) {
            continue;
        }
        if field.is_list() {
            let items = values
                .iter()
                .map(|v| coerce_scalar(&field, v))
                .collect::<Result<Vec<_>>>()?;
            msg.set_field(&field, Value::List(items));
        } else {
            let last = values.last().expect("grouped entry is non-empty");
            let value = coerce_scalar(&field, last)?;
            msg.set_field(&field, value);
        }
    }
    Ok(())
}

fn field_by_key(desc: &MessageDescriptor, key: &str) -> Option<FieldDescriptor> {
    desc.get_field_by_name(key)
        .or_else(|| desc.fields().find(|f| f.json_name() == key))
}

/// Convert one string-typed input (path variable or query parameter) to the
/// field's scalar value.
fn coerce_scalar(field: &FieldDescriptor, raw: &str) -> Result<Value> {
    let fail = |expected: &str| {
        GatewayError::Binding(format!(
            "field '{}' expects {expected}, got '{raw}'",
            field.name()
        ))
    };

    match field.kind() {
        Kind::String => Ok(Value::String(raw.to_string())),
        Kind::Bool => match raw {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(fail("a boolean")),
        },
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => raw
            .parse::<i32>()
            .map(Value::I32)
            .map_err(|_| fail("a 32-bit integer")),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => raw
            .parse::<i64>()
            .map(Value::I64)
            .map_err(|_| fail("a 64-bit integer")),
        Kind::Uint32 | Kind::Fixed32 => raw
            .parse::<u32>()
            .map(Value::U32)
            .map_err(|_| fail("an unsigned 32-bit integer")),
        Kind::Uint64 | Kind::Fixed64 => raw
            .parse::<u64>()
            .map(Value::U64)
            .map_err(|_| fail("an unsigned 64-bit integer")),
        Kind::Float => raw
            .parse::<f32>()
            .map(Value::F32)
            .map_err(|_| fail("a number")),
        Kind::Double => raw
            .parse::<f64>()
            .map(Value::F64)
            .map_err(|_| fail("a number")),
        Kind::Bytes => base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map(|b| Value::Bytes(b.into()))
            .map_err(|_| fail("base64 data")),
        Kind::Enum(en) => {
            if let Ok(number) = raw.parse::<i32>() {
                if en.values().any(|v| v.number() == number) {
                    return Ok(Value::EnumNumber(number));
                }
                return Err(fail("a known enum value"));
            }
            en.values()
                .find(|v| v.name() == raw)
                .map(|v| Value::EnumNumber(v.number()))
                .ok_or_else(|| fail("a known enum value"))
        }
        Kind::Message(_) => Err(fail("a scalar value")),
    }
}
