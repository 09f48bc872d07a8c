//! OpenAPI (Swagger 2.0) document generation from the synthesized routes.
//!
//! Paths group routes by URL template; schema definitions cover every
//! message and enum transitively reachable from a route's input or output.
//! Descriptions come from the catalog's folded proto comments.

use std::collections::{BTreeMap, HashMap, HashSet};

use prost_reflect::{EnumDescriptor, FieldDescriptor, Kind, MessageDescriptor};
use serde_json::{json, Map, Value};

use crate::binding::BodySelector;
use crate::catalog::Catalog;
use crate::routes::{Route, RouteTable};

/// The document served before the first schema fetch completes.
pub fn empty_document() -> Value {
    json!({
        "swagger": "2.0",
        "info": { "title": "restgate", "version": "1.0" },
        "consumes": ["application/json"],
        "produces": ["application/json"],
        "paths": {},
        "definitions": {},
    })
}

/// Generate the Swagger document for the current catalog and route table.
pub fn document(catalog: &Catalog, table: &RouteTable) -> Value {
    let mut paths: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    let mut operation_ids: HashMap<String, usize> = HashMap::new();

    for route in table.routes() {
        let path = route.template.openapi_path();
        let verb = route.method.as_str().to_lowercase();
        let operation = operation_for(route, catalog, &mut operation_ids);
        paths.entry(path).or_default().insert(verb, operation);
    }

    let definitions = definitions_for(catalog, table);

    let paths: Map<String, Value> = paths
        .into_iter()
        .map(|(path, verbs)| (path, Value::Object(verbs)))
        .collect();

    json!({
        "swagger": "2.0",
        "info": { "title": "restgate", "version": "1.0" },
        "consumes": ["application/json"],
        "produces": ["application/json"],
        "paths": paths,
        "definitions": definitions,
    })
}

fn operation_for(
    route: &Route,
    catalog: &Catalog,
    operation_ids: &mut HashMap<String, usize>,
) -> Value {
    let base_id = format!("{}_{}", route.service, route.rpc);
    let count = operation_ids.entry(base_id.clone()).or_insert(0);
    *count += 1;
    let operation_id = if *count == 1 {
        base_id
    } else {
        format!("{base_id}{count}")
    };

    let mut parameters = Vec::new();
    let mut path_bound: HashSet<String> = HashSet::new();

    for (name, _) in route.template.variables() {
        path_bound.insert(name.to_string());
        let field = route.input.get_field_by_name(name);
        parameters.push(json!({
            "name": name,
            "in": "path",
            "required": true,
            "type": field.as_ref().map_or("string", param_type),
        }));
    }

    match &route.body {
        BodySelector::All => {
            parameters.push(json!({
                "name": "body",
                "in": "body",
                "required": true,
                "schema": { "$ref": definition_ref(route.input.full_name()) },
            }));
        }
        BodySelector::Field(name) => {
            if let Some(field) = route.input.get_field_by_name(name) {
                parameters.push(json!({
                    "name": name,
                    "in": "body",
                    "required": true,
                    "schema": field_schema(&field, catalog),
                }));
            }
        }
        BodySelector::None => {}
    }

    // Remaining scalar fields are reachable through the query string.
    if route.body != BodySelector::All {
        for field in route.input.fields() {
            if path_bound.contains(field.name()) {
                continue;
            }
            if matches!(route.body, BodySelector::Field(ref f) if f == field.name()) {
                continue;
            }
            if matches!(field.kind(), Kind::Message(_)) {
                continue;
            }
            let mut param = Map::new();
            param.insert("name".into(), json!(field.json_name()));
            param.insert("in".into(), json!("query"));
            param.insert("required".into(), json!(false));
            if field.is_list() {
                param.insert("type".into(), json!("array"));
                param.insert("items".into(), json!({ "type": param_type(&field) }));
                param.insert("collectionFormat".into(), json!("multi"));
            } else {
                param.insert("type".into(), json!(param_type(&field)));
            }
            parameters.push(Value::Object(param));
        }
    }

    let mut operation = Map::new();
    operation.insert("operationId".into(), json!(operation_id));
    operation.insert("tags".into(), json!([route.service]));
    if let Some(ref description) = route.description {
        operation.insert("summary".into(), json!(description));
    }
    if !parameters.is_empty() {
        operation.insert("parameters".into(), Value::Array(parameters));
    }
    operation.insert(
        "responses".into(),
        json!({
            "200": {
                "description": "A successful response.",
                "schema": { "$ref": definition_ref(route.output.full_name()) },
            }
        }),
    );
    Value::Object(operation)
}

/// Schema definitions for every reachable message and enum.
fn definitions_for(catalog: &Catalog, table: &RouteTable) -> Map<String, Value> {
    let mut pending: Vec<MessageDescriptor> = Vec::new();
    for route in table.routes() {
        pending.push(route.input.clone());
        pending.push(route.output.clone());
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut enums: BTreeMap<String, EnumDescriptor> = BTreeMap::new();
    let mut definitions: BTreeMap<String, Value> = BTreeMap::new();

    while let Some(desc) = pending.pop() {
        if !visited.insert(desc.full_name().to_string()) {
            continue;
        }
        for field in desc.fields() {
            match field.kind() {
                Kind::Message(sub) => {
                    if field.is_map() {
                        // Map entries are synthetic; chase only the value type.
                        if let Some(value_field) = sub.get_field(2) {
                            match value_field.kind() {
                                Kind::Message(value_desc) => pending.push(value_desc),
                                Kind::Enum(en) => {
                                    enums.insert(en.full_name().to_string(), en);
                                }
                                _ => {}
                            }
                        }
                    } else {
                        pending.push(sub);
                    }
                }
                Kind::Enum(en) => {
                    enums.insert(en.full_name().to_string(), en);
                }
                _ => {}
            }
        }
        definitions.insert(
            desc.full_name().to_string(),
            message_schema(&desc, catalog),
        );
    }

    for (name, en) in enums {
        let values: Vec<String> = en.values().map(|v| v.name().to_string()).collect();
        let mut schema = Map::new();
        schema.insert("type".into(), json!("string"));
        schema.insert("enum".into(), json!(values));
        if let Some(description) = catalog.description(&name) {
            schema.insert("description".into(), json!(description));
        }
        definitions.insert(name, Value::Object(schema));
    }

    definitions.into_iter().collect()
}

fn message_schema(desc: &MessageDescriptor, catalog: &Catalog) -> Value {
    let mut properties = Map::new();
    for field in desc.fields() {
        properties.insert(field.json_name().to_string(), field_schema(&field, catalog));
    }

    let mut schema = Map::new();
    schema.insert("type".into(), json!("object"));
    if let Some(description) = catalog.description(desc.full_name()) {
        schema.insert("description".into(), json!(description));
    }
    if !properties.is_empty() {
        schema.insert("properties".into(), Value::Object(properties));
    }
    Value::Object(schema)
}

fn field_schema(field: &FieldDescriptor, catalog: &Catalog) -> Value {
    let parent = field.parent_message();
    let description_key = format!("{}.{}", parent.full_name(), field.name());

    let base = if field.is_map() {
        let value_schema = field
            .kind()
            .as_message()
            .and_then(|entry| entry.get_field(2))
            .map(|value_field| scalar_or_ref(&value_field))
            .unwrap_or_else(|| json!({ "type": "string" }));
        json!({ "type": "object", "additionalProperties": value_schema })
    } else if field.is_list() {
        json!({ "type": "array", "items": scalar_or_ref(field) })
    } else {
        scalar_or_ref(field)
    };

    match catalog.description(&description_key) {
        Some(description) => {
            let mut schema = base.as_object().cloned().unwrap_or_default();
            schema.insert("description".into(), json!(description));
            Value::Object(schema)
        }
        None => base,
    }
}

fn scalar_or_ref(field: &FieldDescriptor) -> Value {
    match field.kind() {
        Kind::Message(desc) => json!({ "$ref": definition_ref(desc.full_name()) }),
        Kind::Enum(en) => json!({ "$ref": definition_ref(en.full_name()) }),
        Kind::Double | Kind::Float => json!({ "type": "number" }),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            json!({ "type": "integer", "format": "int32" })
        }
        Kind::Uint32 | Kind::Fixed32 => json!({ "type": "integer", "format": "int64" }),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            json!({ "type": "string", "format": "int64" })
        }
        Kind::Uint64 | Kind::Fixed64 => json!({ "type": "string", "format": "uint64" }),
        Kind::Bool => json!({ "type": "boolean" }),
        Kind::Bytes => json!({ "type": "string", "format": "byte" }),
        Kind::String => json!({ "type": "string" }),
    }
}

/// Swagger primitive type for a path/query parameter.
fn param_type(field: &FieldDescriptor) -> &'static str {
    match field.kind() {
        Kind::Double | Kind::Float => "number",
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 | Kind::Uint32 | Kind::Fixed32 => "integer",
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 | Kind::Uint64 | Kind::Fixed64 => "string",
        Kind::Bool => "boolean",
        _ => "string",
    }
}

fn definition_ref(full_name: &str) -> String {
    format!("#/definitions/{full_name}")
}
