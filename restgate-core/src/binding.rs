//! HTTP mapping extraction from method options.
//!
//! Standard `prost_types::MethodOptions` drops the `google.api.http`
//! extension (field 72295728) during decoding because prost does not retain
//! unknown fields. The `wire` module declares a minimal descriptor mirror
//! that keeps it, and the reader decodes the raw blob a second time through
//! that mirror to recover the per-method HTTP rules.

use std::collections::HashMap;

use prost::Message;
use tracing::warn;

use crate::error::{GatewayError, Result};

/// Minimal protobuf descriptor types with `google.api.http` support.
pub mod wire {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct FileDescriptorSet {
        #[prost(message, repeated, tag = "1")]
        pub file: Vec<FileDescriptorProto>,
    }

    /// `CodeGeneratorRequest` carries the same descriptors under `proto_file`.
    #[derive(Clone, PartialEq, Message)]
    pub struct CodeGeneratorRequest {
        #[prost(string, repeated, tag = "1")]
        pub file_to_generate: Vec<String>,
        #[prost(message, repeated, tag = "15")]
        pub proto_file: Vec<FileDescriptorProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct FileDescriptorProto {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(string, optional, tag = "2")]
        pub package: Option<String>,
        #[prost(string, repeated, tag = "3")]
        pub dependency: Vec<String>,
        #[prost(message, repeated, tag = "4")]
        pub message_type: Vec<DescriptorProto>,
        #[prost(message, repeated, tag = "5")]
        pub enum_type: Vec<EnumDescriptorProto>,
        #[prost(message, repeated, tag = "6")]
        pub service: Vec<ServiceDescriptorProto>,
        #[prost(string, optional, tag = "12")]
        pub syntax: Option<String>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct DescriptorProto {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(message, repeated, tag = "2")]
        pub field: Vec<FieldDescriptorProto>,
        #[prost(message, repeated, tag = "3")]
        pub nested_type: Vec<DescriptorProto>,
        #[prost(message, repeated, tag = "4")]
        pub enum_type: Vec<EnumDescriptorProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct FieldDescriptorProto {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(int32, optional, tag = "3")]
        pub number: Option<i32>,
        /// 1=optional, 2=required, 3=repeated
        #[prost(int32, optional, tag = "4")]
        pub label: Option<i32>,
        /// Protobuf field type: 3=int64, 5=int32, 8=bool, 9=string, 11=message, 14=enum, ...
        #[prost(int32, optional, tag = "5")]
        pub r#type: Option<i32>,
        /// Fully-qualified type name for message/enum fields.
        #[prost(string, optional, tag = "6")]
        pub type_name: Option<String>,
        #[prost(string, optional, tag = "10")]
        pub json_name: Option<String>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct EnumDescriptorProto {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(message, repeated, tag = "2")]
        pub value: Vec<EnumValueDescriptorProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct EnumValueDescriptorProto {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(int32, optional, tag = "2")]
        pub number: Option<i32>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ServiceDescriptorProto {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(message, repeated, tag = "2")]
        pub method: Vec<MethodDescriptorProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct MethodDescriptorProto {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(string, optional, tag = "2")]
        pub input_type: Option<String>,
        #[prost(string, optional, tag = "3")]
        pub output_type: Option<String>,
        #[prost(message, optional, tag = "4")]
        pub options: Option<MethodOptions>,
        #[prost(bool, optional, tag = "5")]
        pub client_streaming: Option<bool>,
        #[prost(bool, optional, tag = "6")]
        pub server_streaming: Option<bool>,
    }

    /// Method options with the `google.api.http` extension preserved.
    #[derive(Clone, PartialEq, Message)]
    pub struct MethodOptions {
        #[prost(message, optional, tag = "72295728")]
        pub http: Option<HttpRule>,
    }

    /// `google.api.HttpRule` - the REST mapping for one RPC.
    #[derive(Clone, PartialEq, Message)]
    pub struct HttpRule {
        #[prost(string, optional, tag = "1")]
        pub selector: Option<String>,
        #[prost(oneof = "HttpPattern", tags = "2, 3, 4, 5, 6, 8")]
        pub pattern: Option<HttpPattern>,
        #[prost(string, optional, tag = "7")]
        pub body: Option<String>,
        #[prost(message, repeated, tag = "11")]
        pub additional_bindings: Vec<HttpRule>,
    }

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum HttpPattern {
        #[prost(string, tag = "2")]
        Get(String),
        #[prost(string, tag = "3")]
        Put(String),
        #[prost(string, tag = "4")]
        Post(String),
        #[prost(string, tag = "5")]
        Delete(String),
        #[prost(string, tag = "6")]
        Patch(String),
        #[prost(message, tag = "8")]
        Custom(CustomHttpPattern),
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct CustomHttpPattern {
        #[prost(string, optional, tag = "1")]
        pub kind: Option<String>,
        #[prost(string, optional, tag = "2")]
        pub path: Option<String>,
    }
}

// -- Body selector ------------------------------------------------------------

/// Where the request message content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodySelector {
    /// No request body is read; all fields bind from path/query.
    None,
    /// The entire request message is read from the JSON body.
    All,
    /// A single named field is read from the body; the rest from path/query.
    Field(String),
}

impl BodySelector {
    pub fn from_rule(body: &str) -> BodySelector {
        match body {
            "" => BodySelector::None,
            "*" => BodySelector::All,
            field => BodySelector::Field(field.to_string()),
        }
    }
}

// -- URL templates ------------------------------------------------------------

/// One compiled segment of a URL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Variable { name: String, pattern: VarPattern },
}

/// Pattern constraining a path variable segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarPattern {
    /// `{name}` or `{name=*}`: any single segment.
    Single,
    /// `{name=literal}`: exactly that segment.
    Literal(String),
    /// `{name=**}`: any multi-segment suffix, terminal only.
    Greedy,
}

/// A compiled URL template: literal segments and named path variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    raw: String,
    segments: Vec<Segment>,
    greedy: bool,
}

impl UrlTemplate {
    /// Compile a `/`-segmented template.
    ///
    /// Variable names must be unique within one template, and a `**` pattern
    /// must be the terminal segment.
    pub fn compile(template: &str) -> Result<UrlTemplate> {
        let trimmed = template.trim_start_matches('/');
        let mut segments = Vec::new();
        let mut greedy = false;
        let mut names: Vec<String> = Vec::new();

        let parts: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };

        for part in &parts {
            if greedy {
                return Err(GatewayError::Binding(format!(
                    "invalid URL template '{template}': '**' must be the final segment"
                )));
            }
            if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                let (name, pattern) = match inner.split_once('=') {
                    Some((name, "**")) => {
                        greedy = true;
                        (name, VarPattern::Greedy)
                    }
                    Some((name, "*")) => (name, VarPattern::Single),
                    Some((name, lit)) => (name, VarPattern::Literal(lit.to_string())),
                    None => (inner, VarPattern::Single),
                };
                if name.is_empty() {
                    return Err(GatewayError::Binding(format!(
                        "invalid URL template '{template}': empty variable name"
                    )));
                }
                if names.iter().any(|n| n == name) {
                    return Err(GatewayError::Binding(format!(
                        "invalid URL template '{template}': duplicate variable '{name}'"
                    )));
                }
                names.push(name.to_string());
                segments.push(Segment::Variable {
                    name: name.to_string(),
                    pattern,
                });
            } else {
                segments.push(Segment::Literal((*part).to_string()));
            }
        }

        Ok(UrlTemplate {
            raw: template.to_string(),
            segments,
            greedy,
        })
    }

    /// The template string as written in the descriptor.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Leading literal segments, joined back into a path prefix.
    pub fn literal_prefix(&self) -> String {
        let mut prefix = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    prefix.push('/');
                    prefix.push_str(lit);
                }
                Segment::Variable { .. } => break,
            }
        }
        if prefix.is_empty() {
            prefix.push('/');
        }
        prefix
    }

    /// Ordered (variable-name, pattern) pairs.
    pub fn variables(&self) -> impl Iterator<Item = (&str, &VarPattern)> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Variable { name, pattern } => Some((name.as_str(), pattern)),
            Segment::Literal(_) => None,
        })
    }

    /// Whether the template ends in a greedy `**` variable.
    pub fn is_greedy(&self) -> bool {
        self.greedy
    }

    /// Match a request path, returning path-variable bindings on success.
    ///
    /// A greedy terminal variable binds the remaining suffix verbatim,
    /// including `/` separators.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let trimmed = path.trim_start_matches('/');
        let parts: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };

        if self.greedy {
            if parts.len() < self.segments.len() {
                return None;
            }
        } else if parts.len() != self.segments.len() {
            return None;
        }

        let mut bindings = Vec::new();
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(lit) => {
                    if parts[i] != lit {
                        return None;
                    }
                }
                Segment::Variable { name, pattern } => match pattern {
                    VarPattern::Single => {
                        if parts[i].is_empty() {
                            return None;
                        }
                        bindings.push((name.clone(), parts[i].to_string()));
                    }
                    VarPattern::Literal(lit) => {
                        if parts[i] != lit {
                            return None;
                        }
                        bindings.push((name.clone(), parts[i].to_string()));
                    }
                    VarPattern::Greedy => {
                        let suffix = parts[i..].join("/");
                        if suffix.is_empty() {
                            return None;
                        }
                        bindings.push((name.clone(), suffix));
                    }
                },
            }
        }
        Some(bindings)
    }

    /// Canonical key for (verb, template) collision detection: two templates
    /// that would match the same paths produce the same key.
    pub fn pattern_key(&self) -> String {
        let mut key = String::new();
        for segment in &self.segments {
            key.push('/');
            match segment {
                Segment::Literal(lit) => key.push_str(lit),
                Segment::Variable { pattern, .. } => match pattern {
                    VarPattern::Single => key.push_str("{}"),
                    VarPattern::Literal(lit) => key.push_str(lit),
                    VarPattern::Greedy => key.push_str("{**}"),
                },
            }
        }
        if key.is_empty() {
            key.push('/');
        }
        key
    }

    /// The template in OpenAPI path form, e.g. `/v1/items/{id}`.
    pub fn openapi_path(&self) -> String {
        let mut path = String::new();
        for segment in &self.segments {
            path.push('/');
            match segment {
                Segment::Literal(lit) => path.push_str(lit),
                Segment::Variable { name, .. } => {
                    path.push('{');
                    path.push_str(name);
                    path.push('}');
                }
            }
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }
}

// -- Binding extraction -------------------------------------------------------

/// One HTTP mapping for a method: verb, compiled template, body selector.
#[derive(Debug, Clone)]
pub struct HttpBinding {
    pub method: http::Method,
    pub template: UrlTemplate,
    pub body: BodySelector,
}

/// Extract per-method HTTP bindings from a raw descriptor blob, keyed by
/// fully-qualified method name (`pkg.Service.Method`).
///
/// Methods with no `google.api.http` rule contribute nothing. Rules with an
/// invalid template or verb are logged and skipped.
pub fn bindings_from_blob(blob: &[u8]) -> HashMap<String, Vec<HttpBinding>> {
    let files = match decode_wire(blob) {
        Some(files) => files,
        None => {
            warn!("descriptor blob not decodable through the annotation mirror");
            return HashMap::new();
        }
    };

    let mut bindings: HashMap<String, Vec<HttpBinding>> = HashMap::new();
    for file in &files {
        let package = file.package.as_deref().unwrap_or("");
        for service in &file.service {
            let service_name = service.name.as_deref().unwrap_or("");
            let service_fqn = if package.is_empty() {
                service_name.to_string()
            } else {
                format!("{package}.{service_name}")
            };
            for method in &service.method {
                let rule = match method.options.as_ref().and_then(|o| o.http.as_ref()) {
                    Some(rule) => rule,
                    None => continue,
                };
                let key = format!("{service_fqn}.{}", method.name.as_deref().unwrap_or(""));
                let mut out = Vec::new();
                collect_rule(rule, &key, &mut out);
                for nested in &rule.additional_bindings {
                    collect_rule(nested, &key, &mut out);
                }
                if !out.is_empty() {
                    bindings.insert(key, out);
                }
            }
        }
    }
    bindings
}

fn decode_wire(blob: &[u8]) -> Option<Vec<wire::FileDescriptorProto>> {
    match wire::FileDescriptorSet::decode(blob) {
        Ok(set) if !set.file.is_empty() => return Some(set.file),
        Ok(_) => {}
        Err(_) => {}
    }
    match wire::CodeGeneratorRequest::decode(blob) {
        Ok(req) => Some(req.proto_file),
        Err(_) => None,
    }
}

fn collect_rule(rule: &wire::HttpRule, method_fqn: &str, out: &mut Vec<HttpBinding>) {
    let (verb, template) = match &rule.pattern {
        Some(wire::HttpPattern::Get(t)) => ("GET".to_string(), t.clone()),
        Some(wire::HttpPattern::Post(t)) => ("POST".to_string(), t.clone()),
        Some(wire::HttpPattern::Put(t)) => ("PUT".to_string(), t.clone()),
        Some(wire::HttpPattern::Patch(t)) => ("PATCH".to_string(), t.clone()),
        Some(wire::HttpPattern::Delete(t)) => ("DELETE".to_string(), t.clone()),
        Some(wire::HttpPattern::Custom(custom)) => (
            custom.kind.as_deref().unwrap_or("").to_uppercase(),
            custom.path.as_deref().unwrap_or("").to_string(),
        ),
        None => return,
    };

    let method = match http::Method::from_bytes(verb.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            warn!(method = method_fqn, verb = %verb, "skipping rule with invalid verb");
            return;
        }
    };

    let template = match UrlTemplate::compile(&template) {
        Ok(template) => template,
        Err(e) => {
            warn!(method = method_fqn, error = %e, "skipping rule with invalid template");
            return;
        }
    };

    out.push(HttpBinding {
        method,
        template,
        body: BodySelector::from_rule(rule.body.as_deref().unwrap_or("")),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_plain_literals() {
        let t = UrlTemplate::compile("/v1/items").unwrap();
        assert_eq!(t.variables().count(), 0);
        assert!(!t.is_greedy());
        assert_eq!(t.literal_prefix(), "/v1/items");
        assert_eq!(t.matches("/v1/items"), Some(vec![]));
        assert_eq!(t.matches("/v1/items/42"), None);
    }

    #[test]
    fn binds_single_variable() {
        let t = UrlTemplate::compile("/v1/items/{id}").unwrap();
        assert_eq!(
            t.matches("/v1/items/42"),
            Some(vec![("id".to_string(), "42".to_string())])
        );
        assert_eq!(t.matches("/v1/items"), None);
        assert_eq!(t.matches("/v1/items/42/extra"), None);
    }

    #[test]
    fn variable_with_literal_pattern() {
        let t = UrlTemplate::compile("/v1/{kind=books}/{id}").unwrap();
        assert_eq!(
            t.matches("/v1/books/7"),
            Some(vec![
                ("kind".to_string(), "books".to_string()),
                ("id".to_string(), "7".to_string())
            ])
        );
        assert_eq!(t.matches("/v1/toys/7"), None);
    }

    #[test]
    fn greedy_binds_multi_segment_suffix() {
        let t = UrlTemplate::compile("/v1/files/{path=**}").unwrap();
        assert!(t.is_greedy());
        assert_eq!(
            t.matches("/v1/files/a/b/c"),
            Some(vec![("path".to_string(), "a/b/c".to_string())])
        );
        assert_eq!(
            t.matches("/v1/files/single"),
            Some(vec![("path".to_string(), "single".to_string())])
        );
        assert_eq!(t.matches("/v1/files"), None);
    }

    #[test]
    fn greedy_must_be_terminal() {
        let result = UrlTemplate::compile("/v1/{path=**}/tail");
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_variable_rejected() {
        let result = UrlTemplate::compile("/v1/{id}/sub/{id}");
        assert!(result.is_err());
    }

    #[test]
    fn pattern_key_normalizes_variables() {
        let a = UrlTemplate::compile("/v1/items/{id}").unwrap();
        let b = UrlTemplate::compile("/v1/items/{name}").unwrap();
        assert_eq!(a.pattern_key(), b.pattern_key());
        let c = UrlTemplate::compile("/v1/items/fixed").unwrap();
        assert_ne!(a.pattern_key(), c.pattern_key());
    }

    #[test]
    fn openapi_path_uses_brace_form() {
        let t = UrlTemplate::compile("/v1/items/{id=*}/files/{path=**}").unwrap();
        assert_eq!(t.openapi_path(), "/v1/items/{id}/files/{path}");
    }

    #[test]
    fn body_selector_forms() {
        assert_eq!(BodySelector::from_rule(""), BodySelector::None);
        assert_eq!(BodySelector::from_rule("*"), BodySelector::All);
        assert_eq!(
            BodySelector::from_rule("item"),
            BodySelector::Field("item".into())
        );
    }

    fn annotated_blob() -> Vec<u8> {
        use prost::Message as _;
        let file = wire::FileDescriptorProto {
            name: Some("items.proto".into()),
            package: Some("shop.v1".into()),
            service: vec![wire::ServiceDescriptorProto {
                name: Some("Items".into()),
                method: vec![
                    wire::MethodDescriptorProto {
                        name: Some("GetItem".into()),
                        input_type: Some(".shop.v1.GetItemReq".into()),
                        output_type: Some(".shop.v1.Item".into()),
                        options: Some(wire::MethodOptions {
                            http: Some(wire::HttpRule {
                                pattern: Some(wire::HttpPattern::Get(
                                    "/v1/items/{id}".into(),
                                )),
                                additional_bindings: vec![wire::HttpRule {
                                    pattern: Some(wire::HttpPattern::Post(
                                        "/v1/items:get".into(),
                                    )),
                                    body: Some("*".into()),
                                    ..Default::default()
                                }],
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                    wire::MethodDescriptorProto {
                        name: Some("Purge".into()),
                        options: Some(wire::MethodOptions {
                            http: Some(wire::HttpRule {
                                pattern: Some(wire::HttpPattern::Custom(
                                    wire::CustomHttpPattern {
                                        kind: Some("purge".into()),
                                        path: Some("/v1/items".into()),
                                    },
                                )),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                    // No HTTP rule: contributes nothing.
                    wire::MethodDescriptorProto {
                        name: Some("Internal".into()),
                        ..Default::default()
                    },
                ],
            }],
            ..Default::default()
        };
        wire::FileDescriptorSet { file: vec![file] }.encode_to_vec()
    }

    #[test]
    fn extracts_rules_and_additional_bindings() {
        let bindings = bindings_from_blob(&annotated_blob());
        let get_item = &bindings["shop.v1.Items.GetItem"];
        assert_eq!(get_item.len(), 2);
        assert_eq!(get_item[0].method, http::Method::GET);
        assert_eq!(get_item[0].body, BodySelector::None);
        assert_eq!(get_item[1].method, http::Method::POST);
        assert_eq!(get_item[1].body, BodySelector::All);
        assert!(!bindings.contains_key("shop.v1.Items.Internal"));
    }

    #[test]
    fn custom_verb_is_uppercased() {
        let bindings = bindings_from_blob(&annotated_blob());
        let purge = &bindings["shop.v1.Items.Purge"];
        assert_eq!(purge[0].method.as_str(), "PURGE");
    }

    #[test]
    fn empty_blob_yields_no_bindings() {
        assert!(bindings_from_blob(&[]).is_empty());
    }
}
