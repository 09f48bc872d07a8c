use std::collections::{BTreeMap, HashMap, HashSet};

use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::{DescriptorProto, FileDescriptorProto, FileDescriptorSet};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

// FieldDescriptorProto.Type values used while sanitizing references.
const TYPE_GROUP: i32 = 10;
const TYPE_MESSAGE: i32 = 11;
const TYPE_BYTES: i32 = 12;
const TYPE_ENUM: i32 = 14;

/// Options controlling catalog construction.
#[derive(Debug, Clone)]
pub struct CatalogOptions {
    /// Fold `source_code_info` comments into per-symbol descriptions and
    /// drop the raw comment tree from the stored descriptors.
    pub fold_comments: bool,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        CatalogOptions {
            fold_comments: true,
        }
    }
}

/// One descriptor file indexed by the catalog.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Proto file name (e.g. `voltha/adapter.proto`).
    pub file_name: String,
    /// Dotted package name; the catalog key.
    pub package: String,
    /// The descriptor itself, with `source_code_info` stripped after folding.
    pub proto: FileDescriptorProto,
}

/// A navigable, comment-annotated schema catalog built from a descriptor blob.
///
/// The catalog holds the raw file descriptors keyed by package (later files
/// sharing a package overwrite earlier ones), a [`DescriptorPool`] for dynamic
/// message construction, and a description table keyed by fully-qualified
/// symbol name (`pkg.Msg`, `pkg.Msg.field`, `pkg.Svc.Method`, ...).
pub struct Catalog {
    pool: DescriptorPool,
    files: BTreeMap<String, FileEntry>,
    descriptions: HashMap<String, String>,
}

impl Catalog {
    /// Parse a descriptor blob with default options (comment folding enabled).
    pub fn parse(blob: &[u8]) -> Result<Catalog> {
        Catalog::parse_with_options(blob, &CatalogOptions::default())
    }

    /// Parse a descriptor blob.
    ///
    /// The blob is either a serialized `FileDescriptorSet` or, as a fallback,
    /// a `CodeGeneratorRequest` (which carries the same file descriptors
    /// under `proto_file`). Field type references that do not resolve within
    /// the set degrade to opaque `bytes` fields before the pool is built.
    pub fn parse_with_options(blob: &[u8], options: &CatalogOptions) -> Result<Catalog> {
        let mut files = decode_file_descriptors(blob)?;
        validate_labels(&files)?;
        mark_unresolved_references(&mut files);

        let mut descriptions = HashMap::new();
        let mut indexed: BTreeMap<String, FileEntry> = BTreeMap::new();

        for file in &mut files {
            if options.fold_comments {
                fold_comments_in(file, &mut descriptions);
            }
            let package = file.package().to_string();
            indexed.insert(
                package.clone(),
                FileEntry {
                    file_name: file.name().to_string(),
                    package,
                    proto: file.clone(),
                },
            );
        }

        let pool = build_pool(files)?;

        Ok(Catalog {
            pool,
            files: indexed,
            descriptions,
        })
    }

    /// The descriptor pool backing dynamic message construction.
    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Iterate catalog entries in package order.
    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.values()
    }

    /// Look up the file entry for a package.
    pub fn get(&self, package: &str) -> Option<&FileEntry> {
        self.files.get(package)
    }

    /// Folded comment text for a fully-qualified symbol name.
    pub fn description(&self, symbol: &str) -> Option<&str> {
        self.descriptions.get(symbol).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

/// Decode the descriptor blob, trying `FileDescriptorSet` first and falling
/// back to `CodeGeneratorRequest`.
fn decode_file_descriptors(blob: &[u8]) -> Result<Vec<FileDescriptorProto>> {
    let set_err = match FileDescriptorSet::decode(blob) {
        Ok(set) if !set.file.is_empty() => return Ok(set.file),
        Ok(_) => None,
        Err(e) => Some(e),
    };

    match prost_types::compiler::CodeGeneratorRequest::decode(blob) {
        Ok(req) if !req.proto_file.is_empty() => Ok(req.proto_file),
        // Both shapes decoded but neither carried files: genuinely empty input.
        Ok(_) if set_err.is_none() => Ok(Vec::new()),
        Ok(_) => Err(GatewayError::Descriptor(
            "blob is neither a FileDescriptorSet nor a CodeGeneratorRequest".into(),
        )),
        Err(e) => Err(GatewayError::Descriptor(format!(
            "failed to decode descriptor blob as FileDescriptorSet or CodeGeneratorRequest: {e}"
        ))),
    }
}

/// Reject descriptors carrying a label outside {optional, required, repeated}.
fn validate_labels(files: &[FileDescriptorProto]) -> Result<()> {
    fn check_message(msg: &DescriptorProto, file: &str) -> Result<()> {
        for field in &msg.field {
            if let Some(label) = field.label {
                if !(1..=3).contains(&label) {
                    return Err(GatewayError::Descriptor(format!(
                        "field '{}' in {file} has unrecognized label {label}",
                        field.name()
                    )));
                }
            }
        }
        for nested in &msg.nested_type {
            check_message(nested, file)?;
        }
        Ok(())
    }

    for file in files {
        for msg in &file.message_type {
            check_message(msg, file.name())?;
        }
    }
    Ok(())
}

/// Degrade fields whose type reference does not resolve within the set to
/// opaque `bytes`, so the pool build does not reject the whole catalog.
fn mark_unresolved_references(files: &mut [FileDescriptorProto]) {
    let defined = collect_defined_names(files);

    fn visit(msg: &mut DescriptorProto, defined: &HashSet<String>, file: &str) {
        for field in &mut msg.field {
            let is_reference = matches!(field.r#type, Some(TYPE_MESSAGE | TYPE_ENUM | TYPE_GROUP))
                || (field.r#type.is_none() && field.type_name.is_some());
            if !is_reference {
                continue;
            }
            let target = field.type_name().to_string();
            let absolute = if target.starts_with('.') {
                target.clone()
            } else {
                format!(".{target}")
            };
            if !defined.contains(&absolute) {
                warn!(
                    field = field.name(),
                    target = %target,
                    file,
                    "unresolved type reference, treating field as opaque bytes"
                );
                field.r#type = Some(TYPE_BYTES);
                field.type_name = None;
            }
        }
        for nested in &mut msg.nested_type {
            visit(nested, defined, file);
        }
    }

    for file in files {
        let name = file.name().to_string();
        for msg in &mut file.message_type {
            visit(msg, &defined, &name);
        }
    }
}

/// Collect the fully-qualified (leading-dot) names of every message and enum
/// defined in the set.
fn collect_defined_names(files: &[FileDescriptorProto]) -> HashSet<String> {
    fn visit(msg: &DescriptorProto, prefix: &str, out: &mut HashSet<String>) {
        let fqn = format!("{prefix}.{}", msg.name());
        for nested in &msg.nested_type {
            visit(nested, &fqn, out);
        }
        for en in &msg.enum_type {
            out.insert(format!("{fqn}.{}", en.name()));
        }
        out.insert(fqn);
    }

    let mut defined = HashSet::new();
    for file in files {
        let prefix = if file.package().is_empty() {
            String::new()
        } else {
            format!(".{}", file.package())
        };
        for msg in &file.message_type {
            visit(msg, &prefix, &mut defined);
        }
        for en in &file.enum_type {
            defined.insert(format!("{prefix}.{}", en.name()));
        }
    }
    defined
}

/// Build the descriptor pool, deduplicating files by name (later wins).
///
/// If the whole set is rejected, files are added one at a time so that a
/// single bad file does not take down the rest of the catalog.
fn build_pool(files: Vec<FileDescriptorProto>) -> Result<DescriptorPool> {
    let mut by_name: Vec<FileDescriptorProto> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for file in files {
        let name = file.name().to_string();
        match seen.get(&name) {
            Some(&idx) => by_name[idx] = file,
            None => {
                seen.insert(name, by_name.len());
                by_name.push(file);
            }
        }
    }

    let fds = FileDescriptorSet {
        file: by_name.clone(),
    };
    match DescriptorPool::from_file_descriptor_set(fds) {
        Ok(pool) => Ok(pool),
        Err(set_err) => {
            warn!(error = %set_err, "descriptor set rejected as a whole, retrying file by file");
            let mut pool = DescriptorPool::new();
            let mut added = 0usize;
            for file in by_name {
                let name = file.name().to_string();
                let single = FileDescriptorSet { file: vec![file] };
                match pool.add_file_descriptor_set(single) {
                    Ok(()) => added += 1,
                    Err(e) => warn!(file = %name, error = %e, "skipping file descriptor"),
                }
            }
            if added == 0 {
                return Err(GatewayError::Descriptor(format!(
                    "no usable file descriptors: {set_err}"
                )));
            }
            Ok(pool)
        }
    }
}

// -- Comment folding ----------------------------------------------------------

/// Fold `source_code_info` comments into the description table, then drop the
/// comment tree from the descriptor.
///
/// Each location addresses a node with a path of alternating field-number and
/// element-index entries. Odd-length paths address meta-schema scalars and are
/// ignored. Malformed locations are skipped, not fatal.
fn fold_comments_in(file: &mut FileDescriptorProto, descriptions: &mut HashMap<String, String>) {
    let info = match file.source_code_info.take() {
        Some(info) => info,
        None => return,
    };

    for location in &info.location {
        let mut comments = String::new();
        comments.push_str(location.leading_comments().trim_matches(' '));
        comments.push_str(location.trailing_comments().trim_matches(' '));
        for block in &location.leading_detached_comments {
            comments.push_str(block.trim_matches(' '));
        }
        let comments = comments.trim().to_string();
        if comments.is_empty() {
            continue;
        }

        if location.path.len() % 2 != 0 {
            continue;
        }

        match symbol_for_path(file, &location.path) {
            Some(symbol) => {
                descriptions.insert(symbol, comments);
            }
            None => {
                debug!(path = ?location.path, file = file.name(), "skipping unaddressable comment location");
            }
        }
    }
}

/// Walk cursor for path resolution.
enum Node<'a> {
    File(&'a FileDescriptorProto),
    Message(&'a DescriptorProto),
    Enum(&'a prost_types::EnumDescriptorProto),
    Service(&'a prost_types::ServiceDescriptorProto),
    Leaf,
}

/// Resolve an even-length `source_code_info` path to a fully-qualified symbol
/// name, e.g. `[4, 0, 2, 1]` -> second field of the first message.
fn symbol_for_path(file: &FileDescriptorProto, path: &[i32]) -> Option<String> {
    let mut node = Node::File(file);
    let mut name = file.package().to_string();

    let mut push = |name: &mut String, part: &str| {
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(part);
    };

    let mut rest = path;
    while let [field, index, tail @ ..] = rest {
        let field = *field;
        let index = usize::try_from(*index).ok()?;
        node = match node {
            Node::File(f) => match field {
                4 => {
                    let m = f.message_type.get(index)?;
                    push(&mut name, m.name());
                    Node::Message(m)
                }
                5 => {
                    let e = f.enum_type.get(index)?;
                    push(&mut name, e.name());
                    Node::Enum(e)
                }
                6 => {
                    let s = f.service.get(index)?;
                    push(&mut name, s.name());
                    Node::Service(s)
                }
                7 => {
                    let ext = f.extension.get(index)?;
                    push(&mut name, ext.name());
                    Node::Leaf
                }
                _ => return None,
            },
            Node::Message(m) => match field {
                2 => {
                    let f = m.field.get(index)?;
                    push(&mut name, f.name());
                    Node::Leaf
                }
                3 => {
                    let nested = m.nested_type.get(index)?;
                    push(&mut name, nested.name());
                    Node::Message(nested)
                }
                4 => {
                    let e = m.enum_type.get(index)?;
                    push(&mut name, e.name());
                    Node::Enum(e)
                }
                6 => {
                    let ext = m.extension.get(index)?;
                    push(&mut name, ext.name());
                    Node::Leaf
                }
                8 => {
                    let oneof = m.oneof_decl.get(index)?;
                    push(&mut name, oneof.name());
                    Node::Leaf
                }
                _ => return None,
            },
            Node::Service(s) => match field {
                2 => {
                    let m = s.method.get(index)?;
                    push(&mut name, m.name());
                    Node::Leaf
                }
                _ => return None,
            },
            Node::Enum(e) => match field {
                2 => {
                    let v = e.value.get(index)?;
                    push(&mut name, v.name());
                    Node::Leaf
                }
                _ => return None,
            },
            Node::Leaf => return None,
        };
        rest = tail;
    }

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
