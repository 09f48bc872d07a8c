//! Route synthesis and atomic publication.
//!
//! The synthesizer walks the catalog in package order and materializes one
//! route per HTTP binding. Route order in the table determines match
//! precedence: first match wins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use prost_reflect::MessageDescriptor;
use tracing::{debug, warn};

use crate::binding::{bindings_from_blob, BodySelector, HttpBinding, UrlTemplate};
use crate::catalog::Catalog;
use crate::error::Result;
use crate::openapi;

/// One synthesized route: (verb, template) -> (service, method, input, output).
#[derive(Debug, Clone)]
pub struct Route {
    pub method: http::Method,
    pub template: UrlTemplate,
    pub body: BodySelector,
    /// Fully-qualified gRPC service name.
    pub service: String,
    /// Method name within the service.
    pub rpc: String,
    pub input: MessageDescriptor,
    pub output: MessageDescriptor,
    pub description: Option<String>,
}

/// An ordered, immutable route table.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn empty() -> RouteTable {
        RouteTable::default()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// First route whose verb and template match the request path, with the
    /// extracted path-variable bindings.
    pub fn match_request(
        &self,
        method: &http::Method,
        path: &str,
    ) -> Option<(&Route, Vec<(String, String)>)> {
        for route in &self.routes {
            if route.method != *method {
                continue;
            }
            if let Some(bindings) = route.template.matches(path) {
                return Some((route, bindings));
            }
        }
        None
    }
}

/// Compile catalog + HTTP bindings into a route table.
///
/// Streaming methods carry no REST surface and are skipped. A binding whose
/// path variables are not all fields of the input message is dropped, as is
/// a later binding colliding on (verb, template).
pub fn synthesize(catalog: &Catalog, bindings: &HashMap<String, Vec<HttpBinding>>) -> RouteTable {
    let mut routes = Vec::new();
    let mut claimed: HashSet<(String, String)> = HashSet::new();

    for entry in catalog.files() {
        for service_proto in &entry.proto.service {
            let service_fqn = if entry.package.is_empty() {
                service_proto.name().to_string()
            } else {
                format!("{}.{}", entry.package, service_proto.name())
            };
            let service = match catalog.pool().get_service_by_name(&service_fqn) {
                Some(service) => service,
                None => {
                    warn!(service = %service_fqn, "service missing from descriptor pool");
                    continue;
                }
            };

            for method in service.methods() {
                let method_fqn = format!("{service_fqn}.{}", method.name());
                let Some(method_bindings) = bindings.get(&method_fqn) else {
                    continue;
                };
                if method.is_client_streaming() || method.is_server_streaming() {
                    debug!(method = %method_fqn, "skipping streaming method");
                    continue;
                }

                let input = method.input();
                let output = method.output();

                for binding in method_bindings {
                    if let Some(bad) = unmatched_variable(&binding.template, &input) {
                        warn!(
                            method = %method_fqn,
                            template = binding.template.raw(),
                            variable = %bad,
                            "dropping route: path variable has no matching input field"
                        );
                        continue;
                    }

                    let key = (binding.method.to_string(), binding.template.pattern_key());
                    if !claimed.insert(key) {
                        warn!(
                            method = %method_fqn,
                            verb = %binding.method,
                            template = binding.template.raw(),
                            "dropping route: (verb, template) already claimed"
                        );
                        continue;
                    }

                    routes.push(Route {
                        method: binding.method.clone(),
                        template: binding.template.clone(),
                        body: binding.body.clone(),
                        service: service_fqn.clone(),
                        rpc: method.name().to_string(),
                        input: input.clone(),
                        output: output.clone(),
                        description: catalog.description(&method_fqn).map(str::to_string),
                    });
                }
            }
        }
    }

    RouteTable { routes }
}

fn unmatched_variable(template: &UrlTemplate, input: &MessageDescriptor) -> Option<String> {
    template
        .variables()
        .map(|(name, _)| name)
        .find(|name| {
            input.get_field_by_name(name).is_none()
                && !input.fields().any(|f| f.json_name() == *name)
        })
        .map(str::to_string)
}

// -- Publication --------------------------------------------------------------

/// The unit of atomic publication: one route table plus its OpenAPI document.
#[derive(Debug, Clone)]
pub struct Published {
    pub routes: RouteTable,
    pub swagger: serde_json::Value,
}

impl Published {
    /// A table with no dynamic routes; only reserved routes are served.
    pub fn empty() -> Published {
        Published {
            routes: RouteTable::empty(),
            swagger: openapi::empty_document(),
        }
    }

    /// Run the full rebuild pipeline on a descriptor blob: catalog, bindings,
    /// route table, OpenAPI document.
    pub fn from_blob(blob: &[u8]) -> Result<Published> {
        let catalog = Catalog::parse(blob)?;
        let bindings = bindings_from_blob(blob);
        let routes = synthesize(&catalog, &bindings);
        let swagger = openapi::document(&catalog, &routes);
        Ok(Published { routes, swagger })
    }
}

/// The single mutable cell of the gateway: the "current" published surface.
///
/// Readers take a snapshot once per request; writers swap a fully-built
/// replacement. In-flight requests keep their snapshot alive until done.
pub struct RoutePublisher {
    current: ArcSwap<Published>,
}

impl RoutePublisher {
    pub fn new(initial: Published) -> RoutePublisher {
        RoutePublisher {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn publish(&self, next: Published) {
        self.current.store(Arc::new(next));
    }

    pub fn snapshot(&self) -> Arc<Published> {
        self.current.load_full()
    }
}
