//! Core engine of a self-configuring REST-to-gRPC gateway.
//!
//! The gateway connects to a gRPC backend, fetches its descriptor set over
//! server reflection, synthesizes a REST/JSON surface from `google.api.http`
//! annotations, and proxies HTTP requests to the matching gRPC methods with
//! JSON⇄protobuf translation in both directions. A Swagger document
//! describing the generated surface is rebuilt alongside the route table
//! whenever the backend schema changes.

pub mod binding;
pub mod catalog;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod server;
pub mod session;
pub mod translate;
