//! Shared FDSN wire contract for the federation suite.
//!
//! This crate contains the core types and grammar shared by the federator
//! and the StationLite routing service: stream epochs, the UTC time grammar,
//! per-service request options, the POST line-block body, and the routing
//! resolver's output formats.
//!
//! # UTF-8 requirement
//!
//! All parsers accept `&str`, which guarantees valid UTF-8 at the type
//! level. Callers must reject invalid UTF-8 before invoking a parser.

pub mod parse;
pub mod service;
pub mod stream;
pub mod time;
pub mod wire;

pub use parse::{FdsnRequest, ParseError};
pub use service::{Service, ServiceOptions};
pub use stream::StreamEpoch;
pub use wire::RouteGroup;
