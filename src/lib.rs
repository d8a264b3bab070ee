//! Zentinel Mock Responder
//!
//! A stub HTTP responder for test and integration environments. Each
//! listening port has its own ordered list of mock rules, kept in an
//! external store (redis by default). For every request the responder
//! loads the port's rules and answers with the canned response of the
//! first rule that matches.
//!
//! # Matching
//!
//! - **URL**: case-insensitive comparison with the request path, slashes
//!   trimmed; empty or `*` matches any path
//! - **Method**: case-insensitive; empty matches any method
//! - **Body**: for POST requests, `path->to->field` expressions are resolved
//!   in the JSON body and compared with the expected value. Values of
//!   different JSON types never match.
//!
//! # Example Rule Set
//!
//! ```json
//! {
//!   "port": 9100,
//!   "mocks": [
//!     {"url": "ping", "method": "GET", "resp": "pong"},
//!     {"url": "*", "method": "POST", "reqBody": {"user->id": 5}, "resp": {"ok": true}}
//!   ]
//! }
//! ```

pub mod config;
pub mod error;
pub mod matcher;
pub mod server;
pub mod service;
pub mod store;

pub use config::{ResponderConfig, Rule, RuleSet};
pub use error::{DispatchError, LookupError};
pub use matcher::{MatchRequest, Matcher};
pub use server::Server;
pub use service::MockService;
