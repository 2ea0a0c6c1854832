//! Bridge between a FaaS runtime loop and a long-lived PHP-FPM worker.
//!
//! The runtime loop hands every invocation to [`FpmHandler`] as a normalized
//! [`HttpRequestEvent`] plus its [`Context`]; the handler translates it into
//! a FastCGI request, plays it against the worker over a Unix socket, and
//! translates the answer back. Everything else here keeps that round trip
//! honest: the supervisor owns the worker process across invocations, and the
//! deadline interrupter aborts a request before the platform kills the
//! sandbox around it.

pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod interrupt;
pub mod log;
pub mod response;
pub mod supervisor;
pub mod translate;

pub use config::Config;
pub use error::Error;
pub use event::{Context, HttpRequestEvent, HttpResponse};
pub use handler::FpmHandler;
