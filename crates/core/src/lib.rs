//! Kubetail core types: log records, source expressions, stream modes,
//! cursor codecs and the shared error enum.

#![forbid(unsafe_code)]

pub mod cursor;
pub mod expr;
pub mod mode;
pub mod record;
pub mod timearg;

mod error;

pub use error::{Error, Result};
pub use expr::{NameSelector, NamespaceSelector, SourceExpr, WorkloadKind};
pub use mode::{FetchCapabilities, FetchDirection, FetchOptions, FetcherTag, StreamMode};
pub use record::{LogRecord, LogSource, SourceFilter, SourceKey, SourceMeta};

pub mod prelude {
    pub use super::{
        Error, FetchCapabilities, FetchDirection, FetchOptions, FetcherTag, LogRecord, LogSource,
        Result, SourceExpr, SourceFilter, SourceKey, SourceMeta, StreamMode, WorkloadKind,
    };
}
