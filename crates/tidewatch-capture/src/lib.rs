//! In-process capture stores used by the tidewatch sidecar.
//!
//! Both stores are bounded FIFO buffers that live for the lifetime of the
//! sidecar process. They are constructed explicitly and shared through `Arc`
//! handles; nothing here is global.

pub mod logs;
pub mod store;
pub mod traffic;

pub use logs::{LogEntry, LogFilter, LogLevel, LogStore, DEFAULT_LOG_CAPACITY};
pub use store::BoundedOrderedStore;
pub use traffic::{
    CapturedExchange, CompletionError, CorrelationId, ExchangeState, HeaderPair, RequestHead,
    ResponseHead, TrafficStore, DEFAULT_EXCHANGE_CAPACITY,
};
