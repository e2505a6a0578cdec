use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::store::BoundedOrderedStore;

pub const DEFAULT_EXCHANGE_CAPACITY: usize = 500;

/// Opaque token linking the start and completion records of one exchange.
///
/// Ids are issued from a per-store counter, so they increase with arrival
/// order and never repeat within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(CorrelationId)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

impl HeaderPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Inbound half of an exchange, captured before forwarding.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<HeaderPair>,
}

/// Outbound half of an exchange, captured once the upstream answered.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<HeaderPair>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Pending,
    Completed,
    Errored,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedExchange {
    pub id: CorrelationId,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub headers_in: Vec<HeaderPair>,
    pub started_at: DateTime<Utc>,
    pub state: ExchangeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers_out: Option<Vec<HeaderPair>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CapturedExchange {
    pub fn is_settled(&self) -> bool {
        self.state != ExchangeState::Pending
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("exchange {0} is unknown or has been evicted")]
    Unknown(CorrelationId),
    #[error("exchange {0} has already been settled")]
    AlreadySettled(CorrelationId),
}

struct TrafficInner {
    exchanges: BoundedOrderedStore<CapturedExchange>,
    next_id: u64,
    last_started_at: Option<DateTime<Utc>>,
}

/// Bounded, time-ordered record of proxied request/response pairs.
pub struct TrafficStore {
    inner: Mutex<TrafficInner>,
}

impl Default for TrafficStore {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE_CAPACITY)
    }
}

impl TrafficStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TrafficInner {
                exchanges: BoundedOrderedStore::new(capacity),
                next_id: 1,
                last_started_at: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().exchanges.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records the inbound half of an exchange and returns its id.
    ///
    /// `started_at` never moves backwards across calls, even if the wall
    /// clock does.
    pub fn start_exchange(&self, request: RequestHead) -> CorrelationId {
        let mut inner = self.inner.lock();
        let id = CorrelationId(inner.next_id);
        inner.next_id += 1;

        let now = Utc::now();
        let started_at = match inner.last_started_at {
            Some(last) if last > now => last,
            _ => now,
        };
        inner.last_started_at = Some(started_at);

        let RequestHead {
            method,
            path,
            query,
            headers,
        } = request;
        trace!(%id, %method, %path, "exchange started");
        inner.exchanges.push(CapturedExchange {
            id,
            method,
            path,
            query,
            headers_in: headers,
            started_at,
            state: ExchangeState::Pending,
            status: None,
            headers_out: None,
            completed_at: None,
            duration_ms: None,
            error: None,
        });
        id
    }

    /// Fills the outbound half of a pending exchange. Settling twice is rejected.
    pub fn complete_exchange(
        &self,
        id: CorrelationId,
        response: ResponseHead,
        started: Instant,
    ) -> Result<(), CompletionError> {
        let duration_ms = elapsed_ms(started);
        self.settle(id, |exchange| {
            exchange.state = ExchangeState::Completed;
            exchange.status = Some(response.status);
            exchange.headers_out = Some(response.headers);
            exchange.duration_ms = Some(duration_ms);
        })
    }

    /// Marks a pending exchange as failed.
    pub fn fail_exchange(
        &self,
        id: CorrelationId,
        error: impl Into<String>,
        started: Instant,
    ) -> Result<(), CompletionError> {
        let duration_ms = elapsed_ms(started);
        let error = error.into();
        self.settle(id, |exchange| {
            exchange.state = ExchangeState::Errored;
            exchange.error = Some(error);
            exchange.duration_ms = Some(duration_ms);
        })
    }

    fn settle<F>(&self, id: CorrelationId, apply: F) -> Result<(), CompletionError>
    where
        F: FnOnce(&mut CapturedExchange),
    {
        let mut inner = self.inner.lock();
        let exchange = inner
            .exchanges
            .find_by_key_mut(&id, |exchange| exchange.id)
            .ok_or(CompletionError::Unknown(id))?;
        if exchange.is_settled() {
            return Err(CompletionError::AlreadySettled(id));
        }
        let completed_at = Utc::now().max(exchange.started_at);
        apply(exchange);
        exchange.completed_at = Some(completed_at);
        trace!(%id, state = ?exchange.state, "exchange settled");
        Ok(())
    }

    /// Snapshot of every retained exchange, oldest first.
    pub fn exchanges(&self) -> Vec<CapturedExchange> {
        self.inner.lock().exchanges.iter().cloned().collect()
    }

    /// Snapshot of the newest `limit` exchanges, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<CapturedExchange> {
        let inner = self.inner.lock();
        let skip = inner.exchanges.len().saturating_sub(limit);
        inner.exchanges.iter().skip(skip).cloned().collect()
    }

    pub fn exchange(&self, id: CorrelationId) -> Option<CapturedExchange> {
        self.inner
            .lock()
            .exchanges
            .find_by_key(&id, |exchange| exchange.id)
            .cloned()
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}
