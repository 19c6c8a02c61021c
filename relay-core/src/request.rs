//! The request lifecycle as a typestate.
//!
//! Grounded on `fusillade::request::transitions`: a `Request<S>` wrapper around a
//! plain data record, where `S` is a zero-sized marker for the current status and
//! every transition consumes `self`, persists through the `Storage` trait, and only
//! then returns the next state. There is no way to observe a `Request<Completed>`
//! that hasn't been durably recorded as such.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{ApiKeyId, RequestId};
use crate::response::Response;
use crate::store::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled | RequestStatus::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::TimedOut => "timed_out",
        }
    }
}

/// Context passed to `Storage::transition` describing why a transition happened,
/// so the audit row in `state_transitions` carries more than just the two statuses.
#[derive(Debug, Clone, Default)]
pub struct TransitionMeta {
    pub worker_id: Option<String>,
    pub note: Option<String>,
}

impl TransitionMeta {
    pub fn claimed_by(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            note: None,
        }
    }

    pub fn note(note: impl Into<String>) -> Self {
        Self {
            worker_id: None,
            note: Some(note.into()),
        }
    }
}

/// The durable, status-tagged shape of a request. This is what the store reads and
/// writes; `Request<S>` is a compile-time-checked view over the same data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub provider: String,
    pub model: Option<String>,
    pub agent: Option<String>,
    pub prompt: String,
    pub priority: i64,
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: RequestStatus,
    pub attempt_count: u32,
    pub assigned_worker: Option<String>,
    pub api_key_id: Option<ApiKeyId>,
    pub parent_request_id: Option<RequestId>,
    pub fingerprint: String,
    pub bypass_cache: bool,
}

impl RequestRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: impl Into<String>,
        model: Option<String>,
        agent: Option<String>,
        prompt: impl Into<String>,
        priority: i64,
        timeout: chrono::Duration,
        api_key_id: Option<ApiKeyId>,
        parent_request_id: Option<RequestId>,
        fingerprint: String,
        bypass_cache: bool,
    ) -> Self {
        let submitted_at = Utc::now();
        Self {
            id: RequestId::new(),
            provider: provider.into(),
            model,
            agent,
            prompt: prompt.into(),
            priority,
            submitted_at,
            deadline: submitted_at + timeout,
            status: RequestStatus::Queued,
            attempt_count: 0,
            assigned_worker: None,
            api_key_id,
            parent_request_id,
            fingerprint,
            bypass_cache,
        }
    }
}

pub trait RequestStateMarker: Send + Sync + 'static {
    const STATUS: RequestStatus;
}

macro_rules! state_marker {
    ($name:ident, $status:expr) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name;
        impl RequestStateMarker for $name {
            const STATUS: RequestStatus = $status;
        }
    };
}

state_marker!(Queued, RequestStatus::Queued);
state_marker!(Processing, RequestStatus::Processing);
state_marker!(Completed, RequestStatus::Completed);
state_marker!(Failed, RequestStatus::Failed);
state_marker!(Cancelled, RequestStatus::Cancelled);
state_marker!(TimedOut, RequestStatus::TimedOut);

/// A request known (at compile time) to be in state `S`.
#[derive(Debug, Clone)]
pub struct Request<S: RequestStateMarker> {
    pub record: RequestRecord,
    _state: PhantomData<S>,
}

impl<S: RequestStateMarker> Request<S> {
    pub fn id(&self) -> RequestId {
        self.record.id
    }

    pub fn fingerprint(&self) -> &str {
        &self.record.fingerprint
    }

    pub fn into_record(self) -> RequestRecord {
        self.record
    }

    fn transitioned(mut self, new_status: RequestStatus) -> RequestRecord {
        self.record.status = new_status;
        self.record
    }
}

fn wrap<S: RequestStateMarker>(record: RequestRecord) -> Request<S> {
    debug_assert_eq!(record.status, S::STATUS);
    Request {
        record,
        _state: PhantomData,
    }
}

impl Request<Queued> {
    /// Constructs the initial in-memory view of a freshly inserted request. Callers
    /// must have already `put_request`'d the record; this does not itself persist.
    pub fn from_inserted(record: RequestRecord) -> Self {
        wrap(record)
    }

    pub async fn claim(self, storage: &dyn Storage, worker_id: &str) -> Result<Request<Processing>> {
        storage
            .transition(
                self.record.id,
                RequestStatus::Queued,
                RequestStatus::Processing,
                TransitionMeta::claimed_by(worker_id),
            )
            .await?;
        let mut record = self.transitioned(RequestStatus::Processing);
        record.assigned_worker = Some(worker_id.to_string());
        record.attempt_count += 1;
        Ok(wrap(record))
    }

    pub async fn cancel(self, storage: &dyn Storage) -> Result<Request<Cancelled>> {
        storage
            .transition(
                self.record.id,
                RequestStatus::Queued,
                RequestStatus::Cancelled,
                TransitionMeta::note("cancelled while queued"),
            )
            .await?;
        Ok(wrap(self.transitioned(RequestStatus::Cancelled)))
    }

    /// Single-flight waiters skip `processing` entirely: they share the producer's
    /// response and move straight from `queued` to `completed`.
    pub async fn complete_as_waiter(self, storage: &dyn Storage, response: &Response) -> Result<Request<Completed>> {
        storage
            .transition_with_response(
                self.record.id,
                RequestStatus::Queued,
                RequestStatus::Completed,
                TransitionMeta::note("single-flight waiter"),
                response.clone(),
            )
            .await?;
        Ok(wrap(self.transitioned(RequestStatus::Completed)))
    }

    pub async fn fail_as_waiter(self, storage: &dyn Storage, response: &Response) -> Result<Request<Failed>> {
        storage
            .transition_with_response(
                self.record.id,
                RequestStatus::Queued,
                RequestStatus::Failed,
                TransitionMeta::note("single-flight waiter"),
                response.clone(),
            )
            .await?;
        Ok(wrap(self.transitioned(RequestStatus::Failed)))
    }
}

impl Request<Processing> {
    pub async fn complete(self, storage: &dyn Storage, response: &Response) -> Result<Request<Completed>> {
        storage
            .transition_with_response(
                self.record.id,
                RequestStatus::Processing,
                RequestStatus::Completed,
                TransitionMeta::default(),
                response.clone(),
            )
            .await?;
        Ok(wrap(self.transitioned(RequestStatus::Completed)))
    }

    pub async fn fail(self, storage: &dyn Storage, response: &Response) -> Result<Request<Failed>> {
        storage
            .transition_with_response(
                self.record.id,
                RequestStatus::Processing,
                RequestStatus::Failed,
                TransitionMeta::default(),
                response.clone(),
            )
            .await?;
        Ok(wrap(self.transitioned(RequestStatus::Failed)))
    }

    pub async fn cancel(self, storage: &dyn Storage, response: &Response) -> Result<Request<Cancelled>> {
        storage
            .transition_with_response(
                self.record.id,
                RequestStatus::Processing,
                RequestStatus::Cancelled,
                TransitionMeta::note("cancelled mid-flight"),
                response.clone(),
            )
            .await?;
        Ok(wrap(self.transitioned(RequestStatus::Cancelled)))
    }

    pub async fn time_out(self, storage: &dyn Storage, response: &Response) -> Result<Request<TimedOut>> {
        storage
            .transition_with_response(
                self.record.id,
                RequestStatus::Processing,
                RequestStatus::TimedOut,
                TransitionMeta::note("deadline exceeded"),
                response.clone(),
            )
            .await?;
        Ok(wrap(self.transitioned(RequestStatus::TimedOut)))
    }
}

/// A request loaded from storage whose status is only known at runtime, e.g. on
/// `startup_recovery` or when serving `GET /api/query/{id}`. Grounded on
/// `fusillade`'s `AnyRequest`.
#[derive(Debug, Clone)]
pub enum AnyRequest {
    Queued(Request<Queued>),
    Processing(Request<Processing>),
    Completed(Request<Completed>),
    Failed(Request<Failed>),
    Cancelled(Request<Cancelled>),
    TimedOut(Request<TimedOut>),
}

impl AnyRequest {
    pub fn from_record(record: RequestRecord) -> Self {
        match record.status {
            RequestStatus::Queued => AnyRequest::Queued(wrap(record)),
            RequestStatus::Processing => AnyRequest::Processing(wrap(record)),
            RequestStatus::Completed => AnyRequest::Completed(wrap(record)),
            RequestStatus::Failed => AnyRequest::Failed(wrap(record)),
            RequestStatus::Cancelled => AnyRequest::Cancelled(wrap(record)),
            RequestStatus::TimedOut => AnyRequest::TimedOut(wrap(record)),
        }
    }

    pub fn record(&self) -> &RequestRecord {
        match self {
            AnyRequest::Queued(r) => &r.record,
            AnyRequest::Processing(r) => &r.record,
            AnyRequest::Completed(r) => &r.record,
            AnyRequest::Failed(r) => &r.record,
            AnyRequest::Cancelled(r) => &r.record,
            AnyRequest::TimedOut(r) => &r.record,
        }
    }
}
