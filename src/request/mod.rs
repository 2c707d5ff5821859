//! Request lifecycle manager.
//!
//! Creation, decisions and amendments of verification requests all go
//! through [`RequestManager`], which enforces the transition table and
//! triggers the network step on acceptance.
//!
//! Accepting a request dispatches the verification round first and commits
//! the status afterwards with a compare-and-set. A failed round leaves the
//! request `Pending`, emits [`NodeEvent::DispatchFailed`] and returns the
//! error, so the caller may retry; two racing decisions commit exactly once.
//! The commit also checks the request's revision, so criteria amended while
//! the round was in flight are never committed as accepted.

mod dispatch;
mod model;

pub use dispatch::{
    ConnectedPeers, DispatchOutcome, NetworkDispatcher, PeerSource, StaticPeers,
    VerificationDispatcher,
};
pub use model::{Decision, RequestStatus, VerificationRequest};

use crate::criteria::Criteria;
use crate::error::{Error, Result};
use crate::event::{NodeEvent, NodeEventsSender};
use crate::store::{RequestFilter, RequestStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Owns the verification request state machine.
#[derive(Clone)]
pub struct RequestManager {
    store: Arc<dyn RequestStore>,
    dispatcher: Arc<dyn VerificationDispatcher>,
    events: Option<NodeEventsSender>,
}

impl std::fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestManager").finish_non_exhaustive()
    }
}

impl RequestManager {
    /// Manager over `store`, dispatching accepted requests through `dispatcher`.
    #[must_use]
    pub fn new(store: Arc<dyn RequestStore>, dispatcher: Arc<dyn VerificationDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            events: None,
        }
    }

    /// Publish lifecycle events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: NodeEventsSender) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: NodeEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Create a `Pending` request.
    ///
    /// # Errors
    ///
    /// [`Error::Criteria`] if the criteria are malformed or an identifier is
    /// empty; store errors otherwise.
    pub async fn create(
        &self,
        requester_id: &str,
        subject_id: &str,
        display_name: &str,
        criteria: Criteria,
    ) -> Result<VerificationRequest> {
        if requester_id.is_empty() || subject_id.is_empty() {
            return Err(Error::Criteria(
                "requester and subject must be set".to_string(),
            ));
        }
        criteria.validate()?;

        let request = VerificationRequest::new(requester_id, subject_id, display_name, criteria);
        let request = self.store.create_request(request).await?;
        info!(request_id = %request.id, requester_id, subject_id, "Created verification request");
        self.emit(NodeEvent::RequestCreated {
            request_id: request.id.clone(),
        });
        Ok(request)
    }

    /// Fetch one request.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`].
    pub async fn get(&self, id: &str) -> Result<VerificationRequest> {
        self.store
            .get_requests(&RequestFilter::by_id(id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("request {id}")))
    }

    /// Requests matching `filter`.
    ///
    /// # Errors
    ///
    /// Store errors, including an empty filter.
    pub async fn list(&self, filter: &RequestFilter) -> Result<Vec<VerificationRequest>> {
        self.store.get_requests(filter).await
    }

    /// Apply the subject's decision.
    ///
    /// # Errors
    ///
    /// See [`RequestManager::resolve_with_outcome`].
    pub async fn resolve(&self, id: &str, decision: Decision) -> Result<VerificationRequest> {
        self.resolve_with_outcome(id, decision)
            .await
            .map(|(request, _)| request)
    }

    /// Apply the subject's decision and return the custody peer's answer when
    /// the decision was to accept.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`], [`Error::InvalidTransition`] if the request is no
    /// longer `Pending` (including losing a race), [`Error::Conflict`] if the
    /// request was amended during the round, or the network error of a failed
    /// verification round. In the last two cases the status is unchanged.
    pub async fn resolve_with_outcome(
        &self,
        id: &str,
        decision: Decision,
    ) -> Result<(VerificationRequest, Option<DispatchOutcome>)> {
        let current = self.get(id).await?;
        let next = decision.target_status();
        current.check_transition(next)?;

        let outcome = match decision {
            Decision::Reject => None,
            Decision::Accept => match self.dispatcher.dispatch(&current).await {
                Ok(outcome) => {
                    info!(request_id = id, peer = %outcome.peer_id, verdict = %outcome.verdict, "Verification round answered");
                    self.emit(NodeEvent::VerificationDispatched {
                        request_id: id.to_string(),
                        peer_id: outcome.peer_id.to_string(),
                        verdict: outcome.verdict,
                    });
                    Some(outcome)
                }
                Err(e) => {
                    warn!(request_id = id, error = %e, "Verification round failed; request stays Pending");
                    self.emit(NodeEvent::DispatchFailed {
                        request_id: id.to_string(),
                        reason: e.to_string(),
                    });
                    return Err(e);
                }
            },
        };

        let committed = self
            .store
            .compare_and_set_status(id, current.status, current.revision, next)
            .await?;
        info!(request_id = id, status = %committed.status, "Resolved verification request");
        self.emit(NodeEvent::RequestResolved {
            request_id: id.to_string(),
            status: committed.status,
        });
        Ok((committed, outcome))
    }

    /// Withdraw a request that is still `Pending`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] or [`Error::InvalidTransition`].
    pub async fn cancel(&self, id: &str) -> Result<VerificationRequest> {
        let current = self.get(id).await?;
        current.check_transition(RequestStatus::Cancelled)?;
        let committed = self
            .store
            .compare_and_set_status(
                id,
                current.status,
                current.revision,
                RequestStatus::Cancelled,
            )
            .await?;
        info!(request_id = id, "Cancelled verification request");
        self.emit(NodeEvent::RequestResolved {
            request_id: id.to_string(),
            status: committed.status,
        });
        Ok(committed)
    }

    /// Replace the criteria of a `Pending` request and optionally cancel it.
    ///
    /// `status` must be `Pending` (criteria change only) or `Cancelled`;
    /// decisions go through [`RequestManager::resolve`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] if the request is not `Pending` or
    /// `status` is a decision, [`Error::Criteria`] for malformed criteria.
    pub async fn amend(
        &self,
        id: &str,
        criteria: Criteria,
        status: RequestStatus,
    ) -> Result<VerificationRequest> {
        let mut current = self.get(id).await?;
        let forbidden = matches!(status, RequestStatus::Accepted | RequestStatus::Rejected);
        if current.status != RequestStatus::Pending || forbidden {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: status,
            });
        }
        criteria.validate()?;

        current.criteria = criteria;
        current.updated_at = chrono::Utc::now();
        let updated = self.store.update_request(current).await?;
        info!(request_id = id, "Amended verification request");

        if status == RequestStatus::Cancelled {
            return self.cancel(id).await;
        }
        Ok(updated)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::criteria::{Comparison, Rule};
    use crate::event::create_event_channel;
    use crate::protocol::message::Verdict;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use libp2p::PeerId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers every round with a fixed verdict, or fails.
    struct FakeDispatcher {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl FakeDispatcher {
        fn answering() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
                delay,
            })
        }
    }

    #[async_trait]
    impl VerificationDispatcher for FakeDispatcher {
        async fn dispatch(&self, _request: &VerificationRequest) -> Result<DispatchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Dial {
                    target: "custody".to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(DispatchOutcome {
                peer_id: PeerId::random(),
                verdict: Verdict::Eligible,
            })
        }
    }

    fn over_18() -> Criteria {
        Criteria::all(vec![Rule::new("age", Comparison::Greater, 18)])
    }

    fn manager(dispatcher: Arc<FakeDispatcher>) -> RequestManager {
        RequestManager::new(Arc::new(MemoryStore::new()), dispatcher)
    }

    #[tokio::test]
    async fn test_create_is_pending() {
        let manager = manager(FakeDispatcher::answering());
        let request = manager.create("p1", "u1", "Acme", over_18()).await.unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(manager.get(&request.id).await.unwrap(), request);
    }

    #[tokio::test]
    async fn test_create_rejects_missing_subject() {
        let manager = manager(FakeDispatcher::answering());
        assert!(matches!(
            manager.create("p1", "", "Acme", over_18()).await,
            Err(Error::Criteria(_))
        ));
    }

    #[tokio::test]
    async fn test_reject_then_accept_is_invalid() {
        let dispatcher = FakeDispatcher::answering();
        let manager = manager(Arc::clone(&dispatcher));
        let request = manager.create("p1", "u1", "Acme", over_18()).await.unwrap();

        let rejected = manager.resolve(&request.id, Decision::Reject).await.unwrap();
        assert_eq!(rejected.status, RequestStatus::Rejected);

        let err = manager.resolve(&request.id, Decision::Accept).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(!err.is_network());
        assert_eq!(manager.get(&request.id).await.unwrap().status, RequestStatus::Rejected);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_accept_dispatches_then_commits() {
        let dispatcher = FakeDispatcher::answering();
        let (tx, mut rx) = create_event_channel();
        let manager = manager(Arc::clone(&dispatcher)).with_events(tx);
        let request = manager.create("p1", "u1", "Acme", over_18()).await.unwrap();

        let (accepted, outcome) = manager
            .resolve_with_outcome(&request.id, Decision::Accept)
            .await
            .unwrap();
        assert_eq!(accepted.status, RequestStatus::Accepted);
        assert_eq!(outcome.unwrap().verdict, Verdict::Eligible);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

        assert!(matches!(rx.recv().await.unwrap(), NodeEvent::RequestCreated { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeEvent::VerificationDispatched { verdict: Verdict::Eligible, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeEvent::RequestResolved { status: RequestStatus::Accepted, .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_dispatch_leaves_pending_and_is_recorded() {
        let (tx, mut rx) = create_event_channel();
        let manager = manager(FakeDispatcher::failing()).with_events(tx);
        let request = manager.create("p1", "u1", "Acme", over_18()).await.unwrap();
        let _ = rx.recv().await;

        let err = manager.resolve(&request.id, Decision::Accept).await.unwrap_err();
        assert!(err.is_network());
        assert!(err.is_retryable());
        assert_eq!(manager.get(&request.id).await.unwrap().status, RequestStatus::Pending);
        assert!(matches!(rx.recv().await.unwrap(), NodeEvent::DispatchFailed { .. }));
    }

    #[tokio::test]
    async fn test_amend_during_round_blocks_commit() {
        let dispatcher = FakeDispatcher::slow(Duration::from_millis(200));
        let manager = manager(Arc::clone(&dispatcher));
        let request = manager.create("p1", "u1", "Acme", over_18()).await.unwrap();
        let over_65 = Criteria::all(vec![Rule::new("age", Comparison::Greater, 65)]);

        let (accept, amend) = tokio::join!(
            manager.resolve(&request.id, Decision::Accept),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                manager
                    .amend(&request.id, over_65.clone(), RequestStatus::Pending)
                    .await
            },
        );
        assert_eq!(amend.unwrap().criteria, over_65);
        assert!(matches!(accept, Err(Error::Conflict { .. })), "got {accept:?}");

        let stored = manager.get(&request.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
        assert_eq!(stored.criteria, over_65);

        // The amended criteria get their own round.
        let accepted = manager.resolve(&request.id, Decision::Accept).await.unwrap();
        assert_eq!(accepted.status, RequestStatus::Accepted);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_racing_decisions_commit_once() {
        let dispatcher = FakeDispatcher::slow(Duration::from_millis(100));
        let manager = manager(Arc::clone(&dispatcher));
        let request = manager.create("p1", "u1", "Acme", over_18()).await.unwrap();

        let (accept, reject) = tokio::join!(
            manager.resolve(&request.id, Decision::Accept),
            manager.resolve(&request.id, Decision::Reject),
        );
        assert_eq!(reject.unwrap().status, RequestStatus::Rejected);
        assert!(matches!(
            accept,
            Err(Error::InvalidTransition { from: RequestStatus::Rejected, .. })
        ));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get(&request.id).await.unwrap().status, RequestStatus::Rejected);
    }

    #[tokio::test]
    async fn test_cancel_only_from_pending() {
        let manager = manager(FakeDispatcher::answering());
        let request = manager.create("p1", "u1", "Acme", over_18()).await.unwrap();
        let cancelled = manager.cancel(&request.id).await.unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert!(matches!(
            manager.resolve(&request.id, Decision::Accept).await,
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.cancel(&request.id).await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_amend_rules() {
        let manager = manager(FakeDispatcher::answering());
        let request = manager.create("p1", "u1", "Acme", over_18()).await.unwrap();

        let stricter = Criteria::all(vec![Rule::new("age", Comparison::Greater, 21)]);
        let amended = manager
            .amend(&request.id, stricter.clone(), RequestStatus::Pending)
            .await
            .unwrap();
        assert_eq!(amended.criteria, stricter);
        assert_eq!(amended.status, RequestStatus::Pending);

        assert!(matches!(
            manager
                .amend(&request.id, stricter.clone(), RequestStatus::Accepted)
                .await,
            Err(Error::InvalidTransition { .. })
        ));

        let cancelled = manager
            .amend(&request.id, over_18(), RequestStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert_eq!(cancelled.criteria, over_18());

        assert!(matches!(
            manager.amend(&request.id, stricter, RequestStatus::Pending).await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_request_is_not_found() {
        let manager = manager(FakeDispatcher::answering());
        assert!(matches!(
            manager.resolve("missing", Decision::Reject).await,
            Err(Error::NotFound(_))
        ));
    }
}
