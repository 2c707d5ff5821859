//! Persistence collaborator contracts and an in-memory implementation.
//!
//! The lifecycle manager reads and writes requests only through
//! [`RequestStore`]; it never keeps its own copies between calls. Durable
//! backends implement the same traits.

use crate::error::{Error, Result};
use crate::request::{RequestStatus, VerificationRequest};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Selects requests by any combination of identifiers. At least one must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilter {
    /// Request identifier.
    #[serde(rename = "requestid", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Subject user.
    #[serde(rename = "userid", default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// Requesting provider.
    #[serde(rename = "providerid", default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
}

impl RequestFilter {
    /// Match one request by id.
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Match every request about a subject.
    #[must_use]
    pub fn by_subject(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: Some(subject_id.into()),
            ..Self::default()
        }
    }

    /// Match every request made by a provider.
    #[must_use]
    pub fn by_requester(requester_id: impl Into<String>) -> Self {
        Self {
            requester_id: Some(requester_id.into()),
            ..Self::default()
        }
    }

    /// Whether no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.subject_id.is_none() && self.requester_id.is_none()
    }

    /// Whether `request` satisfies every set field.
    #[must_use]
    pub fn matches(&self, request: &VerificationRequest) -> bool {
        self.id.as_ref().map_or(true, |v| *v == request.id)
            && self
                .subject_id
                .as_ref()
                .map_or(true, |v| *v == request.subject_id)
            && self
                .requester_id
                .as_ref()
                .map_or(true, |v| *v == request.requester_id)
    }
}

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User identifier; empty on first upsert.
    #[serde(rename = "userid")]
    pub id: String,
    /// Login email.
    pub email: String,
    /// Password hash.
    #[serde(rename = "hashedpassword")]
    pub hashed_password: String,
    /// Password salt.
    pub salt: String,
}

/// A provider (verifier) account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    /// Provider identifier; empty on first upsert.
    #[serde(rename = "providerid")]
    pub id: String,
    /// Login email.
    pub email: String,
    /// Registered company name.
    #[serde(rename = "registeredname")]
    pub registered_name: String,
    /// Password hash.
    #[serde(rename = "hashedpassword")]
    pub hashed_password: String,
    /// Password salt.
    pub salt: String,
}

/// Storage of verification requests.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new request.
    ///
    /// # Errors
    ///
    /// [`Error::Storage`] if the id is already taken.
    async fn create_request(&self, request: VerificationRequest) -> Result<VerificationRequest>;

    /// Replace a stored request. Identifier, requester and subject must not
    /// change, a status change must follow the transition table, and a
    /// request in a terminal state cannot be modified at all.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`], [`Error::InvalidTransition`] or [`Error::Storage`].
    async fn update_request(&self, request: VerificationRequest) -> Result<VerificationRequest>;

    /// Requests matching `filter`, oldest first.
    ///
    /// # Errors
    ///
    /// [`Error::Storage`] if the filter is empty.
    async fn get_requests(&self, filter: &RequestFilter) -> Result<Vec<VerificationRequest>>;

    /// Atomically move `id` from `expected` to `next`, provided the record is
    /// still at `revision`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`], [`Error::InvalidTransition`] if the stored
    /// status is not `expected` or the move is not allowed, and
    /// [`Error::Conflict`] if the record was rewritten since `revision`.
    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: RequestStatus,
        revision: u64,
        next: RequestStatus,
    ) -> Result<VerificationRequest>;
}

/// Storage of user and provider accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert or replace a user; an empty id is assigned a fresh one.
    ///
    /// # Errors
    ///
    /// [`Error::Storage`] if the email belongs to another user.
    async fn upsert_user(&self, user: User) -> Result<User>;

    /// Look up a user by email.
    ///
    /// # Errors
    ///
    /// Backend failures only; a miss is `Ok(None)`.
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Insert or replace a provider; an empty id is assigned a fresh one.
    ///
    /// # Errors
    ///
    /// [`Error::Storage`] if the email belongs to another provider.
    async fn upsert_provider(&self, provider: Provider) -> Result<Provider>;

    /// Look up a provider by email.
    ///
    /// # Errors
    ///
    /// Backend failures only; a miss is `Ok(None)`.
    async fn get_provider_by_email(&self, email: &str) -> Result<Option<Provider>>;
}

#[derive(Default)]
struct Tables {
    requests: HashMap<String, VerificationRequest>,
    users: HashMap<String, User>,
    providers: HashMap<String, Provider>,
}

/// In-memory [`RequestStore`] and [`AccountStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemoryStore")
            .field("requests", &tables.requests.len())
            .field("users", &tables.users.len())
            .field("providers", &tables.providers.len())
            .finish()
    }
}

fn fresh_id(id: String) -> String {
    if id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        id
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create_request(&self, request: VerificationRequest) -> Result<VerificationRequest> {
        let mut tables = self.tables.write();
        if tables.requests.contains_key(&request.id) {
            return Err(Error::Storage(format!("request {} already exists", request.id)));
        }
        tables.requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn update_request(&self, request: VerificationRequest) -> Result<VerificationRequest> {
        let mut tables = self.tables.write();
        let stored = tables
            .requests
            .get(&request.id)
            .ok_or_else(|| Error::NotFound(format!("request {}", request.id)))?;

        if stored.requester_id != request.requester_id || stored.subject_id != request.subject_id {
            return Err(Error::Storage(format!(
                "request {}: requester and subject are immutable",
                request.id
            )));
        }
        if stored.status != request.status || stored.status.is_terminal() {
            stored.check_transition(request.status)?;
        }
        if stored.revision != request.revision {
            return Err(Error::Conflict {
                id: request.id,
                expected: request.revision,
                found: stored.revision,
            });
        }

        let request = VerificationRequest {
            revision: stored.revision + 1,
            ..request
        };
        tables.requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn get_requests(&self, filter: &RequestFilter) -> Result<Vec<VerificationRequest>> {
        if filter.is_empty() {
            return Err(Error::Storage("request filter has no fields set".to_string()));
        }
        let tables = self.tables.read();
        let mut found: Vec<_> = tables
            .requests
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: RequestStatus,
        revision: u64,
        next: RequestStatus,
    ) -> Result<VerificationRequest> {
        let mut tables = self.tables.write();
        let stored = tables
            .requests
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("request {id}")))?;

        if stored.status != expected {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: stored.status,
                to: next,
            });
        }
        if stored.revision != revision {
            return Err(Error::Conflict {
                id: id.to_string(),
                expected: revision,
                found: stored.revision,
            });
        }
        stored.transition(next)?;
        Ok(stored.clone())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn upsert_user(&self, user: User) -> Result<User> {
        let user = User {
            id: fresh_id(user.id),
            ..user
        };
        let mut tables = self.tables.write();
        if tables
            .users
            .values()
            .any(|u| u.email == user.email && u.id != user.id)
        {
            return Err(Error::Storage(format!("email {} already registered", user.email)));
        }
        tables.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .tables
            .read()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn upsert_provider(&self, provider: Provider) -> Result<Provider> {
        let provider = Provider {
            id: fresh_id(provider.id),
            ..provider
        };
        let mut tables = self.tables.write();
        if tables
            .providers
            .values()
            .any(|p| p.email == provider.email && p.id != provider.id)
        {
            return Err(Error::Storage(format!(
                "email {} already registered",
                provider.email
            )));
        }
        tables.providers.insert(provider.id.clone(), provider.clone());
        Ok(provider)
    }

    async fn get_provider_by_email(&self, email: &str) -> Result<Option<Provider>> {
        Ok(self
            .tables
            .read()
            .providers
            .values()
            .find(|p| p.email == email)
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::criteria::Criteria;
    use tokio_test::block_on;

    fn request(requester: &str, subject: &str) -> VerificationRequest {
        VerificationRequest::new(requester, subject, "Acme", Criteria::default())
    }

    #[test]
    fn test_empty_filter_is_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            block_on(store.get_requests(&RequestFilter::default())),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn test_filters() {
        let store = MemoryStore::new();
        let a = block_on(store.create_request(request("p1", "u1"))).unwrap();
        block_on(store.create_request(request("p1", "u2"))).unwrap();
        block_on(store.create_request(request("p2", "u1"))).unwrap();

        assert_eq!(block_on(store.get_requests(&RequestFilter::by_requester("p1"))).unwrap().len(), 2);
        assert_eq!(block_on(store.get_requests(&RequestFilter::by_subject("u1"))).unwrap().len(), 2);
        let by_id = block_on(store.get_requests(&RequestFilter::by_id(&a.id))).unwrap();
        assert_eq!(by_id, vec![a]);

        let both = RequestFilter {
            requester_id: Some("p2".to_string()),
            subject_id: Some("u2".to_string()),
            ..RequestFilter::default()
        };
        assert!(block_on(store.get_requests(&both)).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_create_fails() {
        let store = MemoryStore::new();
        let r = request("p1", "u1");
        block_on(store.create_request(r.clone())).unwrap();
        assert!(matches!(block_on(store.create_request(r)), Err(Error::Storage(_))));
    }

    #[test]
    fn test_update_unknown_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            block_on(store.update_request(request("p1", "u1"))),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_update_cannot_touch_terminal_records() {
        let store = MemoryStore::new();
        let r = block_on(store.create_request(request("p1", "u1"))).unwrap();
        block_on(store.compare_and_set_status(
            &r.id,
            RequestStatus::Pending,
            r.revision,
            RequestStatus::Rejected,
        ))
        .unwrap();

        let mut revived = r.clone();
        revived.status = RequestStatus::Pending;
        assert!(matches!(
            block_on(store.update_request(revived)),
            Err(Error::InvalidTransition { .. })
        ));

        let mut renamed = r;
        renamed.status = RequestStatus::Rejected;
        renamed.display_name = "Other".to_string();
        assert!(matches!(
            block_on(store.update_request(renamed)),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_update_cannot_change_subject() {
        let store = MemoryStore::new();
        let mut r = block_on(store.create_request(request("p1", "u1"))).unwrap();
        r.subject_id = "u2".to_string();
        assert!(matches!(block_on(store.update_request(r)), Err(Error::Storage(_))));
    }

    #[test]
    fn test_compare_and_set_commits_once() {
        let store = MemoryStore::new();
        let r = block_on(store.create_request(request("p1", "u1"))).unwrap();

        let first = block_on(store.compare_and_set_status(
            &r.id,
            RequestStatus::Pending,
            r.revision,
            RequestStatus::Accepted,
        ))
        .unwrap();
        assert_eq!(first.status, RequestStatus::Accepted);

        let second = block_on(store.compare_and_set_status(
            &r.id,
            RequestStatus::Pending,
            r.revision,
            RequestStatus::Rejected,
        ));
        assert!(matches!(
            second,
            Err(Error::InvalidTransition {
                from: RequestStatus::Accepted,
                ..
            })
        ));
    }

    #[test]
    fn test_stale_writes_conflict() {
        let store = MemoryStore::new();
        let r = block_on(store.create_request(request("p1", "u1"))).unwrap();

        let mut amended = r.clone();
        amended.display_name = "Acme Ltd".to_string();
        let amended = block_on(store.update_request(amended)).unwrap();
        assert_eq!(amended.revision, r.revision + 1);

        // Both a status commit and an update based on the old read must fail.
        assert!(matches!(
            block_on(store.compare_and_set_status(
                &r.id,
                RequestStatus::Pending,
                r.revision,
                RequestStatus::Accepted,
            )),
            Err(Error::Conflict { .. })
        ));
        assert!(matches!(
            block_on(store.update_request(r.clone())),
            Err(Error::Conflict { .. })
        ));

        let stored = block_on(store.get_requests(&RequestFilter::by_id(&r.id))).unwrap();
        assert_eq!(stored[0].status, RequestStatus::Pending);
        assert_eq!(stored[0].display_name, "Acme Ltd");
    }

    #[test]
    fn test_accounts() {
        let store = MemoryStore::new();
        let user = block_on(store.upsert_user(User {
            id: String::new(),
            email: "jacob@example.com".to_string(),
            hashed_password: "h".to_string(),
            salt: "s".to_string(),
        }))
        .unwrap();
        assert!(!user.id.is_empty());

        let found = block_on(store.get_user_by_email("jacob@example.com")).unwrap();
        assert_eq!(found, Some(user.clone()));
        assert!(block_on(store.get_user_by_email("nobody@example.com")).unwrap().is_none());

        let clash = User {
            id: String::new(),
            ..user
        };
        assert!(matches!(block_on(store.upsert_user(clash)), Err(Error::Storage(_))));

        let provider = block_on(store.upsert_provider(Provider {
            id: String::new(),
            email: "kyc@acme.test".to_string(),
            registered_name: "Acme".to_string(),
            hashed_password: "h".to_string(),
            salt: "s".to_string(),
        }))
        .unwrap();
        assert_eq!(
            block_on(store.get_provider_by_email("kyc@acme.test")).unwrap(),
            Some(provider)
        );
    }
}
