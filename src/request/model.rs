//! Verification request record and its state machine.
//!
//! ```text
//! Pending ──▶ Accepted   (terminal)
//!    │  └───▶ Rejected   (terminal)
//!    └──────▶ Cancelled  (terminal)
//! ```

use crate::criteria::Criteria;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a [`VerificationRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Awaiting the subject's decision. The only initial state.
    Pending,
    /// The subject accepted; a verification round was dispatched.
    Accepted,
    /// The subject declined.
    Rejected,
    /// Withdrawn before a decision.
    Cancelled,
}

impl RequestStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The transition table.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Accepted | Self::Rejected | Self::Cancelled)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Accepted => "Accepted",
            Self::Rejected => "Rejected",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// The subject's answer to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Accept: run the verification round.
    Accept,
    /// Reject.
    Reject,
}

impl Decision {
    /// Status a request moves to on this decision.
    #[must_use]
    pub fn target_status(self) -> RequestStatus {
        match self {
            Self::Accept => RequestStatus::Accepted,
            Self::Reject => RequestStatus::Rejected,
        }
    }
}

/// A provider's request to verify criteria against a user's record.
///
/// Identifier, requester and subject never change after creation; status
/// moves only along the transition table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    /// Request identifier.
    #[serde(rename = "requestid")]
    pub id: String,
    /// Requesting provider.
    #[serde(rename = "providerid")]
    pub requester_id: String,
    /// Subject user.
    #[serde(rename = "userid")]
    pub subject_id: String,
    /// Provider's display name.
    #[serde(rename = "companyname")]
    pub display_name: String,
    /// What is being asked.
    #[serde(rename = "datarequests")]
    pub criteria: Criteria,
    /// Current status.
    pub status: RequestStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last change.
    pub updated_at: DateTime<Utc>,
    /// Bumped by the store on every write; guards commits against concurrent
    /// amendments.
    #[serde(default)]
    pub revision: u64,
}

impl VerificationRequest {
    /// New `Pending` request with a fresh identifier.
    #[must_use]
    pub fn new(
        requester_id: impl Into<String>,
        subject_id: impl Into<String>,
        display_name: impl Into<String>,
        criteria: Criteria,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requester_id: requester_id.into(),
            subject_id: subject_id.into(),
            display_name: display_name.into(),
            criteria,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Move to `next`, or report why not.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`]; the record is left unchanged.
    pub fn transition(&mut self, next: RequestStatus) -> Result<()> {
        self.check_transition(next)?;
        self.status = next;
        self.updated_at = Utc::now();
        self.revision += 1;
        Ok(())
    }

    /// Whether `next` is reachable from the current status.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`].
    pub fn check_transition(&self, next: RequestStatus) -> Result<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            })
        }
    }
}
