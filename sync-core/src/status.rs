//! Listing-request lifecycle.
//!
//! ```text
//! pending ──accept──► accepted ──start──► in_progress ──submit_report──► awaiting_client_confirmation
//!    │                   │                    │                                   │
//!    └─reject─► rejected  └──────── cancel_* / expire ────────┘                  confirm
//!                                                                                 ▼
//!                                                    completed ◄──pay── awaiting_payment
//! ```
//!
//! Every non-terminal state may move to a cancelled variant. `completed`,
//! `rejected` and the cancelled variants are terminal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
    CancelledByClient,
    CancelledByProvider,
    InProgress,
    AwaitingClientConfirmation,
    AwaitingPayment,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestAction {
    Accept,
    Reject,
    Start,
    SubmitReport,
    Confirm,
    Pay,
    CancelByClient,
    CancelByProvider,
    /// Issued by the expiration sweep only.
    Expire,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("request is already {0} and cannot change")]
    Terminal(RequestStatus),
    #[error("cannot {action:?} a request that is {from}")]
    NotAllowed {
        from: RequestStatus,
        action: RequestAction,
    },
    #[error("unknown request status: {0}")]
    UnknownStatus(String),
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 10] = [
        RequestStatus::Pending,
        RequestStatus::Accepted,
        RequestStatus::Rejected,
        RequestStatus::Cancelled,
        RequestStatus::CancelledByClient,
        RequestStatus::CancelledByProvider,
        RequestStatus::InProgress,
        RequestStatus::AwaitingClientConfirmation,
        RequestStatus::AwaitingPayment,
        RequestStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::CancelledByClient => "cancelled_by_client",
            RequestStatus::CancelledByProvider => "cancelled_by_provider",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::AwaitingClientConfirmation => "awaiting_client_confirmation",
            RequestStatus::AwaitingPayment => "awaiting_payment",
            RequestStatus::Completed => "completed",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            RequestStatus::Cancelled
                | RequestStatus::CancelledByClient
                | RequestStatus::CancelledByProvider
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_cancelled() || matches!(self, RequestStatus::Completed | RequestStatus::Rejected)
    }

    /// Position along the happy path. Terminal states share the last stage.
    pub fn stage(&self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Accepted => 1,
            RequestStatus::InProgress => 2,
            RequestStatus::AwaitingClientConfirmation => 3,
            RequestStatus::AwaitingPayment => 4,
            RequestStatus::Completed
            | RequestStatus::Rejected
            | RequestStatus::Cancelled
            | RequestStatus::CancelledByClient
            | RequestStatus::CancelledByProvider => 5,
        }
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_cancelled() {
            return true;
        }
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Accepted)
                | (RequestStatus::Pending, RequestStatus::Rejected)
                | (RequestStatus::Accepted, RequestStatus::InProgress)
                | (RequestStatus::InProgress, RequestStatus::AwaitingClientConfirmation)
                | (RequestStatus::AwaitingClientConfirmation, RequestStatus::AwaitingPayment)
                | (RequestStatus::AwaitingPayment, RequestStatus::Completed)
        )
    }

    pub fn apply(self, action: RequestAction) -> Result<RequestStatus, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal(self));
        }

        let next = match action {
            RequestAction::Accept => RequestStatus::Accepted,
            RequestAction::Reject => RequestStatus::Rejected,
            RequestAction::Start => RequestStatus::InProgress,
            RequestAction::SubmitReport => RequestStatus::AwaitingClientConfirmation,
            RequestAction::Confirm => RequestStatus::AwaitingPayment,
            RequestAction::Pay => RequestStatus::Completed,
            RequestAction::CancelByClient => RequestStatus::CancelledByClient,
            RequestAction::CancelByProvider => RequestStatus::CancelledByProvider,
            RequestAction::Expire => {
                if !matches!(self, RequestStatus::Pending | RequestStatus::Accepted) {
                    return Err(TransitionError::NotAllowed { from: self, action });
                }
                RequestStatus::CancelledByProvider
            }
        };

        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::NotAllowed { from: self, action })
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TransitionError::UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut status = RequestStatus::Pending;
        for action in [
            RequestAction::Accept,
            RequestAction::Start,
            RequestAction::SubmitReport,
            RequestAction::Confirm,
            RequestAction::Pay,
        ] {
            status = status.apply(action).unwrap();
        }
        assert_eq!(status, RequestStatus::Completed);
        assert!(status.is_terminal());
    }

    #[test]
    fn test_completed_is_terminal() {
        let err = RequestStatus::Completed
            .apply(RequestAction::CancelByClient)
            .unwrap_err();
        assert_eq!(err, TransitionError::Terminal(RequestStatus::Completed));
        for next in RequestStatus::ALL {
            assert!(!RequestStatus::Completed.can_transition_to(next));
        }
    }

    #[test]
    fn test_every_non_terminal_state_can_cancel() {
        for status in RequestStatus::ALL.iter().filter(|s| !s.is_terminal()) {
            assert_eq!(
                status.apply(RequestAction::CancelByProvider),
                Ok(RequestStatus::CancelledByProvider)
            );
            assert!(status.can_transition_to(RequestStatus::Cancelled));
        }
    }

    #[test]
    fn test_no_skipping_stages() {
        assert!(RequestStatus::Pending.apply(RequestAction::Start).is_err());
        assert!(RequestStatus::Accepted.apply(RequestAction::Pay).is_err());
        assert!(!RequestStatus::InProgress.can_transition_to(RequestStatus::Accepted));
    }

    #[test]
    fn test_expire_only_from_pending_or_accepted() {
        assert_eq!(
            RequestStatus::Pending.apply(RequestAction::Expire),
            Ok(RequestStatus::CancelledByProvider)
        );
        assert_eq!(
            RequestStatus::Accepted.apply(RequestAction::Expire),
            Ok(RequestStatus::CancelledByProvider)
        );
        assert!(RequestStatus::InProgress.apply(RequestAction::Expire).is_err());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in RequestStatus::ALL {
            assert_eq!(status.as_str().parse::<RequestStatus>(), Ok(status));
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::json!(status.as_str()));
        }
        assert!("archived".parse::<RequestStatus>().is_err());
    }
}
