//! License Status Document (LSD) returned by the distributor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Media type of a License Status Document
pub const STATUS_DOCUMENT_TYPE: &str = "application/vnd.readium.license.status.v1.0+json";

/// Lifecycle state of a remote license grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    /// Available but not yet fulfilled on any device
    Ready,
    /// Fulfilled on at least one device
    Active,
    Revoked,
    /// Returned early by the patron
    Returned,
    /// Returned before ever being fulfilled
    Cancelled,
    Expired,
}

impl LoanStatus {
    pub const ALL: [LoanStatus; 6] = [
        LoanStatus::Ready,
        LoanStatus::Active,
        LoanStatus::Revoked,
        LoanStatus::Returned,
        LoanStatus::Cancelled,
        LoanStatus::Expired,
    ];

    pub fn is_active(self) -> bool {
        matches!(self, LoanStatus::Ready | LoanStatus::Active)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoanStatus::Ready => "ready",
            LoanStatus::Active => "active",
            LoanStatus::Revoked => "revoked",
            LoanStatus::Returned => "returned",
            LoanStatus::Cancelled => "cancelled",
            LoanStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusLink {
    pub rel: String,
    pub href: String,
    #[serde(rename = "type", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub templated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PotentialRights {
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

/// Parsed and validated status document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    #[serde(default)]
    pub id: Option<String>,
    pub status: LoanStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub updated: Option<serde_json::Value>,
    #[serde(default)]
    pub links: Vec<StatusLink>,
    #[serde(default)]
    pub potential_rights: PotentialRights,
}

impl StatusDocument {
    /// First link with the given relation
    pub fn link(&self, rel: &str) -> Option<&StatusLink> {
        self.links.iter().find(|l| l.rel == rel)
    }

    /// First link with the given relation and media type
    pub fn link_of_type(&self, rel: &str, media_type: &str) -> Option<&StatusLink> {
        self.links
            .iter()
            .find(|l| l.rel == rel && l.media_type.as_deref() == Some(media_type))
    }

    /// The canonical URL of this document (its `self` link)
    pub fn self_href(&self) -> Option<&str> {
        self.link("self").map(|l| l.href.as_str())
    }
}
