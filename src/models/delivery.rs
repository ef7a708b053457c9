//! Delivery mechanisms and fulfillment strategies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::license::PoolAccess;

pub const LCP_DRM: &str = "application/vnd.readium.lcp.license.v1.0+json";
pub const ADOBE_DRM: &str = "application/vnd.adobe.adept+xml";
pub const FEEDBOOKS_AUDIOBOOK_DRM: &str = "http://www.feedbooks.com/audiobooks/access-restriction";
pub const BEARER_TOKEN: &str = "application/vnd.librarysimplified.bearer-token+json";
/// Link type DeMarque uses for audiobook manifests
pub const FEEDBOOKS_AUDIO: &str =
    "application/audiobook+json; protection=http://www.feedbooks.com/audiobooks/access-restriction";

/// DRM scheme of a delivery mechanism
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrmScheme {
    NoDrm,
    Lcp,
    Adobe,
    FeedbooksAudiobook,
    BearerToken,
    Other(String),
}

impl DrmScheme {
    /// Map a stored DRM URI (or `None`) to a scheme
    pub fn from_uri(uri: Option<&str>) -> Self {
        match uri {
            None => DrmScheme::NoDrm,
            Some(LCP_DRM) => DrmScheme::Lcp,
            Some(ADOBE_DRM) => DrmScheme::Adobe,
            Some(FEEDBOOKS_AUDIOBOOK_DRM) => DrmScheme::FeedbooksAudiobook,
            Some(BEARER_TOKEN) => DrmScheme::BearerToken,
            Some(other) => DrmScheme::Other(other.to_string()),
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match self {
            DrmScheme::NoDrm => None,
            DrmScheme::Lcp => Some(LCP_DRM),
            DrmScheme::Adobe => Some(ADOBE_DRM),
            DrmScheme::FeedbooksAudiobook => Some(FEEDBOOKS_AUDIOBOOK_DRM),
            DrmScheme::BearerToken => Some(BEARER_TOKEN),
            DrmScheme::Other(uri) => Some(uri.as_str()),
        }
    }
}

/// Stored delivery mechanism row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DeliveryMechanismRow {
    pub id: i32,
    pub license_pool_id: i32,
    pub content_type: Option<String>,
    pub drm_scheme: Option<String>,
    pub resource_url: Option<String>,
}

/// A format a pool can be delivered in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMechanism {
    pub content_type: Option<String>,
    pub drm_scheme: DrmScheme,
    /// Direct content URL, for open-access and unlimited pools
    pub resource_url: Option<String>,
}

impl DeliveryMechanism {
    pub fn new(content_type: Option<&str>, drm_scheme: DrmScheme) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            drm_scheme,
            resource_url: None,
        }
    }

    /// Same format, ignoring where the content lives
    pub fn same_format(&self, other: &DeliveryMechanism) -> bool {
        self.content_type == other.content_type && self.drm_scheme == other.drm_scheme
    }
}

impl From<DeliveryMechanismRow> for DeliveryMechanism {
    fn from(row: DeliveryMechanismRow) -> Self {
        Self {
            content_type: row.content_type,
            drm_scheme: DrmScheme::from_uri(row.drm_scheme.as_deref()),
            resource_url: row.resource_url,
        }
    }
}

/// How a loan's content reaches the patron
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentStrategy {
    /// Redirect straight to the pool's resource
    OpenAccessRedirect,
    /// Hand the resource location to the web layer for a bearer-token document
    BearerToken,
    /// DRM-free file linked from the status document
    PublicationLink { content_type: Option<String> },
    /// DeMarque audiobook manifest linked from the status document
    AudiobookManifest,
    /// DRM license document of the given type
    LicenseDocument { drm_type: String },
}

impl FulfillmentStrategy {
    pub fn select(access: PoolAccess, mechanism: &DeliveryMechanism) -> Self {
        match (access, &mechanism.drm_scheme) {
            (PoolAccess::OpenAccess | PoolAccess::Unlimited, DrmScheme::BearerToken) => {
                FulfillmentStrategy::BearerToken
            }
            (PoolAccess::OpenAccess | PoolAccess::Unlimited, _) => {
                FulfillmentStrategy::OpenAccessRedirect
            }
            (PoolAccess::Licensed, DrmScheme::NoDrm) => FulfillmentStrategy::PublicationLink {
                content_type: mechanism.content_type.clone(),
            },
            (PoolAccess::Licensed, DrmScheme::FeedbooksAudiobook) => {
                FulfillmentStrategy::AudiobookManifest
            }
            (PoolAccess::Licensed, scheme) => FulfillmentStrategy::LicenseDocument {
                drm_type: scheme.uri().unwrap_or_default().to_string(),
            },
        }
    }

    /// Link relation and media type to look for in a status document
    pub fn status_link(&self) -> Option<(&'static str, Option<&str>)> {
        match self {
            FulfillmentStrategy::PublicationLink { content_type } => {
                Some(("publication", content_type.as_deref()))
            }
            FulfillmentStrategy::AudiobookManifest => Some(("manifest", Some(FEEDBOOKS_AUDIO))),
            FulfillmentStrategy::LicenseDocument { drm_type } => {
                Some(("license", Some(drm_type.as_str())))
            }
            FulfillmentStrategy::OpenAccessRedirect | FulfillmentStrategy::BearerToken => None,
        }
    }
}

/// What the caller needs to deliver content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fulfillment {
    /// Send the patron to the URL
    Redirect {
        url: String,
        content_type: Option<String>,
    },
    /// Fetch the URL server-side and relay the document
    Fetch {
        url: String,
        content_type: Option<String>,
        expires: Option<DateTime<Utc>>,
    },
    /// Wrap the location in a bearer-token document
    BearerToken { location: String },
}
