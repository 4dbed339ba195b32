//! Work items submitted to the orchestrator.
//!
//! A [`WorkItem`] is immutable once created. Its [`ItemMetadata`] is used for
//! reporting only and never influences fetch behavior.

use serde::{Deserialize, Serialize};

/// Descriptive metadata carried alongside a work item.
///
/// `title` is required; everything else is optional so malformed upstream
/// records fail at deserialization instead of propagating empty values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Human-readable title of the paper.
    pub title: String,
    /// Venue or source collection, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    /// Publication year, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    /// DOI, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
}

impl ItemMetadata {
    /// Creates metadata with only a title.
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            venue: None,
            year: None,
            doi: None,
        }
    }
}

/// One remote item to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Opaque, stable identifier (also the storage key).
    pub id: String,
    /// Target URL of the PDF.
    pub url: String,
    /// Rate-limiter endpoint this item is fetched through. Falls back to the
    /// orchestrator's default endpoint when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Reporting metadata.
    pub metadata: ItemMetadata,
}

impl WorkItem {
    /// Creates a work item with a title-only metadata bag.
    #[must_use]
    pub fn new(id: impl Into<String>, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            endpoint: None,
            metadata: ItemMetadata::titled(title),
        }
    }

    /// Routes this item through a named rate-limiter endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Returns the item's title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.metadata.title
    }
}
