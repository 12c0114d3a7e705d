//! Request classification.

use std::collections::HashSet;

use serde::Serialize;
use swkit_net::{Destination, Request};
use url::{Origin, Url};

/// Which strategy family a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestClass {
    NavigationDocument,
    DeclaredStaticAsset,
    CrossOriginResource,
    Other,
}

impl RequestClass {
    pub const ALL: [RequestClass; 4] = [
        RequestClass::NavigationDocument,
        RequestClass::DeclaredStaticAsset,
        RequestClass::CrossOriginResource,
        RequestClass::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NavigationDocument => "navigation-document",
            Self::DeclaredStaticAsset => "declared-static-asset",
            Self::CrossOriginResource => "cross-origin-resource",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for RequestClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies requests against the page origin and the declared asset list.
///
/// Depends only on the request's URL and destination; first match wins.
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Origin,
    static_assets: HashSet<String>,
}

impl Classifier {
    pub fn new(origin: &Url, static_assets: &[Url]) -> Self {
        Self {
            origin: origin.origin(),
            static_assets: static_assets
                .iter()
                .map(|url| {
                    let mut url = url.clone();
                    url.set_fragment(None);
                    url.to_string()
                })
                .collect(),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn classify(&self, request: &Request) -> RequestClass {
        if request.destination == Destination::Document {
            RequestClass::NavigationDocument
        } else if self.static_assets.contains(request.normalized_url().as_str()) {
            RequestClass::DeclaredStaticAsset
        } else if request.url.origin() != self.origin {
            RequestClass::CrossOriginResource
        } else {
            RequestClass::Other
        }
    }
}
