//! A single logical request to the provider.

use serde::Serialize;

use crate::fingerprint::{Fingerprint, Params, normalize_endpoint};

/// An endpoint plus its normalized parameters.
///
/// The fingerprint is computed once at construction; requests are
/// immutable afterwards so it can never drift from its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchRequest {
    endpoint: String,
    params: Params,
    fingerprint: Fingerprint,
}

impl FetchRequest {
    pub fn new(endpoint: impl AsRef<str>, params: Params) -> Self {
        let endpoint = normalize_endpoint(endpoint.as_ref()).to_string();
        let fingerprint = Fingerprint::compute(&endpoint, &params);
        Self {
            endpoint,
            params,
            fingerprint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}
