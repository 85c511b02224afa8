// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The transport abstraction used to reach a report's data source.

mod fs;

pub use fs::FsTransport;

use crate::{errors::TransportError, manifest::Revision};
use bytes::Bytes;
use futures::{future::BoxFuture, stream::BoxStream};
use serde::Deserialize;
use serde_json::Value;

/// One revision of a fragment, as streamed by a transport.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FragmentPayload {
    /// The revision index of this payload.
    pub revision: Revision,

    /// The payload. An array carries one record per element.
    pub payload: Value,
}

/// Performs requests against a report's data source.
///
/// Requests are cancelled by dropping the returned future or stream.
pub trait Transport: Send + Sync + 'static {
    /// Fetches the document at `path` (used for manifests).
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Bytes, TransportError>>;

    /// Streams the revisions of the fragment at `path`.
    ///
    /// The source may re-send revisions that were already seen and makes no
    /// ordering guarantee.
    fn fetch_fragment(
        &self,
        path: &str,
    ) -> BoxStream<'static, Result<FragmentPayload, TransportError>>;
}
