// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{FragmentPayload, Transport};
use crate::errors::TransportError;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream::{self, BoxStream},
};
use tracing::debug;

/// A transport that serves a report directory on the local filesystem.
///
/// Manifests are plain JSON files. Fragment files are JSON lines, one
/// `{"revision": n, "payload": ...}` object per line. The writer appends to
/// fragment files while the run is live, so a final line without a
/// terminating newline is treated as not yet written.
#[derive(Clone, Debug)]
pub struct FsTransport {
    root: Utf8PathBuf,
}

impl FsTransport {
    /// Creates a transport rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the report root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

impl Transport for FsTransport {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Bytes, TransportError>> {
        let full_path = self.root.join(path);
        async move {
            tokio::fs::read(&full_path)
                .await
                .map(Bytes::from)
                .map_err(|error| TransportError::Read {
                    path: full_path,
                    error,
                })
        }
        .boxed()
    }

    fn fetch_fragment(
        &self,
        path: &str,
    ) -> BoxStream<'static, Result<FragmentPayload, TransportError>> {
        let path = path.to_owned();
        let full_path = self.root.join(&path);
        stream::once(async move {
            match tokio::fs::read(&full_path).await {
                Ok(data) => decode_fragment_lines(&path, &data),
                Err(error) => vec![Err(TransportError::Read {
                    path: full_path,
                    error,
                })],
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

fn decode_fragment_lines(
    path: &str,
    data: &[u8],
) -> Vec<Result<FragmentPayload, TransportError>> {
    let mut lines: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
    // The last element is empty if the data ends with a newline, and a
    // partially written line otherwise.
    if let Some(partial) = lines.pop()
        && !partial.is_empty()
    {
        debug!(
            path,
            len = partial.len(),
            "ignoring partially written fragment line"
        );
    }

    lines
        .into_iter()
        .enumerate()
        .filter(|(_, line)| !line.trim_ascii().is_empty())
        .map(|(index, line)| {
            serde_json::from_slice(line).map_err(|error| TransportError::DecodeFragment {
                path: path.to_owned(),
                line: index + 1,
                error,
            })
        })
        .collect()
}
