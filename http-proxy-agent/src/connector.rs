// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::{IntoProxyOptions, ProxyDescriptor};
use crate::error::Error;
use crate::request::{Destination, ProxiedRequest};
use crate::transport::{self, Transport};
use base64::{engine::general_purpose, Engine as _};
use bytes::{BufMut, BytesMut};
use http::header::HeaderValue;
use http::Uri;
use log::{debug, warn};
use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Arc;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const DEFAULT_HTTP_PORT: u16 = 80;

pub type Result<T> = core::result::Result<T, Error>;

/// Connects outgoing HTTP requests to their destination through an HTTP
/// proxy.
///
/// For every request the `Connector` rewrites the request target to the
/// absolute form a proxy expects, adds the `Proxy-Authorization` header when
/// credentials are configured, and opens a connection to the proxy. One
/// connection is opened per request. Clones share the same proxy descriptor.
#[derive(Clone)]
pub struct Connector {
    proxy: Arc<ProxyDescriptor>,
    authorization: Option<HeaderValue>,
}

impl Connector {
    /// Creates a connector for a proxy URL or `ProxyOptions`.
    pub fn new(proxy: impl IntoProxyOptions) -> Result<Self> {
        Ok(Connector::from_descriptor(ProxyDescriptor::resolve(proxy)?))
    }

    pub fn from_descriptor(proxy: ProxyDescriptor) -> Self {
        let authorization = proxy.auth().map(proxy_authorization);
        debug!("Creating new Connector instance: {:?}", proxy);
        Connector { proxy: Arc::new(proxy), authorization }
    }

    pub fn proxy(&self) -> &ProxyDescriptor {
        &self.proxy
    }

    /// Rewrites the request target to absolute form and injects proxy
    /// credentials.
    pub fn prepare<R>(&self, request: &mut R, destination: &Destination) -> Result<()>
    where
        R: ProxiedRequest + ?Sized,
    {
        let target = absolute_target(request.target(), destination)?;
        debug!("Rewriting request target {} to {}", request.target(), target);
        request.set_target(target);

        if let Some(authorization) = &self.authorization {
            request.set_proxy_authorization(authorization.clone());
        }
        Ok(())
    }

    /// Prepares `request` for the proxy and opens a connection to it.
    ///
    /// A header block the request serialized before this call is
    /// regenerated and patched into its queued output. Transport errors are
    /// returned unchanged; nothing is retried.
    pub async fn connect<R>(&self, request: &mut R, destination: &Destination) -> Result<Transport>
    where
        R: ProxiedRequest + ?Sized,
    {
        self.prepare(request, destination)?;

        let proxy = &self.proxy;
        let transport =
            transport::open(proxy.host(), proxy.port(), proxy.is_secure(), proxy.transport_options())
                .await?;

        reconcile_header(request);
        Ok(transport)
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connector").field("proxy", &self.proxy).finish()
    }
}

/// Regenerates a header block that was frozen before the request was
/// prepared, and splices it over the stale copy at the front of the first
/// queued write chunk. Body bytes after the stale header are kept as is.
pub fn reconcile_header<R>(request: &mut R)
where
    R: ProxiedRequest + ?Sized,
{
    if !request.is_header_frozen() {
        return;
    }
    debug!("Regenerating stored HTTP header for request");
    let header = request.refreeze_header();

    let Some(first) = request.first_queued_chunk() else {
        return;
    };
    match find_header_end(first) {
        Some(end) => {
            debug!("Patching queued output with updated header");
            let mut patched = BytesMut::with_capacity(header.len() + first.len() - end);
            patched.put_slice(&header);
            patched.put_slice(&first[end..]);
            *first = patched;
        }
        None => warn!("Queued output has no header terminator, leaving it untouched"),
    }
}

/// Offset just past the first `\r\n\r\n` in `buf`.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Completes `target` into an absolute-form URL using the destination for
/// whatever the target leaves out. Port 80 is never rendered.
///
/// Userinfo and fragments of an already absolute target are not carried
/// over: neither may appear in a request line.
fn absolute_target(target: &str, destination: &Destination) -> Result<String> {
    let invalid = || Error::InvalidTarget(target.to_owned());
    let uri: Uri = target.parse().map_err(|_| invalid())?;

    let scheme = uri.scheme_str().unwrap_or("http");
    let host = match uri.host() {
        Some(host) => bracket_ipv6(host),
        None => bracket_ipv6(destination.hostname().ok_or_else(invalid)?),
    };
    let path = match uri.path() {
        path if path.starts_with('/') => path.to_owned(),
        path => format!("/{}", path),
    };
    let query = uri.query().map(|query| format!("?{}", query)).unwrap_or_default();

    Ok(match uri.port_u16().or(destination.port()) {
        Some(port) if port != DEFAULT_HTTP_PORT => {
            format!("{}://{}:{}{}{}", scheme, host, port, path, query)
        }
        _ => format!("{}://{}{}{}", scheme, host, path, query),
    })
}

fn bracket_ipv6(host: &str) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]", host)
    } else {
        host.to_owned()
    }
}

fn proxy_authorization(auth: &str) -> HeaderValue {
    let mut encoded = BytesMut::from(&b"Basic "[..]);
    encoded.put_slice(&base64_encode(auth.as_bytes()));
    // The base64 alphabet is visible ASCII, always a valid header value.
    let mut value = HeaderValue::from_maybe_shared(encoded.freeze()).unwrap();
    value.set_sensitive(true);
    value
}

fn base64_encode(src: &[u8]) -> Vec<u8> {
    general_purpose::STANDARD.encode(src).into_bytes()
}
