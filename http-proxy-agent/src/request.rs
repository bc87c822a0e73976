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

//! The request side of the connector contract.
//!
//! The host HTTP client owns each outgoing request. The connector only
//! needs a narrow view of it, expressed by [`ProxiedRequest`]: the request
//! target, one header, and the two-phase "is the header block frozen" /
//! "re-freeze it" handshake that lets an already serialized header be
//! regenerated after the target was rewritten.
//!
//! [`PendingRequest`] is an HTTP/1.1 request implementing that contract. It
//! buffers writes issued before a connection is available, the same way an
//! HTTP client queues output while its socket is still connecting.

use crate::config::split_host_port;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, PROXY_AUTHORIZATION};
use http::Method;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const CRLF: &[u8] = b"\r\n";

/// Where a request was originally headed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Destination {
    pub hostname: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl Destination {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Destination { hostname: Some(hostname.into()), host: None, port: Some(port) }
    }

    /// The destination host name, falling back to `host` without any port
    /// suffix it carries.
    pub fn hostname(&self) -> Option<&str> {
        match self.hostname.as_deref().filter(|hostname| !hostname.is_empty()) {
            Some(hostname) => Some(hostname),
            None => self.host_parts().map(|(host, _)| host),
        }
    }

    /// The destination port, falling back to the port suffix of `host` when
    /// `host` is the source of the host name.
    pub fn port(&self) -> Option<u16> {
        if self.port.is_some() || self.hostname.as_deref().is_some_and(|h| !h.is_empty()) {
            return self.port;
        }
        self.host_parts().and_then(|(_, port)| port)
    }

    fn host_parts(&self) -> Option<(&str, Option<u16>)> {
        self.host.as_deref().filter(|host| !host.is_empty()).map(split_host_port)
    }
}

/// The parts of an in-flight request the connector reads and mutates.
pub trait ProxiedRequest {
    /// The request target as it will appear in the request line.
    fn target(&self) -> &str;

    fn set_target(&mut self, target: String);

    fn set_proxy_authorization(&mut self, value: HeaderValue);

    /// True once the request line and headers have been serialized.
    fn is_header_frozen(&self) -> bool;

    /// Discards the serialized header block and serializes it again from
    /// the current target and headers.
    fn refreeze_header(&mut self) -> Bytes;

    /// The first write chunk queued before a connection was available, if
    /// any. It starts with the header block frozen at the time of writing.
    fn first_queued_chunk(&mut self) -> Option<&mut BytesMut>;
}

/// An outgoing HTTP/1.1 request that has not reached the wire yet.
#[derive(Debug)]
pub struct PendingRequest {
    method: Method,
    target: String,
    headers: HeaderMap,
    header: Option<Bytes>,
    header_sent: bool,
    output: Vec<BytesMut>,
}

impl PendingRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        PendingRequest {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            header: None,
            header_sent: false,
            output: Vec::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        PendingRequest::new(Method::GET, target)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    /// Serializes the header block unless it already is, and returns it.
    pub fn freeze_header(&mut self) -> Bytes {
        if let Some(header) = &self.header {
            return header.clone();
        }
        let header = self.serialize_header();
        self.header = Some(header.clone());
        header
    }

    pub fn serialized_header(&self) -> Option<&Bytes> {
        self.header.as_ref()
    }

    /// Queues a body chunk. The first write carries the header block in
    /// front of it.
    pub fn write(&mut self, chunk: &[u8]) {
        if self.header_sent {
            self.output.push(BytesMut::from(chunk));
            return;
        }
        let header = self.freeze_header();
        let mut first = BytesMut::with_capacity(header.len() + chunk.len());
        first.put_slice(&header);
        first.put_slice(chunk);
        self.output.push(first);
        self.header_sent = true;
    }

    /// Write chunks waiting for a connection.
    pub fn queued(&self) -> &[BytesMut] {
        &self.output
    }

    /// Writes the header, if not yet written, and every queued chunk to `io`.
    pub async fn flush_to<W>(&mut self, io: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if !self.header_sent {
            self.write(&[]);
        }
        for chunk in self.output.drain(..) {
            io.write_all(&chunk).await?;
        }
        io.flush().await
    }

    fn serialize_header(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.target.len() + self.headers.len() * 32);
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.target.as_bytes());
        buf.put_slice(b" HTTP/1.1");
        buf.put_slice(CRLF);
        for (name, value) in &self.headers {
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(CRLF);
        }
        buf.put_slice(CRLF);
        buf.freeze()
    }
}

impl ProxiedRequest for PendingRequest {
    fn target(&self) -> &str {
        &self.target
    }

    fn set_target(&mut self, target: String) {
        self.target = target;
    }

    fn set_proxy_authorization(&mut self, value: HeaderValue) {
        self.headers.insert(PROXY_AUTHORIZATION, value);
    }

    fn is_header_frozen(&self) -> bool {
        self.header.is_some()
    }

    fn refreeze_header(&mut self) -> Bytes {
        self.header = None;
        self.freeze_header()
    }

    fn first_queued_chunk(&mut self) -> Option<&mut BytesMut> {
        self.output.first_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_LENGTH, HOST};

    #[test]
    fn test_serialize_header() {
        let mut request = PendingRequest::new(Method::POST, "/submit?x=1");
        request.insert_header(HOST, HeaderValue::from_static("127.0.0.1:8000"));
        request.insert_header(CONTENT_LENGTH, HeaderValue::from_static("5"));

        assert!(!request.is_header_frozen());
        let header = request.freeze_header();
        assert_eq!(
            &header[..],
            b"POST /submit?x=1 HTTP/1.1\r\nhost: 127.0.0.1:8000\r\ncontent-length: 5\r\n\r\n"
        );
        assert!(request.is_header_frozen());
        assert_eq!(request.serialized_header(), Some(&header));
    }

    #[test]
    fn test_freeze_is_stable_until_refreeze() {
        let mut request = PendingRequest::get("/");
        let first = request.freeze_header();

        request.set_target("http://example.com/".to_string());
        assert_eq!(request.freeze_header(), first);

        let second = request.refreeze_header();
        assert_eq!(&second[..], b"GET http://example.com/ HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_write_queues_header_in_first_chunk() {
        let mut request = PendingRequest::new(Method::PUT, "/upload");
        request.write(b"hello");
        request.write(b" world");

        let queued = request.queued();
        assert_eq!(queued.len(), 2);
        assert_eq!(&queued[0][..], b"PUT /upload HTTP/1.1\r\n\r\nhello");
        assert_eq!(&queued[1][..], b" world");
        assert!(request.first_queued_chunk().is_some());
    }

    #[test]
    fn test_proxy_authorization_header() {
        let mut request = PendingRequest::get("/");
        request.set_proxy_authorization(HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        request.set_proxy_authorization(HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(request.headers().get_all(PROXY_AUTHORIZATION).iter().count(), 1);
    }

    #[test]
    fn test_destination_hostname_fallback() {
        let destination = Destination { host: Some("example.com".into()), ..Default::default() };
        assert_eq!(destination.hostname(), Some("example.com"));

        let destination = Destination {
            hostname: Some("a.example.com".into()),
            host: Some("b.example.com".into()),
            port: None,
        };
        assert_eq!(destination.hostname(), Some("a.example.com"));
        assert_eq!(destination.port(), None);
        assert_eq!(Destination::default().hostname(), None);
    }

    #[test]
    fn test_destination_host_with_port_suffix() {
        let destination = Destination { host: Some("example.com:81".into()), ..Default::default() };
        assert_eq!(destination.hostname(), Some("example.com"));
        assert_eq!(destination.port(), Some(81));

        let destination =
            Destination { host: Some("example.com:81".into()), port: Some(82), hostname: None };
        assert_eq!(destination.port(), Some(82));

        let destination = Destination { host: Some("[::1]:8080".into()), ..Default::default() };
        assert_eq!(destination.hostname(), Some("::1"));
        assert_eq!(destination.port(), Some(8080));

        let destination = Destination { host: Some("::1".into()), ..Default::default() };
        assert_eq!(destination.hostname(), Some("::1"));
        assert_eq!(destination.port(), None);
    }

    #[tokio::test]
    async fn test_flush_to_writes_header_and_chunks() {
        let mut request = PendingRequest::get("/");
        let mut out: Vec<u8> = Vec::new();
        request.flush_to(&mut out).await.unwrap();
        assert_eq!(out, b"GET / HTTP/1.1\r\n\r\n");
        assert!(request.queued().is_empty());

        let mut request = PendingRequest::new(Method::POST, "/");
        request.write(b"abc");
        let mut out: Vec<u8> = Vec::new();
        request.flush_to(&mut out).await.unwrap();
        assert_eq!(out, b"POST / HTTP/1.1\r\n\r\nabc");
    }
}
