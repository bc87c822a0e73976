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

// # Proxy Configuration
//
// This module turns a user supplied proxy location into the
// `ProxyDescriptor` the connector dials for every request.
//
// The location is either a URL string in the format
// `[protocol://][username:password@]host[:port]` or a structured
// `ProxyOptions` value, typically the result of parsing such a URL
// elsewhere. Both forms resolve through the same rules:
//
// * The proxy is secure when `secure_proxy` is set or the protocol is
//   `https` (any case, with or without the trailing colon).
// * `hostname` wins over `host`.
// * String ports are parsed; missing, zero or non-numeric ports fall
//   back to 443 for secure proxies and 80 otherwise.
// * Path components are never carried into the descriptor, so a proxy
//   target is never mistaken for a unix socket path.

use crate::connector::Result;
use crate::error::Error;
use crate::transport::TransportOptions;
use log::debug;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use url::Url;

const HTTP_PROXY_ENV: [&str; 2] = ["HTTP_PROXY", "http_proxy"];

/// A proxy port, either numeric or as text left over from URL parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Port {
    Number(u16),
    Text(String),
}

impl Port {
    /// Returns the numeric port, or `None` when it is zero or not a number.
    fn coerce(&self) -> Option<u16> {
        let port = match self {
            Port::Number(port) => *port,
            Port::Text(text) => text.trim().parse().ok()?,
        };
        (port != 0).then_some(port)
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Port::Number(port)
    }
}

impl From<&str> for Port {
    fn from(port: &str) -> Self {
        Port::Text(port.to_owned())
    }
}

impl From<String> for Port {
    fn from(port: String) -> Self {
        Port::Text(port)
    }
}

/// Structured proxy location, field for field what a parsed proxy URL
/// carries plus the options passed to the transport.
#[derive(Clone, Default)]
pub struct ProxyOptions {
    pub protocol: Option<String>,
    /// Host, possibly with a `:port` suffix.
    pub host: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<Port>,
    /// Raw `user:password` credentials.
    pub auth: Option<String>,
    pub path: Option<String>,
    pub pathname: Option<String>,
    /// Connect to the proxy over TLS regardless of `protocol`.
    pub secure_proxy: bool,
    pub transport: TransportOptions,
}

impl ProxyOptions {
    /// Parses a proxy URL.
    ///
    /// A location without a scheme such as `127.0.0.1:3128` is read as
    /// `http://127.0.0.1:3128`. Credentials are percent-decoded.
    ///
    /// # Errors
    /// Returns `Error::MissingProxy` for an empty string and
    /// `Error::MalformedConfigString` when the string is not a URL.
    pub fn from_string(config_string: &str) -> Result<ProxyOptions> {
        let config_string = config_string.trim();
        if config_string.is_empty() {
            return Err(Error::MissingProxy);
        }
        let url = match Url::parse(config_string) {
            Ok(url) if url.has_host() => url,
            // `host:port` parses as a scheme followed by an opaque path.
            Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(&format!("http://{}", config_string))
                    .map_err(|_| Error::MalformedConfigString)?
            }
            Err(_) => return Err(Error::MalformedConfigString),
        };
        Ok(ProxyOptions::from(&url))
    }

    /// Reads the proxy location from `HTTP_PROXY`, then `http_proxy`.
    pub fn from_env() -> Result<ProxyOptions> {
        let value = HTTP_PROXY_ENV
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .find(|value| !value.trim().is_empty())
            .ok_or(Error::MissingProxy)?;
        ProxyOptions::from_string(&value)
    }

    /// Sets the options handed through to the transport opener.
    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }
}

impl From<&Url> for ProxyOptions {
    fn from(url: &Url) -> Self {
        let host_str = url.host_str().unwrap_or_default();
        let host = match url.port() {
            Some(port) => format!("{}:{}", host_str, port),
            None => host_str.to_owned(),
        };
        let auth = match (url.username(), url.password()) {
            ("", None) => None,
            (user, None) => Some(decode(user)),
            (user, Some(pass)) => Some(format!("{}:{}", decode(user), decode(pass))),
        };
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_owned(),
        };
        ProxyOptions {
            protocol: Some(format!("{}:", url.scheme())),
            host: Some(host),
            hostname: Some(trim_brackets(host_str).to_owned()),
            port: url.port().map(Port::Number),
            auth,
            path: Some(path),
            pathname: Some(url.path().to_owned()),
            secure_proxy: false,
            transport: TransportOptions::default(),
        }
    }
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .field("path", &self.path)
            .field("pathname", &self.pathname)
            .field("secure_proxy", &self.secure_proxy)
            .field("transport", &self.transport)
            .finish()
    }
}

/// Conversion into `ProxyOptions`, accepted wherever a proxy location is.
pub trait IntoProxyOptions {
    fn into_proxy_options(self) -> Result<ProxyOptions>;
}

impl IntoProxyOptions for ProxyOptions {
    fn into_proxy_options(self) -> Result<ProxyOptions> {
        Ok(self)
    }
}

impl IntoProxyOptions for &str {
    fn into_proxy_options(self) -> Result<ProxyOptions> {
        ProxyOptions::from_string(self)
    }
}

impl IntoProxyOptions for String {
    fn into_proxy_options(self) -> Result<ProxyOptions> {
        ProxyOptions::from_string(&self)
    }
}

impl IntoProxyOptions for &String {
    fn into_proxy_options(self) -> Result<ProxyOptions> {
        ProxyOptions::from_string(self)
    }
}

impl IntoProxyOptions for &Url {
    fn into_proxy_options(self) -> Result<ProxyOptions> {
        Ok(ProxyOptions::from(self))
    }
}

impl IntoProxyOptions for Url {
    fn into_proxy_options(self) -> Result<ProxyOptions> {
        Ok(ProxyOptions::from(&self))
    }
}

impl<T: IntoProxyOptions> IntoProxyOptions for Option<T> {
    fn into_proxy_options(self) -> Result<ProxyOptions> {
        self.ok_or(Error::MissingProxy)?.into_proxy_options()
    }
}

/// The resolved address of the proxy server. Immutable once built.
#[derive(Clone)]
pub struct ProxyDescriptor {
    host: String,
    port: u16,
    secure: bool,
    auth: Option<String>,
    transport: TransportOptions,
}

impl ProxyDescriptor {
    /// Resolves a proxy location into a descriptor.
    ///
    /// # Errors
    /// Returns `Error::MissingProxy` if the location is empty or names no
    /// host, and any error raised while parsing a URL string.
    pub fn resolve(input: impl IntoProxyOptions) -> Result<ProxyDescriptor> {
        let options = input.into_proxy_options()?;
        let secure = options.secure_proxy || is_https(options.protocol.as_deref());

        let (host, host_port) = match (non_empty(&options.hostname), non_empty(&options.host)) {
            (Some(hostname), _) => (trim_brackets(hostname).to_owned(), None),
            (None, Some(host)) => {
                let (host, port) = split_host_port(host);
                (host.to_owned(), port)
            }
            (None, None) => return Err(Error::MissingProxy),
        };
        let port = options
            .port
            .as_ref()
            .and_then(Port::coerce)
            .or(host_port)
            .unwrap_or(if secure { 443 } else { 80 });

        if options.path.is_some() || options.pathname.is_some() {
            debug!("Ignoring path of proxy location {}:{}", host, port);
        }

        let descriptor = ProxyDescriptor {
            host,
            port,
            secure,
            auth: options.auth.filter(|auth| !auth.is_empty()),
            transport: options.transport,
        };
        debug!("Resolved proxy descriptor: {:?}", descriptor);
        Ok(descriptor)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True if the proxy is reached over TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Raw `user:password` credentials, if any.
    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    pub fn transport_options(&self) -> &TransportOptions {
        &self.transport
    }
}

impl FromStr for ProxyDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProxyDescriptor::resolve(s)
    }
}

impl fmt::Debug for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProxyDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .field("transport", &self.transport)
            .finish()
    }
}

fn is_https(protocol: Option<&str>) -> bool {
    static HTTPS: OnceLock<Regex> = OnceLock::new();
    let re = HTTPS.get_or_init(|| Regex::new(r"(?i)^https:?$").unwrap());
    protocol.is_some_and(|protocol| re.is_match(protocol))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

fn trim_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Splits a `host[:port]` string. IPv6 literals must be bracketed to carry a
/// port.
pub(crate) fn split_host_port(host: &str) -> (&str, Option<u16>) {
    let split = if host.starts_with('[') {
        host.rsplit_once("]:").map(|(host, port)| (&host[1..], port))
    } else if host.matches(':').count() == 1 {
        host.split_once(':')
    } else {
        None
    };
    match split {
        Some((name, port)) => (name, Port::from(port).coerce()),
        None => (trim_brackets(host), None),
    }
}

fn decode(component: &str) -> String {
    percent_decode_str(component).decode_utf8_lossy().into_owned()
}
