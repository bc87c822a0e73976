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

//! This module defines the proxy agent error types.

use std::fmt;
use std::io;

/// An enumeration of possible errors.
#[derive(Debug)]
pub enum Error {
    /// An I/O error from the transport layer: connection refused, DNS
    /// resolution failure or a failed TLS handshake.
    IoError(io::Error),
    /// No proxy location was given.
    MissingProxy,
    MalformedConfigString,
    InvalidHost(String),
    InvalidTarget(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::MissingProxy => {
                write!(f, "an HTTP(S) proxy server `host` and `port` must be specified")
            }
            Error::MalformedConfigString => {
                write!(f, "Invalid proxy configuration string")
            }
            Error::InvalidHost(host) => write!(f, "Invalid host: {}", host),
            Error::InvalidTarget(target) => write!(f, "Invalid request target: {}", target),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_io_error_chaining() {
        let inner_error = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let outer_error = Error::from(inner_error);

        assert!(outer_error.to_string().contains("connection refused"));
        assert!(outer_error.source().is_some());
    }

    #[test]
    fn test_missing_proxy_message() {
        assert_eq!(
            Error::MissingProxy.to_string(),
            "an HTTP(S) proxy server `host` and `port` must be specified"
        );
        assert!(Error::MissingProxy.source().is_none());
    }
}
