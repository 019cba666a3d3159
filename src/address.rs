//! Destination addresses.
//!
//! A destination is written as `host:port`. The *last* colon separates the host from
//! the port, so an unbracketed IPv6 literal such as `::1:9000` parses as host `::1`
//! and port `9000`. Bracketed literals (`[::1]:9000`) are not unwrapped; the host is
//! handed to the resolver verbatim.
//!
//! The port is kept as the resolver's service token: a decimal port number or a
//! service name such as `http`. Whether it names a real service is only known once
//! it is resolved.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A parsed `host:port` destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    service: String,
}

impl Destination {
    /// Create a destination from an already split host and port or service name.
    pub fn new<H, S>(host: H, service: S) -> Self
    where
        H: Into<String>,
        S: ToString,
    {
        Self {
            host: host.into(),
            service: service.to_string(),
        }
    }

    /// The host segment, as passed to the resolver.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port segment, as passed to the resolver.
    pub fn service(&self) -> &str {
        &self.service
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.service)
    }
}

/// Reasons a destination string can be rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressError {
    /// There is no `:` separating host and port.
    #[error("address {0:?} has no port separator")]
    MissingSeparator(String),

    /// The segment before the last `:` is empty.
    #[error("address {0:?} has an empty host")]
    MissingHost(String),
}

impl FromStr for Destination {
    type Err = AddressError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let (host, service) = address
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingSeparator(address.to_owned()))?;

        if host.is_empty() {
            return Err(AddressError::MissingHost(address.to_owned()));
        }

        Ok(Self::new(host, service))
    }
}

impl TryFrom<&str> for Destination {
    type Error = AddressError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<String> for Destination {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<&String> for Destination {
    type Error = AddressError;

    fn try_from(value: &String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
