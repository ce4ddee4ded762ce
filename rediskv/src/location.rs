//! Store locations and the backing structure names derived from them.

use url::Url;

use crate::error::{Error, Result};

/// Location used for a URL with no host.
const HOSTLESS_URL_LOCATION: &str = "rd";

/// A sanitized store location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Location(String);

impl Location {
    /// Sanitizes a raw location.
    ///
    /// A location written as a URL (`scheme://host/...`) is reduced to its
    /// host, or `rd` when it has none. A leading `/` is dropped. A location beginning with an escaped
    /// hash tag (`%7B...%7D`) has the braces restored, so cluster slot
    /// routing sees the same tag the caller wrote.
    pub(crate) fn parse(raw: &str) -> Result<Self> {
        let host;
        let raw = if raw.find("://").is_some_and(|at| at > 0) {
            host = Url::parse(raw)
                .ok()
                .and_then(|url| url.host_str().map(str::to_string))
                .filter(|host| !host.is_empty())
                .unwrap_or_else(|| HOSTLESS_URL_LOCATION.to_string());
            host.as_str()
        } else {
            raw
        };
        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        let location = match trimmed.strip_prefix("%7B") {
            Some(rest) if rest.contains("%7D") => format!("{{{}", rest.replacen("%7D", "}", 1)),
            _ => trimmed.to_string(),
        };
        if location.is_empty() {
            return Err(Error::InvalidArgument(
                "location must be a non-empty string".to_string(),
            ));
        }
        Ok(Self(location))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    /// Sorted set holding the keys.
    pub(crate) fn ordering(&self) -> String {
        format!("{}:ordering", self.0)
    }

    /// Hash holding key → value.
    pub(crate) fn values(&self) -> String {
        format!("{}:values", self.0)
    }
}
