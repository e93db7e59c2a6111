//! Header names and header-map access
//!
//! The host proxy owns the header representation. The filter only needs to
//! read, replace, and remove single string values by name.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

/// Trace correlation identifier (read-only)
pub const REQUEST_ID: &str = "x-request-id";

/// Label payload (read and rewritten)
pub const DATA: &str = "x-data";

/// Per-exchange override actions (read, then removed)
pub const DATA_OVERRIDE: &str = "x-data-override";

/// Access to a header map by header name
pub trait HeaderAccess {
    /// Value of the header, if present and representable as a string
    fn get_header(&self, name: &str) -> Option<String>;

    /// Replace any existing values of the header with `value`
    fn set_header(&mut self, name: &str, value: &str);

    /// Remove the header, returning its previous value
    fn remove_header(&mut self, name: &str) -> Option<String>;

    /// Value of the header if present and non-empty
    fn non_empty_header(&self, name: &str) -> Option<String> {
        self.get_header(name).filter(|value| !value.is_empty())
    }
}

impl HeaderAccess for HashMap<String, String> {
    fn get_header(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.insert(name.to_string(), value.to_string());
    }

    fn remove_header(&mut self, name: &str) -> Option<String> {
        self.remove(name)
    }
}

impl HeaderAccess for HeaderMap {
    fn get_header(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn set_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.insert(name, value);
            }
            _ => {
                tracing::warn!(header = name, "Dropping header with invalid name or value");
            }
        }
    }

    fn remove_header(&mut self, name: &str) -> Option<String> {
        self.remove(name)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }
}
