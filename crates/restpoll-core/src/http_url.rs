//! Mutable HTTP URL value.
//!
//! Unlike [`url::Url`], the query string is held as an ordered key/value
//! mapping so pagination functions can rewrite a single parameter (a cursor,
//! an offset) and hand the URL back to the scheduler.

use std::fmt;
use std::str::FromStr;

use url::{Url, form_urlencoded};

use crate::error::AppError;

/// An HTTP URL split into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUrl {
    scheme: String,
    netloc: String,
    path: String,
    query: Vec<(String, String)>,
    fragment: Option<String>,
}

impl HttpUrl {
    /// Parse a complete URL string.
    pub fn parse(input: &str) -> Result<Self, AppError> {
        let parsed =
            Url::parse(input).map_err(|e| AppError::InvalidUrl(format!("{input}: {e}")))?;
        Self::from_url(&parsed)
    }

    /// Resolve `reference` against `base` the way a browser resolves a link.
    ///
    /// An empty base means `reference` must itself be an absolute URL.
    pub fn join(base: &str, reference: &str) -> Result<Self, AppError> {
        if base.is_empty() {
            return Self::parse(reference);
        }
        let base_url =
            Url::parse(base).map_err(|e| AppError::InvalidUrl(format!("{base}: {e}")))?;
        let joined = base_url
            .join(reference)
            .map_err(|e| AppError::InvalidUrl(format!("{reference} (base {base}): {e}")))?;
        Self::from_url(&joined)
    }

    fn from_url(url: &Url) -> Result<Self, AppError> {
        let host = url
            .host_str()
            .ok_or_else(|| AppError::InvalidUrl(format!("{url}: URL has no host")))?;

        let mut netloc = String::new();
        if !url.username().is_empty() {
            netloc.push_str(url.username());
            if let Some(password) = url.password() {
                netloc.push(':');
                netloc.push_str(password);
            }
            netloc.push('@');
        }
        netloc.push_str(host);
        if let Some(port) = url.port() {
            netloc.push_str(&format!(":{port}"));
        }

        let mut out = Self {
            scheme: url.scheme().to_string(),
            netloc,
            path: url.path().to_string(),
            query: Vec::new(),
            fragment: url.fragment().filter(|f| !f.is_empty()).map(String::from),
        };
        for (key, value) in url.query_pairs() {
            out.set_query(key, value);
        }
        Ok(out)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host, with userinfo and port when present.
    pub fn netloc(&self) -> &str {
        &self.netloc
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    pub fn set_fragment(&mut self, fragment: Option<&str>) {
        self.fragment = fragment.filter(|f| !f.is_empty()).map(String::from);
    }

    /// Query parameters in insertion order.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a single query parameter, replacing any existing value in place.
    pub fn set_query(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.query.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.query.push((key, value)),
        }
    }

    pub fn remove_query(&mut self, key: &str) -> Option<String> {
        let pos = self.query.iter().position(|(k, _)| k == key)?;
        Some(self.query.remove(pos).1)
    }

    /// Merge parameters into the query. Later values overwrite same-named keys;
    /// non-string JSON values are rendered with their JSON text.
    pub fn add_to_query<K, V>(&mut self, params: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        for (key, value) in params {
            self.set_query(key, query_value_string(&value.into()));
        }
    }
}

/// Render a JSON value the way it should appear in a query string.
pub(crate) fn query_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.netloc, self.path)?;
        if !self.query.is_empty() {
            let encoded = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.query.iter())
                .finish();
            write!(f, "?{encoded}")?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{fragment}")?;
        }
        Ok(())
    }
}

impl FromStr for HttpUrl {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for HttpUrl {
    type Error = AppError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_components() {
        let url = HttpUrl::parse("https://api.example.com:8443/v1/events?limit=10&cursor=abc#top")
            .unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.netloc(), "api.example.com:8443");
        assert_eq!(url.path(), "/v1/events");
        assert_eq!(url.query_param("limit"), Some("10"));
        assert_eq!(url.query_param("cursor"), Some("abc"));
        assert_eq!(url.fragment(), Some("top"));
    }

    #[test]
    fn renders_without_empty_parts() {
        let url = HttpUrl::parse("http://mybaseurl.foo/path").unwrap();
        assert_eq!(url.to_string(), "http://mybaseurl.foo/path");
    }

    #[test]
    fn renders_query_and_fragment() {
        let mut url = HttpUrl::parse("http://mybaseurl.foo/path#frag").unwrap();
        url.set_query("cursor", "some");
        assert_eq!(url.to_string(), "http://mybaseurl.foo/path?cursor=some#frag");
    }

    #[test]
    fn later_values_overwrite_same_key() {
        let mut url = HttpUrl::parse("http://h/p?a=1&b=2").unwrap();
        url.add_to_query([("a", "9")]);
        url.add_to_query([("c", 3)]);
        assert_eq!(
            url.query(),
            &[
                ("a".to_string(), "9".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn non_string_values_are_coerced() {
        let mut url = HttpUrl::parse("http://h/p").unwrap();
        url.add_to_query([
            ("limit", serde_json::json!(1000)),
            ("deep", serde_json::json!(true)),
            ("name", serde_json::json!("x y")),
        ]);
        assert_eq!(url.query_param("limit"), Some("1000"));
        assert_eq!(url.query_param("deep"), Some("true"));
        assert_eq!(url.to_string(), "http://h/p?limit=1000&deep=true&name=x+y");
    }

    #[test]
    fn duplicate_keys_in_input_keep_last() {
        let url = HttpUrl::parse("http://h/p?a=1&a=2").unwrap();
        assert_eq!(url.query().len(), 1);
        assert_eq!(url.query_param("a"), Some("2"));
    }

    #[test]
    fn remove_query_param() {
        let mut url = HttpUrl::parse("http://h/p?a=1&b=2").unwrap();
        assert_eq!(url.remove_query("a"), Some("1".to_string()));
        assert_eq!(url.remove_query("zzz"), None);
        assert_eq!(url.to_string(), "http://h/p?b=2");
    }

    #[test]
    fn join_relative_path_onto_base() {
        let url = HttpUrl::join("http://mybaseurl.foo/", "path").unwrap();
        assert_eq!(url.to_string(), "http://mybaseurl.foo/path");

        let url = HttpUrl::join("https://api.x.com/api/v1/projects/p/", "events/list").unwrap();
        assert_eq!(url.path(), "/api/v1/projects/p/events/list");
    }

    #[test]
    fn join_absolute_reference_ignores_base() {
        let url = HttpUrl::join("http://a.com/x/", "https://b.com/y?z=1").unwrap();
        assert_eq!(url.to_string(), "https://b.com/y?z=1");
    }

    #[test]
    fn join_with_empty_base_requires_absolute() {
        assert!(HttpUrl::join("", "http://a.com/x").is_ok());
        assert!(matches!(
            HttpUrl::join("", "relative/path"),
            Err(AppError::InvalidUrl(_))
        ));
    }

    #[test]
    fn keeps_userinfo_in_netloc() {
        let url = HttpUrl::parse("http://user:pw@host.com/p").unwrap();
        assert_eq!(url.netloc(), "user:pw@host.com");
    }

    #[test]
    fn rejects_garbage() {
        assert!("not a url".parse::<HttpUrl>().is_err());
    }
}
