//! Shareable links that restore code, inputs and version.
//!
//! The query string is form-urlencoded, with `!'()*` percent-encoded as
//! well so links survive being pasted into Markdown.

use url::form_urlencoded;
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permalink {
    pub code: String,
    pub inputs: String,
    pub version: Option<String>,
}

impl Permalink {
    pub fn new(code: impl Into<String>, inputs: impl Into<String>, version: Option<String>) -> Self {
        Self {
            code: code.into(),
            inputs: inputs.into(),
            version,
        }
    }

    /// Encode as a query string, without the leading `?`.
    pub fn to_query(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        serializer.append_pair("code", &self.code);
        serializer.append_pair("inputs", &self.inputs);
        if let Some(version) = &self.version {
            serializer.append_pair("version", version);
        }
        // form_urlencoded already escapes ! ' ( ) but leaves * alone.
        serializer.finish().replace('*', "%2a")
    }

    /// Full link on `base`.
    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.set_query(Some(&self.to_query()));
        url.set_fragment(None);
        url
    }

    /// Parse a query string (with or without the leading `?`). Missing
    /// parameters read as empty.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut link = Permalink::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "code" => link.code = value.into_owned(),
                "inputs" => link.inputs = value.into_owned(),
                "version" if !value.is_empty() => link.version = Some(value.into_owned()),
                _ => {}
            }
        }
        link
    }

    pub fn from_url(url: &Url) -> Self {
        Self::from_query(url.query().unwrap_or(""))
    }
}
