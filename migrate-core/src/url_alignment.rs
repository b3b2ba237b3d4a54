//! Base-URL rewrite pairs.
//!
//! A host change leaves the old URL stored in many textual shapes: with and
//! without a trailing slash, JSON-escaped inside serialized blocks, and
//! protocol-relative in theme settings. Every shape needs its own pair.

use log::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchReplacePair {
    pub old: String,
    pub new: String,
}

impl SearchReplacePair {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }

    fn is_meaningful(&self) -> bool {
        !self.old.is_empty() && !self.new.is_empty() && self.old != self.new
    }
}

fn trim_slash(url: &str) -> &str {
    url.trim_end_matches('/')
}

fn json_escape(url: &str) -> String {
    url.replace('/', "\\/")
}

/// `https://example.com/blog/` -> `example.com/blog`
fn host_only(url: &str) -> &str {
    let without_scheme = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url.trim_start_matches("//"),
    };
    trim_slash(without_scheme)
}

/// Every rewrite pair for one URL change, in generation order, with empty and
/// identity pairs dropped and duplicates removed.
pub fn variants_for(old_url: &str, new_url: &str) -> Vec<SearchReplacePair> {
    let old_trim = trim_slash(old_url);
    let new_trim = trim_slash(new_url);
    if old_trim.is_empty() || new_trim.is_empty() {
        return Vec::new();
    }
    let old_host = host_only(old_url);
    let new_host = host_only(new_url);

    let generated = [
        SearchReplacePair::new(old_url, new_url),
        SearchReplacePair::new(old_trim, new_trim),
        SearchReplacePair::new(format!("{old_trim}/"), format!("{new_trim}/")),
        SearchReplacePair::new(json_escape(old_url), json_escape(new_url)),
        SearchReplacePair::new(json_escape(old_trim), json_escape(new_trim)),
        SearchReplacePair::new(format!("//{old_host}"), format!("//{new_host}")),
        SearchReplacePair::new(old_host, new_host),
    ];

    let mut pairs = Vec::with_capacity(generated.len());
    for pair in generated {
        if pair.is_meaningful() && !pairs.contains(&pair) {
            pairs.push(pair);
        }
    }
    pairs
}

/// Insertion-ordered, de-duplicated accumulation of rewrite pairs for a run.
#[derive(Debug, Clone, Default)]
pub struct UrlAlignment {
    pairs: Vec<SearchReplacePair>,
}

impl UrlAlignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_alignment(&mut self, old_url: &str, new_url: &str) {
        for pair in variants_for(old_url, new_url) {
            self.push(pair);
        }
    }

    /// Add a single literal pair, such as one given on the command line.
    pub fn push(&mut self, pair: SearchReplacePair) {
        if !pair.is_meaningful() || self.pairs.contains(&pair) {
            return;
        }
        if let Some(broader) = self
            .pairs
            .iter()
            .find(|existing| pair.old.contains(existing.old.as_str()))
        {
            debug!(
                "Pair '{}' contains earlier pattern '{}'; it runs after that replacement",
                pair.old, broader.old
            );
        }
        self.pairs.push(pair);
    }

    pub fn pairs(&self) -> &[SearchReplacePair] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}
