use serde::{Deserialize, Serialize};

use crate::error::{FastFindError, Result};
use crate::search::matcher;

/// How the query text will be matched, decided once per query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextPlan {
    /// No text criterion.
    None,
    /// Plain substring, SIMD-eligible when long enough.
    Substring,
    /// Contains `*` or `?`, anchored glob over the whole haystack.
    Glob,
    /// Compile once, reuse for every candidate.
    Regex,
}

/// Value object describing one search. Built with struct-update syntax
/// over `SearchQuery::default()`; `validate` gates entry to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub text: String,
    pub extension_filter: Option<String>,
    pub base_path: Option<String>,
    pub search_locations: Vec<String>,
    pub excluded_paths: Vec<String>,

    pub case_sensitive: bool,
    pub use_regex: bool,
    pub search_filename_only: bool,
    pub include_subdirectories: bool,
    pub include_files: bool,
    pub include_directories: bool,
    pub include_hidden: bool,
    pub include_system: bool,

    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub min_modified: Option<u64>,
    pub max_modified: Option<u64>,
    pub min_created: Option<u64>,
    pub max_created: Option<u64>,

    pub max_results: Option<usize>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        SearchQuery {
            text: String::new(),
            extension_filter: None,
            base_path: None,
            search_locations: Vec::new(),
            excluded_paths: Vec::new(),
            case_sensitive: false,
            use_regex: false,
            search_filename_only: true,
            include_subdirectories: true,
            include_files: true,
            include_directories: true,
            include_hidden: true,
            include_system: true,
            min_size: None,
            max_size: None,
            min_modified: None,
            max_modified: None,
            min_created: None,
            max_created: None,
            max_results: None,
        }
    }
}

impl SearchQuery {
    pub fn for_text(text: impl Into<String>) -> Self {
        SearchQuery {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn for_extension(ext: impl Into<String>) -> Self {
        SearchQuery {
            extension_filter: Some(ext.into()),
            ..Default::default()
        }
    }

    pub fn has_size_window(&self) -> bool {
        self.min_size.is_some() || self.max_size.is_some()
    }

    pub fn has_time_window(&self) -> bool {
        self.min_modified.is_some()
            || self.max_modified.is_some()
            || self.min_created.is_some()
            || self.max_created.is_some()
    }

    pub fn has_attribute_filter(&self) -> bool {
        !self.include_files
            || !self.include_directories
            || !self.include_hidden
            || !self.include_system
    }

    /// At least one positive criterion must be present: non-empty text, an
    /// extension, a size window or a time window. A bare base path is a
    /// scope, not a criterion.
    pub fn validate(&self) -> Result<()> {
        let has_text = !self.text.trim().is_empty();
        let has_extension = self
            .extension_filter
            .as_deref()
            .map(|e| !e.trim().is_empty())
            .unwrap_or(false);
        if !has_text && !has_extension && !self.has_size_window() && !self.has_time_window() {
            return Err(FastFindError::InvalidQuery(
                "query needs text, an extension filter, a size window or a time window".into(),
            ));
        }
        if let (Some(min), Some(max)) = (self.min_size, self.max_size) {
            if min > max {
                return Err(FastFindError::InvalidQuery(format!(
                    "empty size window: min {min} > max {max}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_modified, self.max_modified) {
            if min > max {
                return Err(FastFindError::InvalidQuery(
                    "empty modified-time window".into(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.min_created, self.max_created) {
            if min > max {
                return Err(FastFindError::InvalidQuery(
                    "empty created-time window".into(),
                ));
            }
        }
        if self.use_regex {
            if let Err(e) = regex::Regex::new(&self.text) {
                return Err(FastFindError::InvalidQuery(format!("bad regex: {e}")));
            }
        }
        Ok(())
    }

    pub fn text_plan(&self) -> TextPlan {
        let trimmed = self.text.trim();
        if trimmed.is_empty() {
            TextPlan::None
        } else if self.use_regex {
            TextPlan::Regex
        } else if matcher::has_wildcards(trimmed) {
            TextPlan::Glob
        } else {
            TextPlan::Substring
        }
    }

    pub fn trimmed_text(&self) -> &str {
        self.text.trim()
    }
}
