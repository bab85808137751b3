//! Language capability table
//!
//! Front-ends register nothing at run time: the set of languages and the
//! language-specific constructs each can report is fixed here and resolved by
//! name. The core only ever sees `{kind, range}` descriptors; this table lets
//! the allocator reject constructs a language does not have.

/// Static description of one source language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageDescriptor {
    /// Lookup key, lower case
    pub name: &'static str,
    /// File extensions (without the dot)
    pub extensions: &'static [&'static str],
    /// Language-specific construct names the front-end may report
    pub constructs: &'static [&'static str],
}

impl LanguageDescriptor {
    /// Check whether this language can report the named construct
    #[must_use]
    pub fn supports_construct(&self, construct: &str) -> bool {
        self.constructs.contains(&construct)
    }
}

const LANGUAGES: &[LanguageDescriptor] = &[
    LanguageDescriptor {
        name: "java",
        extensions: &["java"],
        constructs: &["lambda", "switch-expression", "ternary", "assert"],
    },
    LanguageDescriptor {
        name: "groovy",
        extensions: &["groovy", "gvy", "gy", "gsh"],
        constructs: &["closure", "elvis", "safe-navigation", "ternary", "gstring"],
    },
    LanguageDescriptor {
        name: "kotlin",
        extensions: &["kt", "kts"],
        constructs: &["lambda", "when-expression", "elvis", "safe-call"],
    },
];

/// Every known language
#[must_use]
pub fn all() -> &'static [LanguageDescriptor] {
    LANGUAGES
}

/// Resolve a language by name (case-insensitive)
#[must_use]
pub fn lookup(name: &str) -> Option<&'static LanguageDescriptor> {
    LANGUAGES.iter().find(|l| l.name.eq_ignore_ascii_case(name))
}

/// Resolve a language from a file path's extension
#[must_use]
pub fn for_path(path: &str) -> Option<&'static LanguageDescriptor> {
    let ext = std::path::Path::new(path).extension()?.to_str()?;
    LANGUAGES
        .iter()
        .find(|l| l.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}
