//! Field tag grammar.
//!
//! A tag string is a comma-separated list of words; a word is a tag name
//! optionally followed by space-separated arguments:
//!
//! ```text
//! -                      skip this field
//! name X                 override the persisted field name
//! nonzero                reject zero values
//! noauto                 disable PK auto-assignment (integer PKs only)
//! index [A+B[ name]]     non-unique index
//! unique [A+B[ name]]    unique index
//! ref T                  field references the PK of type T
//! default V              replace zero value on insert ("now" for time)
//! typename N             override the persisted type name (first field only)
//! ```
//!
//! Argument text is taken verbatim to the end of the word; commas cannot
//! appear in argument values.

use crate::error::{Error, Result};

const KNOWN: &[&str] = &[
    "-", "name", "nonzero", "noauto", "index", "unique", "ref", "default", "typename",
];

/// Parsed tag words of one field.
#[derive(Debug, Default)]
pub(crate) struct Tags {
    words: Vec<(String, String)>, // (tag, argument; possibly empty)
}

impl Tags {
    /// Parse a field's tag string. `pk` says whether this is the first
    /// (primary key) field, which gates `noauto` and `typename`.
    pub fn parse(s: &str, pk: bool) -> Result<Tags> {
        let mut words = Vec::new();
        for word in s.split(',') {
            let word = word.trim();
            if word.is_empty() {
                continue;
            }
            let (tag, arg) = match word.split_once(' ') {
                Some((t, a)) => (t, a.trim()),
                None => (word, ""),
            };
            if !KNOWN.contains(&tag) {
                return Err(Error::typ(format!("unknown field tag {tag:?}")));
            }
            match tag {
                "name" | "typename" | "ref" | "default" if arg.is_empty() => {
                    return Err(Error::typ(format!("tag {tag:?} requires a value")));
                }
                "nonzero" | "noauto" | "-" if !arg.is_empty() => {
                    return Err(Error::typ(format!("tag {tag:?} takes no value")));
                }
                "noauto" | "typename" if !pk => {
                    return Err(Error::typ(format!(
                        "tag {tag:?} is only valid on the primary key field"
                    )));
                }
                "-" if pk => {
                    return Err(Error::typ("cannot skip the primary key field"));
                }
                _ => {}
            }
            words.push((tag.to_string(), arg.to_string()));
        }
        Ok(Tags { words })
    }

    pub fn has(&self, tag: &str) -> bool {
        self.words.iter().any(|(t, a)| t == tag && a.is_empty())
    }

    /// The argument of a single-use tag, if present.
    pub fn get(&self, tag: &str) -> Result<Option<&str>> {
        let mut args = self.words.iter().filter(|(t, _)| t == tag);
        let first = args.next();
        if args.next().is_some() {
            return Err(Error::typ(format!("duplicate tag {tag:?}")));
        }
        Ok(first.map(|(_, a)| a.as_str()))
    }

    /// All non-empty arguments of a repeatable tag.
    pub fn list(&self, tag: &str) -> Vec<&str> {
        self.words
            .iter()
            .filter(|(t, a)| t == tag && !a.is_empty())
            .map(|(_, a)| a.as_str())
            .collect()
    }
}
