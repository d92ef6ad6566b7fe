//! Append-only, user-attributed audit log carried by every workflow entity.
use std::fmt;

use crate::types::TimeStamp;

const SEPARATOR: &str = "--------------------";

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Note {
    #[n(0)]
    pub at: TimeStamp,
    #[n(1)]
    pub author: String,
    #[n(2)]
    pub label: Option<String>,
    #[n(3)]
    pub body: String,
}

impl Note {
    pub fn new(at: TimeStamp, author: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            at,
            author: author.into(),
            label: None,
            body: body.into(),
        }
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamp = self.at.to_datetime_utc().format("%Y-%m-%d %H:%M");
        match &self.label {
            Some(label) => writeln!(f, "[{stamp} - {} - {label}]:", self.author)?,
            None => writeln!(f, "[{stamp} - {}]:", self.author)?,
        }
        writeln!(f, "{}", self.body)?;
        writeln!(f, "{SEPARATOR}")
    }
}

/// Most recent entry first. Entries are never edited or removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Notes(#[n(0)] Vec<Note>);

impl Notes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, note: Note) {
        self.0.insert(0, note);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn latest(&self) -> Option<&Note> {
        self.0.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Note> {
        self.0.iter()
    }

    /// The whole log rendered as text.
    pub fn render(&self) -> String {
        self.0.iter().map(Note::to_string).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.0
            .iter()
            .any(|note| note.body.contains(needle) || note.label.as_deref() == Some(needle))
    }
}
