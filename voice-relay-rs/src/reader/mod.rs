//! Text sources: anything that turns external input into speakable markup.
//!
//! A source is configured once, read as a lazy pull-based sequence of
//! [`TextItem`]s, then closed. Line rewriting is delegated to an explicit,
//! ordered list of [`LineTransform`]s supplied when the source is built.

pub mod command;
pub mod lines;
pub mod prosody;
pub mod queue;

use std::collections::BTreeSet;
use std::fmt;

pub use command::CommandReader;
pub use lines::StdinLines;
pub use prosody::{ProsodyAttr, ProsodyPreprocessor, ProsodySession};
pub use queue::{QueueHandle, QueueReader};

/// Root element every emitted utterance is wrapped in.
pub const ROOT_TAG: &str = "speak";

/// Validated speaker (voice) name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpeakerId(String);

impl SpeakerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of speakers a reader accepts.
#[derive(Debug, Clone, Default)]
pub struct SpeakerSet {
    names: BTreeSet<String>,
}

impl SpeakerSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the speaker if `name` is recognized.
    pub fn resolve(&self, name: &str) -> Option<SpeakerId> {
        self.names
            .contains(name)
            .then(|| SpeakerId(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// One unit of speakable work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextItem {
    pub markup: String,
    pub speaker: Option<SpeakerId>,
}

/// Result of running a line through a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    /// The line was consumed (a command, or a rejected one); emit nothing.
    Suppressed,
    Text(String),
}

/// A rewriting step applied to each literal input line, in list order.
pub trait LineTransform: Send {
    fn apply(&mut self, line: &str) -> Transformed;
}

/// Capability interface every text source implements.
pub trait TextSource: Send {
    fn configure(&mut self);

    /// Lazily yields items until the input ends or an exit command arrives.
    fn read(&mut self) -> Box<dyn Iterator<Item = TextItem> + '_>;

    fn close(&mut self);
}

/// Wrap an utterance in the root element.
pub fn wrap_root(text: &str) -> String {
    format!("<{ROOT_TAG}>{text}</{ROOT_TAG}>")
}
