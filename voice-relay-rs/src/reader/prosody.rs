//! Session-scoped prosody state and the `global` command.
//!
//! `global rate fast pitch low` (or `g rate:fast`) sets attributes that wrap
//! every following line in a `<prosody>` element. Parsing is atomic: a
//! command either applies every pair or none of them.

use std::fmt;

use tracing::{info, warn};

use super::{LineTransform, Transformed};

const GLOBAL_PREFIXES: [&str; 2] = ["global ", "g "];

const RATE_LEVELS: [&str; 5] = ["x-slow", "slow", "medium", "fast", "x-fast"];
const PITCH_LEVELS: [&str; 6] = ["x-low", "low", "medium", "high", "x-high", "robot"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProsodyAttr {
    Pitch,
    Rate,
}

impl ProsodyAttr {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "pitch" => Some(Self::Pitch),
            "rate" => Some(Self::Rate),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pitch => "pitch",
            Self::Rate => "rate",
        }
    }

    /// Values this attribute accepts. `robot` is a pitch level.
    pub fn levels(self) -> &'static [&'static str] {
        match self {
            Self::Pitch => &PITCH_LEVELS,
            Self::Rate => &RATE_LEVELS,
        }
    }

    pub fn accepts(self, value: &str) -> bool {
        self.levels().contains(&value)
    }
}

impl fmt::Display for ProsodyAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a `global` command was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalSyntaxError {
    OddTokenCount(usize),
    UnknownAttribute(String),
    InvalidValue { attr: ProsodyAttr, value: String },
}

impl fmt::Display for GlobalSyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OddTokenCount(n) => write!(f, "expected attribute/value pairs, got {n} tokens"),
            Self::UnknownAttribute(a) => write!(f, "unknown prosody attribute '{a}'"),
            Self::InvalidValue { attr, value } => write!(
                f,
                "'{value}' is not a valid {attr} (expected one of {})",
                attr.levels().join(", ")
            ),
        }
    }
}

/// Prosody attributes in the order they were first set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProsodySession {
    attributes: Vec<(ProsodyAttr, &'static str)>,
}

impl ProsodySession {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn get(&self, attr: ProsodyAttr) -> Option<&'static str> {
        self.attributes
            .iter()
            .find(|(a, _)| *a == attr)
            .map(|(_, v)| *v)
    }

    pub fn attributes(&self) -> &[(ProsodyAttr, &'static str)] {
        &self.attributes
    }

    /// Overrides keep the attribute's original position.
    fn set(&mut self, attr: ProsodyAttr, value: &'static str) {
        match self.attributes.iter_mut().find(|(a, _)| *a == attr) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((attr, value)),
        }
    }

    /// Parse `attr value [attr value ...]` and apply it only if every pair
    /// is valid.
    pub fn apply_command(&mut self, args: &str) -> Result<(), GlobalSyntaxError> {
        let normalized = args.replace(':', " ");
        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        if tokens.len() % 2 != 0 {
            return Err(GlobalSyntaxError::OddTokenCount(tokens.len()));
        }

        let mut pending = Vec::with_capacity(tokens.len() / 2);
        for pair in tokens.chunks_exact(2) {
            let attr = ProsodyAttr::parse(pair[0])
                .ok_or_else(|| GlobalSyntaxError::UnknownAttribute(pair[0].to_string()))?;
            let value = attr
                .levels()
                .iter()
                .copied()
                .find(|level| *level == pair[1])
                .ok_or_else(|| GlobalSyntaxError::InvalidValue {
                    attr,
                    value: pair[1].to_string(),
                })?;
            pending.push((attr, value));
        }

        for (attr, value) in pending {
            self.set(attr, value);
        }
        Ok(())
    }

    /// Opening `<prosody ...>` tag for the current attributes.
    pub fn open_tag(&self) -> String {
        let mut tag = String::from("<prosody");
        for (attr, value) in &self.attributes {
            tag.push_str(&format!(" {attr}=\"{value}\""));
        }
        tag.push('>');
        tag
    }
}

impl fmt::Display for ProsodySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .attributes
            .iter()
            .map(|(a, v)| format!("{a}={v}"))
            .collect();
        write!(f, "{{{}}}", pairs.join(", "))
    }
}

/// Line transform that handles `global` commands and wraps literal text.
#[derive(Debug, Default)]
pub struct ProsodyPreprocessor {
    session: ProsodySession,
}

impl ProsodyPreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> &ProsodySession {
        &self.session
    }

    pub fn process(&mut self, line: &str) -> Transformed {
        if let Some(args) = GLOBAL_PREFIXES.iter().find_map(|p| line.strip_prefix(p)) {
            match self.session.apply_command(args) {
                Ok(()) => info!("Set prosody attrs to: {}", self.session),
                Err(e) => warn!("Wrong global prosody syntax: {e}"),
            }
            return Transformed::Suppressed;
        }

        if self.session.is_empty() {
            return Transformed::Text(line.to_string());
        }

        Transformed::Text(format!("{}{line}</prosody>", self.session.open_tag()))
    }
}

impl LineTransform for ProsodyPreprocessor {
    fn apply(&mut self, line: &str) -> Transformed {
        self.process(line)
    }
}
