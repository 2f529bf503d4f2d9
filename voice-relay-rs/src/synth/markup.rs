//! Parser for the speech markup subset the synthesizer understands.
//!
//! Supported elements: `speak` (root), `prosody` (`rate`, `pitch`),
//! `break` (`time`, `strength`), `p` and `s`. The document is parsed with
//! roxmltree, then flattened into speech segments, each carrying its
//! effective prosody, plus pauses.

use std::time::Duration;

use roxmltree::{Document, Node};

use super::{ProsodyTagError, SynthesisError};
use crate::reader::{ProsodyAttr, ROOT_TAG};

/// Longest pause a single `<break>` may request.
pub const MAX_BREAK: Duration = Duration::from_secs(10);

/// Effective prosody of a text run; `None` means engine default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prosody {
    pub rate: Option<&'static str>,
    pub pitch: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Speech { text: String, prosody: Prosody },
    Pause(Duration),
}

fn malformed(msg: impl Into<String>) -> SynthesisError {
    SynthesisError::MalformedMarkup(msg.into())
}

/// Parse `markup` into segments, or report why it cannot be spoken.
pub fn parse(markup: &str) -> Result<Vec<Segment>, SynthesisError> {
    let doc = Document::parse(markup).map_err(|e| malformed(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != ROOT_TAG {
        return Err(malformed(format!(
            "expected <{ROOT_TAG}> root, found <{}>",
            root.tag_name().name()
        )));
    }

    let mut segments = Vec::new();
    walk_children(root, Prosody::default(), &mut segments)?;
    Ok(segments)
}

fn walk_children(
    node: Node<'_, '_>,
    prosody: Prosody,
    segments: &mut Vec<Segment>,
) -> Result<(), SynthesisError> {
    for child in node.children() {
        if child.is_text() {
            let text = child.text().unwrap_or_default();
            if !text.trim().is_empty() {
                segments.push(Segment::Speech {
                    text: text.to_string(),
                    prosody,
                });
            }
        } else if child.is_element() {
            walk_element(child, prosody, segments)?;
        }
    }
    Ok(())
}

fn walk_element(
    node: Node<'_, '_>,
    inherited: Prosody,
    segments: &mut Vec<Segment>,
) -> Result<(), SynthesisError> {
    match node.tag_name().name() {
        "prosody" => {
            let prosody = prosody_from_attrs(node, inherited)?;
            if !has_speech(node) {
                return Err(ProsodyTagError::Empty.into());
            }
            walk_children(node, prosody, segments)
        }
        "break" => {
            if node.children().any(|c| c.is_element() || c.is_text()) {
                return Err(malformed("<break> cannot have content"));
            }
            segments.push(Segment::Pause(break_duration(node)?));
            Ok(())
        }
        name @ ("p" | "s") => {
            if let Some(attr) = node.attributes().next() {
                return Err(malformed(format!(
                    "unsupported attribute '{}' on <{name}>",
                    attr.name()
                )));
            }
            walk_children(node, inherited, segments)
        }
        ROOT_TAG => Err(malformed(format!("nested <{ROOT_TAG}> element"))),
        other => Err(malformed(format!("unsupported element <{other}>"))),
    }
}

/// True if any text below `node` is more than whitespace.
fn has_speech(node: Node<'_, '_>) -> bool {
    node.descendants()
        .filter(|n| n.is_text())
        .any(|n| n.text().is_some_and(|t| !t.trim().is_empty()))
}

fn prosody_from_attrs(node: Node<'_, '_>, inherited: Prosody) -> Result<Prosody, SynthesisError> {
    if node.attributes().next().is_none() {
        return Err(ProsodyTagError::Invalid("no attributes".into()).into());
    }
    let mut prosody = inherited;
    for attribute in node.attributes() {
        let (name, value) = (attribute.name(), attribute.value());
        let attr = ProsodyAttr::parse(name)
            .ok_or_else(|| ProsodyTagError::Invalid(format!("unknown attribute '{name}'")))?;
        let level = attr
            .levels()
            .iter()
            .copied()
            .find(|level| *level == value)
            .ok_or_else(|| ProsodyTagError::Invalid(format!("'{value}' is not a valid {attr}")))?;
        match attr {
            ProsodyAttr::Rate => prosody.rate = Some(level),
            ProsodyAttr::Pitch => prosody.pitch = Some(level),
        }
    }
    Ok(prosody)
}

fn break_duration(node: Node<'_, '_>) -> Result<Duration, SynthesisError> {
    for attribute in node.attributes() {
        if !matches!(attribute.name(), "time" | "strength") {
            return Err(malformed(format!(
                "unsupported attribute '{}' on <break>",
                attribute.name()
            )));
        }
    }

    if let Some(time) = node.attribute("time") {
        return parse_time(time);
    }
    match node.attribute("strength").unwrap_or("medium") {
        "none" => Ok(Duration::ZERO),
        "x-weak" => Ok(Duration::from_millis(50)),
        "weak" => Ok(Duration::from_millis(150)),
        "medium" => Ok(Duration::from_millis(300)),
        "strong" => Ok(Duration::from_millis(600)),
        "x-strong" => Ok(Duration::from_millis(1000)),
        other => Err(malformed(format!("invalid break strength '{other}'"))),
    }
}

/// `250ms` or `1.5s`, at most [`MAX_BREAK`].
fn parse_time(value: &str) -> Result<Duration, SynthesisError> {
    let (number, secs_per_unit) = if let Some(n) = value.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1.0)
    } else {
        return Err(malformed(format!("break time '{value}' needs an ms or s unit")));
    };
    let amount: f64 = number
        .trim()
        .parse()
        .map_err(|_| malformed(format!("invalid break time '{value}'")))?;
    let duration = Duration::try_from_secs_f64(amount * secs_per_unit)
        .map_err(|_| malformed(format!("invalid break time '{value}'")))?;
    if duration > MAX_BREAK {
        return Err(malformed(format!(
            "break time '{value}' exceeds {}s",
            MAX_BREAK.as_secs()
        )));
    }
    Ok(duration)
}
