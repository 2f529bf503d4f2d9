//! Interactive line-command reader.
//!
//! Line protocol:
//! - `exit` / `stop` (prefix) ends the session
//! - `speaker <name>` switches the default speaker
//! - everything else goes through the transform list and is spoken

use tracing::{debug, info, warn};

use super::{wrap_root, LineTransform, SpeakerId, SpeakerSet, TextItem, TextSource, Transformed};

const EXIT_PREFIXES: [&str; 2] = ["exit", "stop"];

pub struct CommandReader {
    lines: Box<dyn Iterator<Item = String> + Send>,
    speakers: SpeakerSet,
    speaker: Option<SpeakerId>,
    transforms: Vec<Box<dyn LineTransform>>,
    closed: bool,
}

/// What a single trimmed input line asks for.
enum Command<'a> {
    Exit,
    Speaker(&'a str),
    Text(&'a str),
}

fn classify(line: &str) -> Command<'_> {
    if EXIT_PREFIXES.iter().any(|p| line.starts_with(p)) {
        return Command::Exit;
    }
    if let Some(rest) = line.strip_prefix("speaker") {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            return Command::Speaker(rest.trim());
        }
    }
    Command::Text(line)
}

impl CommandReader {
    pub fn new(
        lines: Box<dyn Iterator<Item = String> + Send>,
        speakers: SpeakerSet,
        default_speaker: Option<SpeakerId>,
        transforms: Vec<Box<dyn LineTransform>>,
    ) -> Self {
        Self {
            lines,
            speakers,
            speaker: default_speaker,
            transforms,
            closed: false,
        }
    }

    pub fn speaker(&self) -> Option<&SpeakerId> {
        self.speaker.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle one raw line. `None` means the session should end,
    /// `Some(None)` means the line produced no item.
    fn handle_line(&mut self, raw: &str) -> Option<Option<TextItem>> {
        let line = raw.trim();
        match classify(line) {
            Command::Exit => None,
            Command::Speaker(name) => {
                match self.speakers.resolve(name) {
                    Some(speaker) => {
                        info!("Speaker set to {speaker}");
                        self.speaker = Some(speaker);
                    }
                    None => {
                        let known: Vec<&str> = self.speakers.names().collect();
                        warn!("Wrong speaker '{name}', expected one of: {}", known.join(", "));
                    }
                }
                Some(None)
            }
            Command::Text("") => Some(None),
            Command::Text(text) => {
                let mut current = text.to_string();
                for transform in &mut self.transforms {
                    match transform.apply(&current) {
                        Transformed::Suppressed => return Some(None),
                        Transformed::Text(next) => current = next,
                    }
                }
                Some(Some(TextItem {
                    markup: wrap_root(&current),
                    speaker: self.speaker.clone(),
                }))
            }
        }
    }
}

impl TextSource for CommandReader {
    fn configure(&mut self) {
        info!("Type text to speak. Type exit or stop to quit");
    }

    fn read(&mut self) -> Box<dyn Iterator<Item = TextItem> + '_> {
        Box::new(std::iter::from_fn(move || loop {
            if self.closed {
                return None;
            }
            let Some(raw) = self.lines.next() else {
                debug!("Input exhausted");
                return None;
            };
            match self.handle_line(&raw) {
                None => {
                    info!("exit");
                    return None;
                }
                Some(Some(item)) => return Some(item),
                Some(None) => continue,
            }
        }))
    }

    fn close(&mut self) {
        self.closed = true;
        debug!("CommandReader closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ProsodyPreprocessor;

    fn speakers() -> SpeakerSet {
        SpeakerSet::new(["af_heart", "am_adam"])
    }

    fn reader(lines: &[&str]) -> CommandReader {
        let lines: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        let set = speakers();
        let default = set.resolve("af_heart");
        CommandReader::new(
            Box::new(lines.into_iter()),
            set,
            default,
            vec![Box::new(ProsodyPreprocessor::new())],
        )
    }

    fn collect(r: &mut CommandReader) -> Vec<TextItem> {
        r.read().collect()
    }

    #[test]
    fn prosody_then_text_then_stop() {
        let mut r = reader(&["global rate fast", "hello", "stop", "never read"]);
        let items = collect(&mut r);
        assert_eq!(
            items,
            vec![TextItem {
                markup: r#"<speak><prosody rate="fast">hello</prosody></speak>"#.into(),
                speaker: speakers().resolve("af_heart"),
            }]
        );
    }

    #[test]
    fn plain_text_gets_only_root_wrapper() {
        let mut r = reader(&["  hello world  "]);
        let items = collect(&mut r);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].markup, "<speak>hello world</speak>");
    }

    #[test]
    fn immediate_exit_is_empty() {
        let mut r = reader(&["exit"]);
        assert!(collect(&mut r).is_empty());

        let mut r = reader(&[]);
        assert!(collect(&mut r).is_empty());
    }

    #[test]
    fn exit_matches_by_prefix() {
        let mut r = reader(&["stopwatch", "hello"]);
        assert!(collect(&mut r).is_empty());
    }

    #[test]
    fn unknown_speaker_is_rejected() {
        let mut r = reader(&["speaker unknown_name", "hi"]);
        let items = collect(&mut r);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].speaker.as_ref().map(SpeakerId::as_str), Some("af_heart"));
        assert_eq!(r.speaker().map(SpeakerId::as_str), Some("af_heart"));
    }

    #[test]
    fn known_speaker_applies_to_following_items() {
        let mut r = reader(&["first", "speaker am_adam", "second"]);
        let items = collect(&mut r);
        let speakers: Vec<&str> = items
            .iter()
            .filter_map(|i| i.speaker.as_ref().map(SpeakerId::as_str))
            .collect();
        assert_eq!(speakers, vec!["af_heart", "am_adam"]);
    }

    #[test]
    fn bare_speaker_command_is_rejected_without_item() {
        let mut r = reader(&["speaker", "speakers are loud"]);
        let items = collect(&mut r);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].markup, "<speak>speakers are loud</speak>");
    }

    #[test]
    fn malformed_global_produces_no_item() {
        let mut r = reader(&["g rate", "g rate fast pitch nope", "text"]);
        let items = collect(&mut r);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].markup, "<speak>text</speak>");
    }

    #[test]
    fn transforms_run_in_order() {
        struct Upper;
        impl LineTransform for Upper {
            fn apply(&mut self, line: &str) -> Transformed {
                Transformed::Text(line.to_uppercase())
            }
        }
        struct DropShouting;
        impl LineTransform for DropShouting {
            fn apply(&mut self, line: &str) -> Transformed {
                if line.ends_with('!') {
                    Transformed::Suppressed
                } else {
                    Transformed::Text(line.to_string())
                }
            }
        }

        let lines = vec!["hey!".to_string(), "hey".to_string()];
        let mut r = CommandReader::new(
            Box::new(lines.into_iter()),
            speakers(),
            None,
            vec![Box::new(DropShouting), Box::new(Upper)],
        );
        let items = collect(&mut r);
        assert_eq!(items, vec![TextItem { markup: "<speak>HEY</speak>".into(), speaker: None }]);
    }

    #[test]
    fn closed_reader_yields_nothing() {
        let mut r = reader(&["hello"]);
        r.configure();
        r.close();
        assert!(r.is_closed());
        assert!(collect(&mut r).is_empty());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut r = reader(&["", "   ", "hello", "exit"]);
        let items = collect(&mut r);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].markup, "<speak>hello</speak>");
    }
}
