//! Event-fed reader for GUI front-ends.
//!
//! Text panes and macro buttons hold a cloneable [`QueueHandle`] and push
//! two kinds of events: text to speak and prosody template changes. The
//! reader applies the template, so all formatting state lives on the
//! pipeline side.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{wrap_root, SpeakerId, TextItem, TextSource};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PLACEHOLDER: &str = "{}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueueEvent {
    Text(String),
    ProsodyTemplate(String),
}

/// Sending side given to the front-end. Dropping every handle ends the
/// reader's sequence.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: Sender<QueueEvent>,
}

impl QueueHandle {
    /// Returns false once the reader is gone.
    pub fn enqueue(&self, text: impl Into<String>) -> bool {
        self.tx.send(QueueEvent::Text(text.into())).is_ok()
    }

    pub fn set_prosody_template(&self, template: impl Into<String>) -> bool {
        self.tx.send(QueueEvent::ProsodyTemplate(template.into())).is_ok()
    }
}

pub struct QueueReader {
    rx: Receiver<QueueEvent>,
    speaker: Option<SpeakerId>,
    template: String,
    cancel: CancellationToken,
    stopped: bool,
}

impl QueueReader {
    pub fn new(speaker: Option<SpeakerId>, cancel: CancellationToken) -> (Self, QueueHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let reader = Self {
            rx,
            speaker,
            template: String::new(),
            cancel,
            stopped: false,
        };
        (reader, QueueHandle { tx })
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.update_template(template);
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    fn update_template(&mut self, template: &str) {
        if !template.is_empty() && !template.contains(PLACEHOLDER) {
            warn!("Prosody template '{template}' has no {PLACEHOLDER} placeholder, keeping previous");
            return;
        }
        debug!("Prosody template set to '{template}'");
        self.template = template.to_string();
    }

    fn format(&self, text: &str) -> String {
        if self.template.is_empty() {
            text.to_string()
        } else {
            self.template.replacen(PLACEHOLDER, text, 1)
        }
    }

    fn next_item(&mut self) -> Option<TextItem> {
        loop {
            if self.stopped || self.cancel.is_cancelled() {
                return None;
            }
            let event = match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("All queue handles dropped");
                    return None;
                }
            };
            match event {
                QueueEvent::ProsodyTemplate(template) => self.update_template(&template),
                QueueEvent::Text(text) => {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    return Some(TextItem {
                        markup: wrap_root(&self.format(text)),
                        speaker: self.speaker.clone(),
                    });
                }
            }
        }
    }
}

impl TextSource for QueueReader {
    fn configure(&mut self) {
        info!("QueueReader ready");
    }

    fn read(&mut self) -> Box<dyn Iterator<Item = TextItem> + '_> {
        Box::new(std::iter::from_fn(move || self.next_item()))
    }

    fn close(&mut self) {
        self.stopped = true;
        info!("QueueReader closed");
    }
}
