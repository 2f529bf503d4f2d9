//! voice-relay: text-to-speech relay.
//!
//! A [`pipeline::Pipeline`] pulls markup from a [`reader::TextSource`], turns
//! it into audio with a [`synth::Synthesizer`] and hands the audio to an
//! [`sink::AudioSink`] that may fan out to several devices.

pub mod config;
pub mod pipeline;
pub mod reader;
pub mod sink;
pub mod synth;
