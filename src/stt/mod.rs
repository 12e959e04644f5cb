//! Speech-to-text recognition backends.

pub mod recognizer;
pub mod whisper;
