//! Audio capture and segmentation.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod segmenter;
pub mod source;
pub mod subprocess;
pub mod wav;
