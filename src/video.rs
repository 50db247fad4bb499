//! Pluggable video decoding.
//!
//! The crate demuxes video but does not ship a VP8/VP9 decoder. Callers that want decoded
//! pictures install a [`VideoDecoder`] through [`crate::OpenOptions::video_decoder`]; without
//! one, `decode_frame` on a stream with a selected video track reports `DisabledFunction`.

/// Error type engines report. It is wrapped into [`crate::Error::Decode`].
pub type EngineError = Box<dyn std::error::Error + Send + Sync>;

/// A video decoding engine fed one compressed packet at a time.
pub trait VideoDecoder: Send {
    /// Decode `packet` and write the resulting picture into `out` (cleared by the caller).
    ///
    /// Returns `Ok(false)` when the packet produced no displayable picture (for example an
    /// invisible alt-ref frame); `out` is ignored in that case.
    fn decode(&mut self, packet: &[u8], keyframe: bool, out: &mut Vec<u8>)
    -> Result<bool, EngineError>;

    /// Drop any inter-frame state. Called after seeks and rewinds.
    fn reset(&mut self) {}
}
