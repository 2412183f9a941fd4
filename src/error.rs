use thiserror::Error;

/// Catch-all error for the binary's outer edges (startup, command dispatch).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Domain errors for session, queue and playback operations.
///
/// Every operation returns one of these as a structured result; nothing in
/// the orchestration core panics or surfaces a raw error to an end user.
#[derive(Debug, Error)]
pub enum MusicError {
    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("nothing is playing")]
    NothingPlaying,

    #[error("no tracks in queue to play")]
    NothingToPlay,

    #[error("queue is empty")]
    EmptyQueue,

    #[error("index out of range: {from} -> {to} with queue length {len}")]
    InvalidIndex { from: usize, to: usize, len: usize },

    #[error("voice transport: {0}")]
    Transport(String),

    #[error("metadata service: {0}")]
    Metadata(String),

    #[error("audio extraction: {0}")]
    Extraction(String),

    #[error("surface push: {0}")]
    Surface(String),
}

impl MusicError {
    /// Short pre-written message shown on control surfaces. Raw error detail
    /// stays in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            MusicError::NotConnected => "Not connected to a voice channel",
            MusicError::NothingPlaying => "Nothing is playing right now",
            MusicError::NothingToPlay => "No tracks in queue to play",
            MusicError::EmptyQueue => "Queue is empty, nothing to shuffle",
            MusicError::InvalidIndex { .. } => "That queue position does not exist",
            MusicError::Transport(_) => "Could not reach the voice channel, try again",
            MusicError::Metadata(_) => "Track lookup failed, try again",
            MusicError::Extraction(_) => "Could not fetch audio for that track",
            MusicError::Surface(_) => "Display update failed",
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(
            self,
            MusicError::Transport(_)
                | MusicError::Metadata(_)
                | MusicError::Extraction(_)
                | MusicError::Surface(_)
        )
    }
}

impl From<reqwest::Error> for MusicError {
    fn from(e: reqwest::Error) -> Self {
        MusicError::Metadata(e.to_string())
    }
}
