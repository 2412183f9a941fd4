use std::collections::VecDeque;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::MusicError;

/// One playable item. The `id` is resolved to a streaming URL only when the
/// track becomes current, never at queue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub url: String,
}

impl Track {
    pub fn from_video(id: impl Into<String>, title: impl Into<String>) -> Self {
        let id = id.into();
        let url = format!("https://www.youtube.com/watch?v={id}");
        Track {
            id,
            title: title.into(),
            url,
        }
    }
}

/// Insertion-ordered track list owned by exactly one session.
#[derive(Debug, Default)]
pub struct TrackQueue {
    tracks: VecDeque<Track>,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail, returning the new queue length.
    pub fn append(&mut self, track: Track) -> usize {
        self.tracks.push_back(track);
        self.tracks.len()
    }

    /// Insert at the head (used when a preserved current track is re-queued).
    pub fn push_front(&mut self, track: Track) {
        self.tracks.push_front(track);
    }

    pub fn pop_front(&mut self) -> Option<Track> {
        self.tracks.pop_front()
    }

    /// Remove the track at `from` and reinsert it at `to`, preserving the
    /// relative order of everything else. Both indexes are validated against
    /// the pre-removal length.
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<(), MusicError> {
        let len = self.tracks.len();
        if from >= len || to >= len {
            return Err(MusicError::InvalidIndex { from, to, len });
        }
        if from == to {
            return Ok(());
        }
        let track = self
            .tracks
            .remove(from)
            .ok_or(MusicError::InvalidIndex { from, to, len })?;
        self.tracks.insert(to, track);
        Ok(())
    }

    /// Uniform random permutation. An empty queue is an error so the UI can
    /// tell it apart from a successful no-op on a one-element queue.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) -> Result<(), MusicError> {
        if self.tracks.is_empty() {
            return Err(MusicError::EmptyQueue);
        }
        if self.tracks.len() > 1 {
            self.tracks.make_contiguous().shuffle(rng);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn take_all(&mut self) -> VecDeque<Track> {
        std::mem::take(&mut self.tracks)
    }

    pub fn replace_all(&mut self, tracks: VecDeque<Track>) {
        self.tracks = tracks;
    }
}
