use std::path::Path;

use super::ps;
use crate::error::Result;

/// A PS file replayed frame by frame in a loop.
///
/// The whole file is read into memory once. Frames are the byte ranges
/// between consecutive pack-header start codes (`00 00 01 BA`); bytes before
/// the first start code are treated as a frame of their own. When the end is
/// reached, playback wraps to the beginning.
#[derive(Debug)]
pub struct MediaSource {
    data: Vec<u8>,
    boundaries: Vec<usize>,
    cursor: usize,
}

impl MediaSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), bytes = data.len(), "media source loaded");
        Ok(Self::from_bytes(data))
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut boundaries: Vec<usize> = (0..data.len())
            .filter(|&i| ps::is_pack_start(&data[i..]))
            .collect();
        if boundaries.first() != Some(&0) {
            boundaries.insert(0, 0);
        }
        boundaries.push(data.len());
        boundaries.dedup();
        Self {
            data,
            boundaries,
            cursor: 0,
        }
    }

    /// Number of frames in one pass over the file.
    pub fn frame_count(&self) -> usize {
        self.boundaries.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Next frame, wrapping around at the end. `None` only for an empty file.
    pub fn next_frame(&mut self) -> Option<&[u8]> {
        if self.frame_count() == 0 {
            return None;
        }
        if self.cursor >= self.frame_count() {
            tracing::trace!("media source wrapped");
            self.cursor = 0;
        }
        let start = self.boundaries[self.cursor];
        let end = self.boundaries[self.cursor + 1];
        self.cursor += 1;
        Some(&self.data[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_pack_headers_and_wraps() {
        let mut data = vec![0, 0, 1, 0xBA, 1, 2];
        data.extend([0, 0, 1, 0xBA, 3]);
        let mut src = MediaSource::from_bytes(data);
        assert_eq!(src.frame_count(), 2);
        assert_eq!(src.next_frame().unwrap(), &[0, 0, 1, 0xBA, 1, 2]);
        assert_eq!(src.next_frame().unwrap(), &[0, 0, 1, 0xBA, 3]);
        assert_eq!(src.next_frame().unwrap(), &[0, 0, 1, 0xBA, 1, 2]);
    }

    #[test]
    fn leading_bytes_form_a_frame() {
        let mut src = MediaSource::from_bytes(vec![9, 9, 0, 0, 1, 0xBA]);
        assert_eq!(src.frame_count(), 2);
        assert_eq!(src.next_frame().unwrap(), &[9, 9]);
    }

    #[test]
    fn empty_source() {
        let mut src = MediaSource::from_bytes(Vec::new());
        assert!(src.is_empty());
        assert!(src.next_frame().is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(MediaSource::open("/nonexistent/gbsim/test.dat").is_err());
    }
}
