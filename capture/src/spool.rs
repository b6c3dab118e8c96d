//! On-disk staging for in-memory frame transfers.
//!
//! A memory session's frames are written out as they arrive, so the server
//! holds at most the frame channel's capacity in memory no matter how long
//! the session runs. The transfer is then streamed from disk.

use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::Frame;

#[derive(Debug)]
pub struct FrameSpool {
    dir: PathBuf,
    entries: Vec<(String, PathBuf)>,
}

impl FrameSpool {
    /// Create an empty spool for one session under `root`.
    pub async fn create(root: &Path, session_id: u64) -> io::Result<Self> {
        let dir = root.join(format!("session-{session_id}"));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            entries: Vec::new(),
        })
    }

    pub async fn push(&mut self, frame: Frame) -> io::Result<()> {
        let path = self.dir.join(format!("{:06}.frame", self.entries.len()));
        tokio::fs::write(&path, &frame.data).await?;
        self.entries.push((frame.name, path));
        Ok(())
    }

    /// Drain `frames` until the sender side closes.
    pub async fn fill(&mut self, frames: Option<mpsc::Receiver<Frame>>) -> io::Result<()> {
        let Some(mut frames) = frames else {
            return Ok(());
        };
        while let Some(frame) = frames.recv().await {
            self.push(frame).await?;
        }
        debug!("Spooled {} frame(s) in {}", self.entries.len(), self.dir.display());
        Ok(())
    }

    /// Transfer names paired with their spooled payloads, in arrival order.
    pub fn entries(&self) -> &[(String, PathBuf)] {
        &self.entries
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn remove(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!("Cannot remove spool {}: {e}", self.dir.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(i: usize) -> Frame {
        Frame {
            name: format!("frame-{i}.jpg"),
            data: vec![(i % 251) as u8; 4096 + i],
        }
    }

    #[tokio::test]
    async fn test_fill_keeps_frames_on_disk() {
        let root = tempfile::tempdir().unwrap();
        let mut spool = FrameSpool::create(root.path(), 7).await.unwrap();
        assert!(spool.dir().ends_with("session-7"));

        let (tx, rx) = mpsc::channel(2);
        let producer = tokio::spawn(async move {
            for i in 0..50 {
                tx.send(frame(i)).await.unwrap();
                // never more than the channel capacity waiting in memory
                assert!(tx.max_capacity() - tx.capacity() <= 2);
            }
        });
        spool.fill(Some(rx)).await.unwrap();
        producer.await.unwrap();

        assert_eq!(spool.entries().len(), 50);
        for (i, (name, path)) in spool.entries().iter().enumerate() {
            assert_eq!(name, &format!("frame-{i}.jpg"));
            assert!(path.starts_with(spool.dir()));
            assert_eq!(std::fs::read(path).unwrap(), frame(i).data);
        }

        let dir = spool.dir().to_path_buf();
        spool.remove().await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_fill_without_frames() {
        let root = tempfile::tempdir().unwrap();
        let mut spool = FrameSpool::create(root.path(), 1).await.unwrap();
        spool.fill(None).await.unwrap();
        assert!(spool.entries().is_empty());
        spool.remove().await;
    }
}
