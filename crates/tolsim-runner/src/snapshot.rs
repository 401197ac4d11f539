use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tolsim_core::{atomic_write_bytes, sha256_bytes, sha256_file};

/// Pristine copy of the circuit description, captured before the first
/// trial. While dirty, dropping the snapshot writes the pristine bytes back,
/// so early returns and panics inside the trial loop still leave the file as
/// it was found.
#[derive(Debug)]
pub struct PristineSnapshot {
    path: PathBuf,
    bytes: Vec<u8>,
    digest: String,
    dirty: bool,
}

impl PristineSnapshot {
    pub fn capture(path: &Path) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        let digest = sha256_bytes(&bytes);
        tracing::debug!(path = %path.display(), %digest, "captured pristine description");
        Ok(Self {
            path: path.to_path_buf(),
            bytes,
            digest,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Atomically replace the description. The rename is the last fallible
    /// step of the write, so an error means the file on disk is untouched and
    /// the snapshot stays clean.
    pub fn write_perturbed(&mut self, bytes: &[u8]) -> io::Result<()> {
        atomic_write_bytes(&self.path, bytes)?;
        self.dirty = true;
        Ok(())
    }

    pub fn restore(&mut self) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        atomic_write_bytes(&self.path, &self.bytes)?;
        self.dirty = false;
        Ok(())
    }

    /// True when the on-disk file hashes to the captured digest.
    pub fn verify(&self) -> io::Result<bool> {
        Ok(sha256_file(&self.path)? == self.digest)
    }
}

impl Drop for PristineSnapshot {
    fn drop(&mut self) {
        if !self.dirty {
            return;
        }
        match self.restore() {
            Ok(()) => tracing::info!(path = %self.path.display(), "restored pristine description"),
            Err(e) => tracing::error!(
                path = %self.path.display(),
                error = %e,
                "failed to restore pristine description"
            ),
        }
    }
}
