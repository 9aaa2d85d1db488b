//! Instant-boot A/B slots.
//!
//! The VM state is snapshotted into one of two monitor snapshots,
//! `instantbootA` or `instantbootB`. A one-letter marker file records which
//! slot the next boot resumes from; saves always go to the other slot and the
//! marker only flips once the save has landed, so a torn save never leaves
//! the marker pointing at a half-written snapshot.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::SlotError;

const TAG_PREFIX: &str = "instantboot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootSlot {
    #[default]
    A,
    B,
}

impl BootSlot {
    pub fn opposite(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    /// Monitor snapshot name for this slot.
    pub fn tag(self) -> String {
        format!("{TAG_PREFIX}{}", self.as_str())
    }

    fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            _ => None,
        }
    }
}

impl fmt::Display for BootSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The slot marker on disk.
#[derive(Debug, Clone)]
pub struct BootSlots {
    path: PathBuf,
}

impl BootSlots {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The slot the next boot should resume from.
    ///
    /// Creates the marker, pointing at [`BootSlot::A`], if it does not exist.
    pub fn current(&self) -> Result<BootSlot, SlotError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no slot marker; starting at A");
                self.commit(BootSlot::default())?;
                return Ok(BootSlot::default());
            }
            Err(source) => return Err(self.io_error(source)),
        };

        BootSlot::parse(&text).ok_or_else(|| SlotError::Corrupt {
            path: self.path.clone(),
            found: text,
        })
    }

    /// The slot the next save should write to.
    pub fn next(&self) -> Result<BootSlot, SlotError> {
        Ok(self.current()?.opposite())
    }

    /// Points the marker at `slot`.
    pub fn commit(&self, slot: BootSlot) -> Result<(), SlotError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, slot.as_str()).map_err(|e| self.io_error(e))?;
        fs::rename(&staging, &self.path).map_err(|e| self.io_error(e))?;
        info!(slot = %slot, "instant-boot slot committed");
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> SlotError {
        SlotError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
