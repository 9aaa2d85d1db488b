//! Bounded copies of caller inputs.
//!
//! Every path and name crosses into C strings inside the monitor, so each is
//! checked for NUL bytes and held to [`InputLimits::max_bytes`]. Over-long
//! inputs are rejected unless the config opts into truncation.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::{InputLimits, OverLengthPolicy};
use crate::error::LaunchError;
use crate::vm::LaunchRequest;
use crate::vm::engine::EngineLocator;

impl InputLimits {
    /// Returns an owned, validated copy of `request`.
    ///
    /// Empty optional inputs, including ones truncated to nothing, are
    /// treated as absent.
    pub(crate) fn copy_request(&self, request: &LaunchRequest) -> Result<LaunchRequest, LaunchError> {
        let engine = match &request.engine {
            EngineLocator::Library(path) => {
                EngineLocator::Library(self.required_path("engine", path)?)
            }
            EngineLocator::Static => EngineLocator::Static,
        };

        Ok(LaunchRequest {
            engine,
            kernel_path: self.required_path("kernel", &request.kernel_path)?,
            initrd_path: self.required_path("initrd", &request.initrd_path)?,
            bios_dir: self.required_path("bios", &request.bios_dir)?,
            disk_path: self.optional_path("disk", request.disk_path.as_deref())?,
            shared_folder: self.optional_path("shared folder", request.shared_folder.as_deref())?,
            snapshot: self.optional_name("snapshot", request.snapshot.as_deref())?,
            log_path: self.optional_path("log file", request.log_path.as_deref())?,
            jit_enabled: request.jit_enabled,
        })
    }

    fn required_path(&self, field: &'static str, path: &Path) -> Result<PathBuf, LaunchError> {
        self.optional_path(field, Some(path))?
            .ok_or(LaunchError::MissingInput { field })
    }

    fn optional_path(
        &self,
        field: &'static str,
        path: Option<&Path>,
    ) -> Result<Option<PathBuf>, LaunchError> {
        let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(None);
        };
        let bytes = self.bounded(field, path.as_os_str())?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(OsString::from_vec(bytes.to_vec()))))
    }

    fn optional_name(
        &self,
        field: &'static str,
        name: Option<&str>,
    ) -> Result<Option<String>, LaunchError> {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let bytes = self.bounded(field, OsStr::new(name))?;
        // Back off to a character boundary so the copy stays valid UTF-8.
        let mut end = bytes.len();
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            return Ok(None);
        }
        Ok(Some(name[..end].to_string()))
    }

    fn bounded<'a>(&self, field: &'static str, value: &'a OsStr) -> Result<&'a [u8], LaunchError> {
        let bytes = value.as_bytes();
        if bytes.contains(&0) {
            return Err(LaunchError::InteriorNul { field });
        }
        if bytes.len() <= self.max_bytes {
            return Ok(bytes);
        }
        match self.over_length {
            OverLengthPolicy::Reject => Err(LaunchError::InputTooLong {
                field,
                len: bytes.len(),
                max: self.max_bytes,
            }),
            OverLengthPolicy::Truncate => {
                warn!(
                    field,
                    len = bytes.len(),
                    max = self.max_bytes,
                    "truncating over-long launch input"
                );
                Ok(&bytes[..self.max_bytes])
            }
        }
    }
}
