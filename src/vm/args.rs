//! Monitor argument vector construction.
//!
//! The vector is assembled from named segments, each appended whole or not
//! at all, so an omitted option never leaves a dangling flag or a blank
//! value behind:
//!
//! ```text
//! program  -L <bios>  -display none  -m <mem>  <network>  <rng>
//!          -kernel <k>  -initrd <i>
//!          [disk]  [shared folder]  [log]  [monitor]
//!          -accel <jit|interpreter>
//!          [-loadvm <snapshot>]                      always last
//! ```

use std::ffi::{OsStr, OsString};
use std::path::Path;

use tracing::debug;

use crate::config::{LauncherConfig, NetworkConfig};
use crate::jit::JitEnablement;
use crate::vm::LaunchRequest;

// ---------------------------------------------------------------------------
// ArgumentVector
// ---------------------------------------------------------------------------

/// The monitor's `argv`, plus an (always empty) environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentVector {
    tokens: Vec<OsString>,
    environment: Vec<OsString>,
}

impl ArgumentVector {
    pub fn tokens(&self) -> &[OsString] {
        &self.tokens
    }

    pub fn environment(&self) -> &[OsString] {
        &self.environment
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Index of the first token equal to `token`.
    pub fn position(&self, token: &str) -> Option<usize> {
        self.tokens.iter().position(|t| t == token)
    }

    /// The tokens as (lossily decoded) strings, for logs and assertions.
    pub fn to_lossy_strings(&self) -> Vec<String> {
        self.tokens
            .iter()
            .map(|t| t.to_string_lossy().into_owned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// A self-contained run of tokens.
#[derive(Debug)]
struct Segment {
    name: &'static str,
    tokens: Vec<OsString>,
}

impl Segment {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            tokens: Vec::new(),
        }
    }

    fn token(mut self, token: impl Into<OsString>) -> Self {
        self.tokens.push(token.into());
        self
    }

    fn pair(self, flag: &str, value: impl Into<OsString>) -> Self {
        self.token(flag).token(value)
    }
}

#[derive(Debug, Default)]
struct ArgumentBuilder {
    tokens: Vec<OsString>,
    segments: Vec<&'static str>,
}

impl ArgumentBuilder {
    fn push(&mut self, segment: Segment) -> &mut Self {
        self.segments.push(segment.name);
        self.tokens.extend(segment.tokens);
        self
    }

    fn push_optional(&mut self, segment: Option<Segment>) -> &mut Self {
        if let Some(segment) = segment {
            self.push(segment);
        }
        self
    }

    fn finish(self) -> ArgumentVector {
        debug_assert!(
            self.tokens.iter().all(|t| !t.is_empty()),
            "argument vector contains an empty token"
        );
        debug!(segments = ?self.segments, argc = self.tokens.len(), "built monitor arguments");
        ArgumentVector {
            tokens: self.tokens,
            environment: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Value strings
// ---------------------------------------------------------------------------

/// `-drive` value for the persistent disk.
pub fn disk_drive_spec(path: &Path) -> OsString {
    let mut value = OsString::from("media=disk,id=drive1,if=none,file=");
    value.push(path.as_os_str());
    value.push(",discard=unmap,detect-zeroes=unmap");
    value
}

/// `-netdev` value for user-mode networking.
pub fn netdev_spec(network: &NetworkConfig) -> String {
    let mut value = format!(
        "user,id=net0,net={},dhcpstart={}",
        network.subnet, network.dhcp_start
    );
    for forward in &network.host_forwards {
        value.push_str(&format!(",hostfwd=tcp::{}-:{}", forward.host, forward.guest));
    }
    value
}

/// `-virtfs` value exporting `path` under `tag`.
pub fn virtfs_spec(path: &Path, tag: &str) -> OsString {
    let mut value = OsString::from("local,path=");
    value.push(path.as_os_str());
    value.push(format!(",mount_tag={tag},security_model=none,id={tag}"));
    value
}

/// `-accel` value: JIT only when requested and enablement did not fail.
pub fn accelerator<'a>(
    requested: bool,
    jit: Option<JitEnablement>,
    config: &'a LauncherConfig,
) -> &'a str {
    if requested && jit.is_some_and(JitEnablement::allows_jit) {
        &config.accelerator.jit
    } else {
        &config.accelerator.interpreter
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds the monitor arguments for `request`.
///
/// `jit` is the enablement outcome, or `None` when enablement was not
/// attempted.
pub fn build_arguments(
    request: &LaunchRequest,
    config: &LauncherConfig,
    jit: Option<JitEnablement>,
) -> ArgumentVector {
    let mut builder = ArgumentBuilder::default();

    builder
        .push(Segment::new("program").token(config.program_name.as_str()))
        .push(Segment::new("firmware").pair("-L", request.bios_dir.as_os_str()))
        .push(Segment::new("display").pair("-display", "none"))
        .push(Segment::new("memory").pair("-m", config.memory.as_str()))
        .push(
            Segment::new("network")
                .pair("-device", "virtio-net-pci,id=net1,netdev=net0")
                .pair("-netdev", netdev_spec(&config.network)),
        )
        .push(Segment::new("entropy").pair("-device", "virtio-rng-pci"))
        .push(Segment::new("kernel").pair("-kernel", request.kernel_path.as_os_str()))
        .push(Segment::new("initrd").pair("-initrd", request.initrd_path.as_os_str()));

    builder
        .push_optional(request.disk_path.as_deref().map(|disk| {
            Segment::new("disk")
                .pair("-device", "virtio-blk-pci,id=disk1,drive=drive1")
                .pair("-drive", disk_drive_spec(disk))
                .pair("-append", config.disk_boot_append.as_str())
        }))
        .push_optional(request.shared_folder.as_deref().map(|folder| {
            Segment::new("shared-folder")
                .pair("-virtfs", virtfs_spec(folder, &config.shared_folder_tag))
        }))
        .push_optional(
            request
                .log_path
                .as_deref()
                .map(|log| Segment::new("log").pair("-D", log.as_os_str())),
        )
        .push_optional(config.monitor_port.map(|port| {
            Segment::new("monitor").pair("-monitor", format!("tcp:127.0.0.1:{port},server,nowait"))
        }));

    builder.push(Segment::new("accelerator").pair(
        "-accel",
        accelerator(request.jit_enabled, jit, config),
    ));

    // Resume must stay last.
    builder.push_optional(
        request
            .snapshot
            .as_deref()
            .map(|name| Segment::new("resume").pair("-loadvm", OsStr::new(name))),
    );

    builder.finish()
}
