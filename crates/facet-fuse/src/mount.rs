//! Mounting and session lifecycle.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fuser::{BackgroundSession, MountOption};
use tracing::{debug, info, warn};

use crate::config::MountConfig;
use crate::filesystem::OverlayFs;

/// How long to wait for the kernel to report the mount active.
const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to a mounted overlay. Dropping it unmounts.
pub struct MountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts and waits for the session to finish. May block while
    /// files under the mount are still open.
    pub fn unmount(mut self) {
        if let Some(session) = self.session.take() {
            info!(mountpoint = %self.mountpoint.display(), "unmounting");
            session.join();
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(mountpoint = %self.mountpoint.display(), "unmounting on drop");
            session.join();
        }
    }
}

fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("facetfs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Mounts the filesystem in a background session and waits for the
/// kernel to report it active.
pub fn spawn_mount(fs: OverlayFs, config: &MountConfig) -> io::Result<MountHandle> {
    config.validate()?;
    let options = mount_options(config);
    let session = fuser::spawn_mount2(fs, &config.mountpoint, &options)?;
    let handle = MountHandle {
        session: Some(session),
        mountpoint: config.mountpoint.clone(),
    };
    wait_for_mount(&config.mountpoint)?;
    info!(mountpoint = %config.mountpoint.display(), "mounted");
    Ok(handle)
}

/// Polls until the mountpoint's device id differs from its parent's,
/// which is the reliable signal that the mount is active. Mount-table
/// parsing can block on ghost mounts; stat cannot.
fn wait_for_mount(mountpoint: &Path) -> io::Result<()> {
    let parent = mountpoint.parent().unwrap_or(Path::new("/"));
    let deadline = Instant::now() + MOUNT_TIMEOUT;

    while Instant::now() < deadline {
        if let (Ok(m), Ok(p)) = (mountpoint.metadata(), parent.metadata()) {
            if m.dev() != p.dev() {
                return Ok(());
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    warn!(mountpoint = %mountpoint.display(), "mount did not become ready");
    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        format!(
            "mount at {} did not become ready within {MOUNT_TIMEOUT:?}",
            mountpoint.display()
        ),
    ))
}
