//! Minimal vhost-net client: open the device, claim ownership, keep it
//! open. Drives the probes end to end without a hypervisor.

use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use log::info;
use vhostwatch_common::VHOST_SET_OWNER;

pub const DEFAULT_DEVICE: &str = "/dev/vhost-net";

pub struct VhostDevice {
    path: PathBuf,
    file: File,
}

impl VhostDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        info!("Opened {}", path.display());
        Ok(Self { path, file })
    }

    /// Issues `VHOST_SET_OWNER`, which makes the kernel start the worker.
    pub fn set_owner(&self) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), VHOST_SET_OWNER as _) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("VHOST_SET_OWNER on {} failed", self.path.display()));
        }
        info!("VHOST_SET_OWNER issued on {}", self.path.display());
        Ok(())
    }

    /// Keeps the device, and with it the worker, alive for `duration`.
    pub fn hold(&self, duration: Duration) {
        info!(
            "Holding {} open for {}s",
            self.path.display(),
            duration.as_secs()
        );
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let err = VhostDevice::open("/nonexistent/vhost-net").err().unwrap();
        assert!(format!("{:#}", err).contains("/nonexistent/vhost-net"));
    }

    #[test]
    fn test_set_owner_rejected_by_regular_file() {
        // /dev/null accepts the open but not the vhost ioctl.
        let device = VhostDevice::open("/dev/null").unwrap();
        assert!(device.set_owner().is_err());
    }
}
