//! Disk space accounting for the recordings filesystem

use std::path::Path;

use nix::sys::statvfs::statvfs;
use tracing::debug;

use crate::error::{AppError, Result};

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Capacity of the filesystem backing a path
#[derive(Debug, Clone, Copy)]
pub struct DiskSpace {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskSpace {
    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / GB
    }

    pub fn available_gb(&self) -> f64 {
        self.available_bytes as f64 / GB
    }
}

/// Query free space for the filesystem that holds `path`.
///
/// The recordings directory may not exist yet on first boot, so the query
/// walks up to the nearest existing ancestor.
pub fn disk_space(path: &Path) -> Result<DiskSpace> {
    let mut candidate = Some(path);
    while let Some(current) = candidate {
        match statvfs(current) {
            Ok(stat) => {
                let fragment = stat.fragment_size() as u64;
                return Ok(DiskSpace {
                    total_bytes: stat.blocks() as u64 * fragment,
                    available_bytes: stat.blocks_available() as u64 * fragment,
                });
            }
            Err(e) => {
                debug!("statvfs {} failed: {}, trying parent", current.display(), e);
                candidate = current.parent();
            }
        }
    }

    Err(AppError::Internal(format!(
        "no filesystem found for {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_disk_space_on_root() {
        let space = disk_space(Path::new("/")).unwrap();
        assert!(space.total_bytes > 0);
        assert!(space.total_bytes >= space.available_bytes);
    }

    #[test]
    fn test_disk_space_walks_to_existing_ancestor() {
        let space = disk_space(&PathBuf::from("/definitely/not/a/real/path")).unwrap();
        assert!(space.total_bytes > 0);
    }

    #[test]
    fn test_gb_conversion() {
        let space = DiskSpace {
            total_bytes: 64 * 1024 * 1024 * 1024,
            available_bytes: 8 * 1024 * 1024 * 1024,
        };
        assert_eq!(space.total_gb(), 64.0);
        assert_eq!(space.available_gb(), 8.0);
    }
}
