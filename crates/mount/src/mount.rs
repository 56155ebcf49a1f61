//! Helpers for interacting with mountpoints at early boot.
//!
//! The free functions here wrap the raw syscalls; [`MountSet`] tracks what
//! a caller acquired so it can be released again, in reverse order, on
//! every exit path.

use std::fmt::{self, Display};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::mount::{MountFlags, UnmountFlags};

/// What a mount is backed by; decides what teardown does with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// A kernel virtual filesystem (proc, sysfs, tmpfs).
    Pseudo,
    /// A filesystem on a block device.
    Storage,
}

/// Read-only or read-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Mounted `ro`
    ReadOnly,
    /// Mounted `rw`
    ReadWrite,
}

impl Access {
    fn flags(self) -> MountFlags {
        match self {
            Access::ReadOnly => MountFlags::RDONLY,
            Access::ReadWrite => MountFlags::empty(),
        }
    }
}

impl Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::ReadOnly => "ro",
            Access::ReadWrite => "rw",
        })
    }
}

/// A filesystem to mount, a subset of an `/etc/fstab` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Device or pseudo source name
    pub source: String,
    /// Where to mount it
    pub target: Utf8PathBuf,
    /// Filesystem type
    pub fstype: String,
    /// Pseudo or storage
    pub kind: MountKind,
}

impl MountSpec {
    /// A kernel virtual filesystem; the source is named after the type.
    pub fn pseudo(fstype: &str, target: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: fstype.to_owned(),
            target: target.into(),
            fstype: fstype.to_owned(),
            kind: MountKind::Pseudo,
        }
    }

    /// A block device filesystem.
    pub fn storage(
        source: impl Into<String>,
        target: impl Into<Utf8PathBuf>,
        fstype: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: fstype.into(),
            kind: MountKind::Storage,
        }
    }
}

impl Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} type {}", self.source, self.target, self.fstype)
    }
}

/// Result of a mount request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mounted {
    /// We mounted it.
    Fresh,
    /// Something else already had it mounted; we did nothing.
    AlreadyPresent,
}

/// The mount operations needed at early boot.
///
/// Methods take `&self` so that a [`MountSet`] can hold the mounter for its
/// whole scope while the caller keeps using it.
pub trait Mounter {
    /// Mount a filesystem, unless it is already there.
    fn mount(&self, spec: &MountSpec) -> Result<Mounted>;
    /// Change the access mode of an existing mount.
    fn remount(&self, target: &Utf8Path, access: Access) -> Result<()>;
    /// Unmount; a target that is not mounted is not an error.
    fn unmount(&self, target: &Utf8Path) -> Result<()>;
    /// Flush all filesystem buffers to durable storage.
    fn sync(&self);
}

/// The real thing, backed by syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, spec: &MountSpec) -> Result<Mounted> {
        mount(spec)
    }

    fn remount(&self, target: &Utf8Path, access: Access) -> Result<()> {
        remount(target, access)
    }

    fn unmount(&self, target: &Utf8Path) -> Result<()> {
        unmount(target)
    }

    fn sync(&self) {
        sync()
    }
}

/// Filesystem magic for types we can recognize as already mounted.
fn fstype_magic(fstype: &str) -> Option<i64> {
    let magic = match fstype {
        "proc" => libc::PROC_SUPER_MAGIC,
        "sysfs" => libc::SYSFS_MAGIC,
        "tmpfs" => libc::TMPFS_MAGIC,
        "vfat" | "msdos" => libc::MSDOS_SUPER_MAGIC,
        _ => return None,
    };
    Some(magic as i64)
}

/// Whether `target` currently has a filesystem of type `fstype` on it.
/// Types we don't have a magic for are reported as not mounted.
fn is_mounted_as(target: &Utf8Path, fstype: &str) -> Result<bool> {
    let Some(magic) = fstype_magic(fstype) else {
        return Ok(false);
    };
    let st = rustix::fs::statfs(target.as_std_path()).with_context(|| format!("statfs {target}"))?;
    Ok(st.f_type as i64 == magic)
}

/// Mount a filesystem with default flags.
#[context("Mounting {spec}")]
pub fn mount(spec: &MountSpec) -> Result<Mounted> {
    if is_mounted_as(&spec.target, &spec.fstype)? {
        tracing::debug!("Already have {} on {}", spec.fstype, spec.target);
        return Ok(Mounted::AlreadyPresent);
    }
    rustix::mount::mount(
        spec.source.as_str(),
        spec.target.as_std_path(),
        spec.fstype.as_str(),
        MountFlags::empty(),
        None,
    )?;
    Ok(Mounted::Fresh)
}

/// Remount an existing mountpoint with the given access mode.
#[context("Remounting {target} {access}")]
pub fn remount(target: &Utf8Path, access: Access) -> Result<()> {
    rustix::mount::mount_remount(target.as_std_path(), access.flags(), "")?;
    Ok(())
}

/// Unmount a filesystem; succeeds if nothing is mounted there.
#[context("Unmounting {target}")]
pub fn unmount(target: &Utf8Path) -> Result<()> {
    match rustix::mount::unmount(target.as_std_path(), UnmountFlags::empty()) {
        Ok(()) => Ok(()),
        Err(rustix::io::Errno::INVAL) => {
            tracing::debug!("{target} is not mounted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Flush all filesystem buffers.
pub fn sync() {
    rustix::fs::sync()
}

#[derive(Debug)]
enum Held {
    Mounted(MountSpec),
    Remounted(Utf8PathBuf),
}

/// The set of mount changes made by the current process.
///
/// Everything acquired through this set is released in reverse order by
/// [`MountSet::teardown`], or on drop. Storage mounts are unmounted and
/// read-write remounts are flipped back to read-only. Pseudo filesystems
/// are left in place: they hold nothing durable, and `/proc` is still
/// needed to reboot.
pub struct MountSet<'m, M: Mounter + ?Sized> {
    mounter: &'m M,
    held: Vec<Held>,
}

impl<M: Mounter + ?Sized> fmt::Debug for MountSet<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountSet").field("held", &self.held).finish()
    }
}

impl<'m, M: Mounter + ?Sized> MountSet<'m, M> {
    /// An empty set.
    pub fn new(mounter: &'m M) -> Self {
        Self {
            mounter,
            held: Vec::new(),
        }
    }

    /// Mount `spec`, recording it for teardown if we were the ones to mount it.
    pub fn mount(&mut self, spec: &MountSpec) -> Result<Mounted> {
        let r = self.mounter.mount(spec)?;
        match r {
            Mounted::Fresh => {
                tracing::debug!("Mounted {spec}");
                self.held.push(Held::Mounted(spec.clone()));
            }
            Mounted::AlreadyPresent => tracing::debug!("Not taking ownership of {}", spec.target),
        }
        Ok(r)
    }

    /// Remount `target` read-write; it goes back to read-only on teardown.
    pub fn remount_rw(&mut self, target: &Utf8Path) -> Result<()> {
        self.mounter.remount(target, Access::ReadWrite)?;
        self.held.push(Held::Remounted(target.to_owned()));
        Ok(())
    }

    /// Flush, then remount `target` read-only now rather than at teardown.
    pub fn remount_ro(&mut self, target: &Utf8Path) -> Result<()> {
        self.mounter.sync();
        self.mounter.remount(target, Access::ReadOnly)
    }

    /// Flush all filesystem buffers.
    pub fn sync(&self) {
        self.mounter.sync()
    }

    /// Release everything, most recent first. Every release is attempted;
    /// the first error is returned. Calling this again is a no-op.
    pub fn teardown(&mut self) -> Result<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        self.mounter.sync();
        let mut first_err = None;
        while let Some(held) = self.held.pop() {
            let r = match &held {
                Held::Mounted(spec) if spec.kind == MountKind::Pseudo => {
                    tracing::trace!("Leaving {spec}");
                    Ok(())
                }
                Held::Mounted(spec) => self.mounter.unmount(&spec.target),
                Held::Remounted(target) => self.mounter.remount(target, Access::ReadOnly),
            };
            if let Err(e) = r {
                tracing::error!("{e:#}");
                first_err.get_or_insert(e);
            }
        }
        self.mounter.sync();
        first_err.map_or(Ok(()), Err)
    }
}

impl<M: Mounter + ?Sized> Drop for MountSet<'_, M> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::error!("Tearing down mounts: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
        present: HashSet<&'static str>,
        fail_unmount: HashSet<&'static str>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.borrow_mut())
        }
    }

    impl Mounter for Recorder {
        fn mount(&self, spec: &MountSpec) -> Result<Mounted> {
            self.events.borrow_mut().push(format!("mount {}", spec.target));
            if self.present.contains(spec.target.as_str()) {
                Ok(Mounted::AlreadyPresent)
            } else {
                Ok(Mounted::Fresh)
            }
        }

        fn remount(&self, target: &Utf8Path, access: Access) -> Result<()> {
            self.events
                .borrow_mut()
                .push(format!("remount {target} {access}"));
            Ok(())
        }

        fn unmount(&self, target: &Utf8Path) -> Result<()> {
            self.events.borrow_mut().push(format!("umount {target}"));
            if self.fail_unmount.contains(target.as_str()) {
                anyhow::bail!("{target} is busy");
            }
            Ok(())
        }

        fn sync(&self) {
            self.events.borrow_mut().push("sync".into());
        }
    }

    #[test]
    fn test_spec_display() {
        let spec = MountSpec::storage("/dev/mmcblk0p1", "/boot", "vfat");
        assert_eq!(spec.to_string(), "/dev/mmcblk0p1 on /boot type vfat");
        let spec = MountSpec::pseudo("proc", "/proc");
        assert_eq!(spec.source, "proc");
        assert_eq!(spec.kind, MountKind::Pseudo);
    }

    #[test]
    fn test_fstype_magic() {
        assert_eq!(fstype_magic("tmpfs"), Some(libc::TMPFS_MAGIC as i64));
        assert!(fstype_magic("ext4").is_none());
    }

    #[test]
    fn test_teardown_lifo() {
        let m = Recorder::default();
        let mut set = MountSet::new(&m);
        set.mount(&MountSpec::pseudo("proc", "/proc")).unwrap();
        set.remount_rw(Utf8Path::new("/")).unwrap();
        set.mount(&MountSpec::storage("/dev/mmcblk0p1", "/boot", "vfat"))
            .unwrap();
        m.take();
        set.teardown().unwrap();
        similar_asserts::assert_eq!(
            m.take(),
            ["sync", "umount /boot", "remount / ro", "sync"]
        );
        // Idempotent
        set.teardown().unwrap();
        assert!(m.take().is_empty());
    }

    #[test]
    fn test_already_present_not_owned() {
        let m = Recorder {
            present: ["/boot"].into_iter().collect(),
            ..Default::default()
        };
        let mut set = MountSet::new(&m);
        let r = set
            .mount(&MountSpec::storage("/dev/mmcblk0p1", "/boot", "vfat"))
            .unwrap();
        assert_eq!(r, Mounted::AlreadyPresent);
        m.take();
        set.teardown().unwrap();
        assert!(m.take().is_empty());
    }

    #[test]
    fn test_teardown_continues_on_error() {
        let m = Recorder {
            fail_unmount: ["/boot"].into_iter().collect(),
            ..Default::default()
        };
        let mut set = MountSet::new(&m);
        set.remount_rw(Utf8Path::new("/")).unwrap();
        set.mount(&MountSpec::storage("/dev/mmcblk0p1", "/boot", "vfat"))
            .unwrap();
        m.take();
        let err = set.teardown().unwrap_err();
        assert!(err.to_string().contains("/boot is busy"));
        similar_asserts::assert_eq!(
            m.take(),
            ["sync", "umount /boot", "remount / ro", "sync"]
        );
    }

    #[test]
    fn test_remount_ro_syncs_first() {
        let m = Recorder::default();
        let mut set = MountSet::new(&m);
        set.remount_ro(Utf8Path::new("/boot")).unwrap();
        similar_asserts::assert_eq!(m.take(), ["sync", "remount /boot ro"]);
    }

    #[test]
    fn test_drop_tears_down() {
        let m = Recorder::default();
        {
            let mut set = MountSet::new(&m);
            set.remount_rw(Utf8Path::new("/")).unwrap();
        }
        similar_asserts::assert_eq!(
            m.take(),
            ["remount / rw", "sync", "remount / ro", "sync"]
        );
    }
}
