#![cfg_attr(not(test), no_std)]

/// Size of `task_struct.comm`, including the trailing NUL.
pub const TASK_COMM_LEN: usize = 16;

/// Name prefix the vhost subsystem gives its worker threads.
pub const VHOST_THREAD_PREFIX: &[u8; 6] = b"vhost-";

/// Emitted on every entry into `vhost_net_ioctl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoctlEvent {
    pub cpu: u32,
    pub ioctl_command: u32,
}

/// Emitted when `__kthread_create_on_node` returns a `vhost-` task.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadCreateEvent {
    pub cpu: u32,
    pub pid: u32,
}

/// Byte offsets of the `task_struct` fields read by the thread-creation
/// probe. Resolved from kernel BTF in userspace and patched into the eBPF
/// object before load.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskLayout {
    pub comm_offset: u32,
    pub pid_offset: u32,
}

impl TaskLayout {
    pub const UNRESOLVED: TaskLayout = TaskLayout {
        comm_offset: 0,
        pid_offset: 0,
    };

    pub const fn is_resolved(&self) -> bool {
        self.comm_offset != 0 && self.pid_offset != 0
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for IoctlEvent {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ThreadCreateEvent {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TaskLayout {}

/// Fixed six byte comparison of a task name against `vhost-`.
///
/// `comm` is always `TASK_COMM_LEN` bytes and NUL padded by the kernel, so
/// reading the first six bytes never leaves the buffer and short names fail
/// on their first padding byte.
#[inline(always)]
pub fn is_vhost_thread(comm: &[u8; TASK_COMM_LEN]) -> bool {
    let mut i = 0;
    while i < VHOST_THREAD_PREFIX.len() {
        if comm[i] != VHOST_THREAD_PREFIX[i] {
            return false;
        }
        i += 1;
    }
    true
}

// Generic Linux ioctl request encoding (asm-generic/ioctl.h).
const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u32, nr: u32, size: u32) -> u32 {
    (dir << IOC_DIRSHIFT) | (ty << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT) | (size << IOC_SIZESHIFT)
}

/// Request type byte shared by all vhost ioctls.
pub const VHOST_VIRTIO: u32 = 0xAF;

/// `sizeof(struct vhost_memory)` without its flexible region array.
const VHOST_MEMORY_HEADER_LEN: u32 = 8;

pub const VHOST_GET_FEATURES: u32 = ioc(IOC_READ, VHOST_VIRTIO, 0x00, 8);
pub const VHOST_SET_FEATURES: u32 = ioc(IOC_WRITE, VHOST_VIRTIO, 0x00, 8);
pub const VHOST_SET_OWNER: u32 = ioc(IOC_NONE, VHOST_VIRTIO, 0x01, 0);
pub const VHOST_RESET_OWNER: u32 = ioc(IOC_NONE, VHOST_VIRTIO, 0x02, 0);
pub const VHOST_SET_MEM_TABLE: u32 = ioc(IOC_WRITE, VHOST_VIRTIO, 0x03, VHOST_MEMORY_HEADER_LEN);
pub const VHOST_SET_LOG_BASE: u32 = ioc(IOC_WRITE, VHOST_VIRTIO, 0x04, 8);

/// Type byte of an ioctl request code.
pub const fn ioctl_type(command: u32) -> u32 {
    (command >> IOC_TYPESHIFT) & ((1 << IOC_TYPEBITS) - 1)
}

/// Sequence number of an ioctl request code.
pub const fn ioctl_nr(command: u32) -> u32 {
    (command >> IOC_NRSHIFT) & ((1 << IOC_NRBITS) - 1)
}

/// The vhost requests that drive device setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VhostIoctl {
    GetFeatures,
    SetFeatures,
    SetOwner,
    ResetOwner,
    SetMemTable,
    SetLogBase,
}

impl VhostIoctl {
    pub const fn from_command(command: u32) -> Option<Self> {
        match command {
            VHOST_GET_FEATURES => Some(VhostIoctl::GetFeatures),
            VHOST_SET_FEATURES => Some(VhostIoctl::SetFeatures),
            VHOST_SET_OWNER => Some(VhostIoctl::SetOwner),
            VHOST_RESET_OWNER => Some(VhostIoctl::ResetOwner),
            VHOST_SET_MEM_TABLE => Some(VhostIoctl::SetMemTable),
            VHOST_SET_LOG_BASE => Some(VhostIoctl::SetLogBase),
            _ => None,
        }
    }

    pub const fn command(self) -> u32 {
        match self {
            VhostIoctl::GetFeatures => VHOST_GET_FEATURES,
            VhostIoctl::SetFeatures => VHOST_SET_FEATURES,
            VhostIoctl::SetOwner => VHOST_SET_OWNER,
            VhostIoctl::ResetOwner => VHOST_RESET_OWNER,
            VhostIoctl::SetMemTable => VHOST_SET_MEM_TABLE,
            VhostIoctl::SetLogBase => VHOST_SET_LOG_BASE,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            VhostIoctl::GetFeatures => "VHOST_GET_FEATURES",
            VhostIoctl::SetFeatures => "VHOST_SET_FEATURES",
            VhostIoctl::SetOwner => "VHOST_SET_OWNER",
            VhostIoctl::ResetOwner => "VHOST_RESET_OWNER",
            VhostIoctl::SetMemTable => "VHOST_SET_MEM_TABLE",
            VhostIoctl::SetLogBase => "VHOST_SET_LOG_BASE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comm(name: &str) -> [u8; TASK_COMM_LEN] {
        let mut buf = [0u8; TASK_COMM_LEN];
        let len = name.len().min(TASK_COMM_LEN - 1);
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        buf
    }

    #[test]
    fn test_vhost_names_match() {
        assert!(is_vhost_thread(&comm("vhost-0")));
        assert!(is_vhost_thread(&comm("vhost-worker")));
        assert!(is_vhost_thread(&comm("vhost-net-1")));
        assert!(is_vhost_thread(&comm("vhost-")));
    }

    #[test]
    fn test_other_names_rejected() {
        assert!(!is_vhost_thread(&comm("vhostx-1")));
        assert!(!is_vhost_thread(&comm("vhos-test")));
        assert!(!is_vhost_thread(&comm("")));
        assert!(!is_vhost_thread(&comm("kworker/0:1")));
        assert!(!is_vhost_thread(&comm("Vhost-1")));
    }

    #[test]
    fn test_short_name_fails_on_padding() {
        // "vhost" is a strict prefix of the literal; byte 5 is NUL padding.
        assert!(!is_vhost_thread(&comm("vhost")));
        assert!(!is_vhost_thread(&comm("vho")));
    }

    #[test]
    fn test_truncated_long_name_still_matches() {
        assert!(is_vhost_thread(&comm("vhost-1234567890123456")));
    }

    #[test]
    fn test_vhost_ioctl_codes() {
        assert_eq!(VHOST_SET_OWNER, 0xAF01);
        assert_eq!(VHOST_RESET_OWNER, 0xAF02);
        assert_eq!(VHOST_GET_FEATURES, 0x8008_AF00);
        assert_eq!(VHOST_SET_FEATURES, 0x4008_AF00);
        assert_eq!(VHOST_SET_MEM_TABLE, 0x4008_AF03);
        assert_eq!(VHOST_SET_LOG_BASE, 0x4008_AF04);
    }

    #[test]
    fn test_set_owner_fields() {
        assert_eq!(ioctl_type(VHOST_SET_OWNER), VHOST_VIRTIO);
        assert_eq!(ioctl_nr(VHOST_SET_OWNER), 1);
        assert_eq!(ioctl_type(VHOST_SET_MEM_TABLE), VHOST_VIRTIO);
        assert_eq!(ioctl_nr(VHOST_SET_MEM_TABLE), 3);
    }

    #[test]
    fn test_from_command() {
        assert_eq!(
            VhostIoctl::from_command(0xAF01),
            Some(VhostIoctl::SetOwner)
        );
        assert_eq!(VhostIoctl::from_command(0x5401), None);
        for ioctl in [
            VhostIoctl::GetFeatures,
            VhostIoctl::SetFeatures,
            VhostIoctl::SetOwner,
            VhostIoctl::ResetOwner,
            VhostIoctl::SetMemTable,
            VhostIoctl::SetLogBase,
        ] {
            assert_eq!(VhostIoctl::from_command(ioctl.command()), Some(ioctl));
        }
    }

    #[test]
    fn test_event_layout() {
        assert_eq!(core::mem::size_of::<IoctlEvent>(), 8);
        assert_eq!(core::mem::size_of::<ThreadCreateEvent>(), 8);
        assert_eq!(core::mem::offset_of!(IoctlEvent, ioctl_command), 4);
        assert_eq!(core::mem::offset_of!(ThreadCreateEvent, pid), 4);
    }

    #[test]
    fn test_unresolved_layout() {
        assert!(!TaskLayout::UNRESOLVED.is_resolved());
        let layout = TaskLayout {
            comm_offset: 3016,
            pid_offset: 2464,
        };
        assert!(layout.is_resolved());
    }
}
