//! Resolves the `task_struct` offsets the thread-creation probe reads.
//!
//! The eBPF object is built without kernel headers, so the offsets of
//! `comm` and `pid` come from the running kernel's BTF and are patched into
//! the object's `TASK_LAYOUT` global before load.

use std::path::Path;

use anyhow::{Result, anyhow, bail};
use btf_rs::{Btf, Type};
use log::debug;
use vhostwatch_common::{TASK_COMM_LEN, TaskLayout, VHOST_THREAD_PREFIX};

pub const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

/// Finds `name` in a struct or union, descending into anonymous members.
/// Returns the member's bit offset from the start of `r#type` and its type.
fn find_member(btf: &Btf, r#type: &Type, name: &str, offset: u32) -> Option<(u32, Type)> {
    let r#struct = match r#type {
        Type::Struct(s) | Type::Union(s) => s,
        _ => return None,
    };

    for member in r#struct.members.iter() {
        let member_name = btf.resolve_name(member).ok()?;
        if member_name == name {
            let ty = btf.resolve_chained_type(member).ok()?;
            return Some((offset + member.bit_offset(), ty));
        }
        if member_name.is_empty() {
            let ty = btf.resolve_chained_type(member).ok()?;
            if matches!(ty, Type::Struct(_) | Type::Union(_))
                && let Some(found) = find_member(btf, &ty, name, offset + member.bit_offset())
            {
                return Some(found);
            }
        }
    }
    None
}

fn byte_offset(field: &str, bit_offset: u32) -> Result<u32> {
    if bit_offset % 8 != 0 {
        bail!("task_struct.{} is not byte aligned (bit {})", field, bit_offset);
    }
    let offset = bit_offset / 8;
    if offset == 0 {
        bail!("task_struct.{} at offset 0 is not supported", field);
    }
    Ok(offset)
}

/// `comm` must hold at least the prefix the probe compares and fit in the
/// fixed-size buffer it copies.
fn check_comm_len(len: usize) -> Result<()> {
    if len < VHOST_THREAD_PREFIX.len() || len > TASK_COMM_LEN {
        bail!(
            "task_struct.comm has {} bytes; expected {}..={}",
            len,
            VHOST_THREAD_PREFIX.len(),
            TASK_COMM_LEN
        );
    }
    Ok(())
}

pub fn resolve_from(path: &Path) -> Result<TaskLayout> {
    let btf = Btf::from_file(path).map_err(|e| anyhow!("Could not open {}: {e}", path.display()))?;

    let types = btf
        .resolve_types_by_name("task_struct")
        .map_err(|e| anyhow!("unable to resolve task_struct data type {e}"))?;
    let Some(task) = types.iter().find(|t| matches!(t, Type::Struct(_))) else {
        bail!("Could not resolve task_struct to a struct");
    };

    let (comm_bits, comm_type) =
        find_member(&btf, task, "comm", 0).ok_or_else(|| anyhow!("task_struct has no comm"))?;
    match comm_type {
        Type::Array(ref a) => check_comm_len(a.len())?,
        _ => bail!("task_struct.comm is not an array"),
    }

    let (pid_bits, _) =
        find_member(&btf, task, "pid", 0).ok_or_else(|| anyhow!("task_struct has no pid"))?;

    let layout = TaskLayout {
        comm_offset: byte_offset("comm", comm_bits)?,
        pid_offset: byte_offset("pid", pid_bits)?,
    };
    debug!(
        "task_struct layout: comm at {}, pid at {}",
        layout.comm_offset, layout.pid_offset
    );
    Ok(layout)
}

/// Resolves the layout from the running kernel.
pub fn resolve() -> Result<TaskLayout> {
    resolve_from(Path::new(VMLINUX_BTF))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_offset() {
        assert_eq!(byte_offset("pid", 2432 * 8).unwrap(), 2432);
        assert!(byte_offset("pid", 2432 * 8 + 3).is_err());
        assert!(byte_offset("pid", 0).is_err());
    }

    #[test]
    fn test_comm_len_bounds() {
        assert!(check_comm_len(TASK_COMM_LEN).is_ok());
        assert!(check_comm_len(VHOST_THREAD_PREFIX.len()).is_ok());
        assert!(check_comm_len(5).is_err());
        assert!(check_comm_len(32).is_err());
    }

    fn fixture(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("test_data").join(name)
    }

    #[test]
    fn test_resolve_through_anonymous_member() {
        // struct task_struct {
        //     int __state;
        //     struct { int pid; int tgid; };
        //     char comm[16];
        // };
        let layout = resolve_from(&fixture("task_struct.btf")).unwrap();
        assert_eq!(
            layout,
            TaskLayout {
                comm_offset: 32,
                pid_offset: 8,
            }
        );
        assert!(layout.is_resolved());
    }

    #[test]
    fn test_resolve_running_kernel() {
        if !Path::new(VMLINUX_BTF).exists() {
            return;
        }
        let layout = resolve().unwrap();
        assert!(layout.is_resolved());
        assert_ne!(layout.comm_offset, layout.pid_offset);
    }

    #[test]
    fn test_missing_btf_file() {
        let err = resolve_from(Path::new("/nonexistent/vmlinux")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/vmlinux"));
    }
}
