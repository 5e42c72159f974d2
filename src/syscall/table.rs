//! The syscall number -> handler mapping (spec.md sec. 4.7's reference
//! table). Numbers not listed here are stubbed to success, as the table
//! explicitly permits.

use crate::address_space::AddressSpace;
use crate::config::DEFAULT_STRING_CAP;
use crate::context::GuestContext;
use crate::error::VmResult;

const SYS_EXIT: u32 = 1;
const SYS_READ: u32 = 3;
const SYS_WRITE: u32 = 4;
const SYS_OPEN: u32 = 5;
const SYS_CLOSE: u32 = 6;
const SYS_SEEK: u32 = 8;
const SYS_GETPID: u32 = 20;
const SYS_KILL: u32 = 37;
const SYS_WAITPID: u32 = 61;
const SYS_EXECVE: u32 = 62;
const SYS_FORK: u32 = 57;

/// Executes one syscall, returning the value to write into EAX (negative
/// on error, per Haiku's negated-`status_t` convention).
pub fn invoke(
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
    number: u32,
    args: [u32; 6],
) -> VmResult<i32> {
    match number {
        SYS_EXIT => {
            ctx.should_exit = true;
            Ok(args[0] as i32)
        }
        SYS_READ => {
            let (fd, buf_vaddr, len) = (args[0], args[1], args[2] as usize);
            let mut buf = vec![0u8; len];
            match ctx.fd_table.read(fd, &mut buf) {
                Ok(n) => {
                    space.write(buf_vaddr, &buf, n)?;
                    Ok(n as i32)
                }
                Err(_) => Ok(-1),
            }
        }
        SYS_WRITE => {
            let (fd, buf_vaddr, len) = (args[0], args[1], args[2] as usize);
            let mut buf = vec![0u8; len];
            space.read(buf_vaddr, &mut buf, len)?;
            if fd == 1 || fd == 2 {
                log::debug!("guest fd {fd} wrote {len} bytes");
            }
            match ctx.fd_table.write(fd, &buf) {
                Ok(n) => Ok(n as i32),
                Err(_) => Ok(-1),
            }
        }
        SYS_OPEN => {
            let (path_vaddr, flags) = (args[0], args[1]);
            let mut path_buf = vec![0u8; DEFAULT_STRING_CAP];
            let len = space.read_string(path_vaddr, &mut path_buf, DEFAULT_STRING_CAP)?;
            let path = String::from_utf8_lossy(&path_buf[..len]).into_owned();
            match ctx.fd_table.open(&path, flags) {
                Ok(fd) => Ok(fd as i32),
                Err(_) => Ok(-1),
            }
        }
        SYS_CLOSE => match ctx.fd_table.close(args[0]) {
            Ok(()) => Ok(0),
            Err(_) => Ok(-1),
        },
        SYS_SEEK => {
            let (fd, offset, whence) = (args[0], args[1] as i64, args[2]);
            match ctx.fd_table.seek(fd, offset, whence) {
                Ok(pos) => Ok(pos as i32),
                Err(_) => Ok(-1),
            }
        }
        SYS_GETPID => Ok(std::process::id() as i32),
        SYS_KILL => {
            log::warn!(
                "kill(pid={}, sig={}) is stubbed to success: single-guest-context VM has no \
                 second guest process to signal",
                args[0],
                args[1]
            );
            Ok(0)
        }
        SYS_FORK | SYS_EXECVE | SYS_WAITPID => {
            log::warn!(
                "syscall {number} (fork/execve/waitpid family) is stubbed to success: the VM's \
                 single-threaded, single-guest-context model has no second guest process to run \
                 it against"
            );
            Ok(0)
        }
        _ => {
            log::debug!("unhandled syscall {number}, stubbing to success");
            Ok(0)
        }
    }
}
