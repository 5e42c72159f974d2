//! Guest-fd to host-fd table (spec.md sec. 4.7: "File descriptors are
//! mapped through a table... Standard fds (0/1/2) are pre-populated.
//! Allocation uses the lowest free slot >= 3.").

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// One entry in the guest-fd table: either a view onto one of the
/// process's standard streams, or an owned host file.
#[derive(Debug)]
enum FdEntry {
    Stdin,
    Stdout,
    Stderr,
    File(File),
}

/// Maps small guest-visible integers to host I/O objects.
#[derive(Debug)]
pub struct FdTable {
    entries: Vec<Option<FdEntry>>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![Some(FdEntry::Stdin), Some(FdEntry::Stdout), Some(FdEntry::Stderr)],
        }
    }

    fn slot(&mut self, fd: u32) -> Option<&mut FdEntry> {
        self.entries.get_mut(fd as usize).and_then(Option::as_mut)
    }

    /// Opens `path` with POSIX-ish `flags` (only the read/write/create bits
    /// this crate's syscall surface needs), returning the new guest fd.
    pub fn open(&mut self, path: &str, flags: u32) -> io::Result<u32> {
        const O_WRONLY: u32 = 1;
        const O_RDWR: u32 = 2;
        const O_CREAT: u32 = 0x0200;
        const O_TRUNC: u32 = 0x0400;
        const O_APPEND: u32 = 0x0008;

        let mut options = OpenOptions::new();
        let writable = flags & (O_WRONLY | O_RDWR) != 0;
        options.read(flags & O_WRONLY == 0);
        options.write(writable);
        options.create(flags & O_CREAT != 0);
        options.truncate(flags & O_TRUNC != 0);
        options.append(flags & O_APPEND != 0);
        let file = options.open(path)?;

        let slot = self
            .entries
            .iter()
            .position(|e| e.is_none())
            .filter(|&i| i >= 3)
            .unwrap_or_else(|| {
                self.entries.push(None);
                self.entries.len() - 1
            });
        while self.entries.len() <= slot {
            self.entries.push(None);
        }
        self.entries[slot] = Some(FdEntry::File(file));
        Ok(slot as u32)
    }

    pub fn close(&mut self, fd: u32) -> io::Result<()> {
        match self.entries.get_mut(fd as usize) {
            Some(slot @ Some(_)) if fd as usize >= 3 => {
                *slot = None;
                Ok(())
            }
            Some(Some(_)) => Ok(()), // closing a standard stream is a no-op
            _ => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    pub fn read(&mut self, fd: u32, buf: &mut [u8]) -> io::Result<usize> {
        match self.slot(fd).ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))? {
            FdEntry::Stdin => io::stdin().read(buf),
            FdEntry::Stdout | FdEntry::Stderr => Ok(0),
            FdEntry::File(file) => file.read(buf),
        }
    }

    pub fn write(&mut self, fd: u32, buf: &[u8]) -> io::Result<usize> {
        match self.slot(fd).ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))? {
            FdEntry::Stdout => io::stdout().write(buf),
            FdEntry::Stderr => io::stderr().write(buf),
            FdEntry::Stdin => Ok(0),
            FdEntry::File(file) => file.write(buf),
        }
    }

    pub fn seek(&mut self, fd: u32, offset: i64, whence: u32) -> io::Result<u64> {
        let pos = match whence {
            1 => SeekFrom::Current(offset),
            2 => SeekFrom::End(offset),
            _ => SeekFrom::Start(offset as u64),
        };
        match self.slot(fd).ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))? {
            FdEntry::File(file) => file.seek(pos),
            _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_streams_are_prepopulated() {
        let table = FdTable::new();
        assert!(table.entries[0].is_some());
        assert!(table.entries[1].is_some());
        assert!(table.entries[2].is_some());
    }

    #[test]
    fn open_allocates_the_lowest_free_slot_at_or_above_three() {
        let mut table = FdTable::new();
        let dir = std::env::temp_dir().join("haiku32_vm_fd_test");
        std::fs::write(&dir, b"hello").unwrap();
        let fd = table.open(dir.to_str().unwrap(), 0).unwrap();
        assert_eq!(fd, 3);
        table.close(fd).unwrap();
        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn closing_a_standard_stream_is_a_harmless_no_op() {
        let mut table = FdTable::new();
        assert!(table.close(1).is_ok());
    }
}
