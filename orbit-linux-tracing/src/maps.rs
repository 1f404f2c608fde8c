//! The target process's memory map, seeded from `/proc/<pid>/maps` and kept
//! current from mmap records during the capture. The unwinder consults it to
//! decide whether an address is executable and to recognize the `[uprobes]`
//! trampoline mapping.

use std::io;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
    pub executable: bool,
    pub path: String,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryMaps {
    // Sorted by start address, non-overlapping.
    mappings: Vec<MemoryMapping>,
}

pub const UPROBES_MAP_NAME: &str = "[uprobes]";

impl MemoryMaps {
    pub fn read_from_proc(pid: i32) -> io::Result<Self> {
        let content = std::fs::read_to_string(format!("/proc/{pid}/maps"))?;
        Ok(Self::parse(&content))
    }

    /// Parses the `/proc/<pid>/maps` text format:
    /// `start-end perms offset dev inode path`.
    pub fn parse(content: &str) -> Self {
        let mut maps = MemoryMaps::default();
        for line in content.lines() {
            let mut parts = line.split_ascii_whitespace();
            let (Some(range), Some(perms), Some(offset)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Some((start, end)) = range.split_once('-') else {
                continue;
            };
            let (Ok(start), Ok(end), Ok(file_offset)) = (
                u64::from_str_radix(start, 16),
                u64::from_str_radix(end, 16),
                u64::from_str_radix(offset, 16),
            ) else {
                continue;
            };
            let _dev = parts.next();
            let _inode = parts.next();
            let path = parts.next().unwrap_or("").to_string();
            maps.insert(MemoryMapping {
                start,
                end,
                file_offset,
                executable: perms.as_bytes().get(2) == Some(&b'x'),
                path,
            });
        }
        maps
    }

    /// Adds or replaces a mapping. Overlapping older mappings are clipped
    /// out, matching the kernel's mmap semantics.
    pub fn insert(&mut self, mapping: MemoryMapping) {
        self.mappings.retain(|m| m.end <= mapping.start || m.start >= mapping.end);
        let position = self
            .mappings
            .partition_point(|m| m.start < mapping.start);
        self.mappings.insert(position, mapping);
    }

    pub fn find(&self, address: u64) -> Option<&MemoryMapping> {
        let position = self.mappings.partition_point(|m| m.end <= address);
        self.mappings
            .get(position)
            .filter(|m| m.start <= address && address < m.end)
    }

    pub fn is_executable(&self, address: u64) -> bool {
        self.find(address).is_some_and(|m| m.executable)
    }

    pub fn is_in_uprobes(&self, address: u64) -> bool {
        self.find(address)
            .is_some_and(|m| m.path == UPROBES_MAP_NAME)
    }

    pub fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d000000000-55d000010000 r-xp 00000000 fd:00 123 /usr/bin/app
55d000010000-55d000020000 rw-p 00010000 fd:00 123 /usr/bin/app
7ffff0000000-7ffff0001000 r-xp 00000000 00:00 0 [uprobes]
7ffff7ff0000-7ffff8000000 rw-p 00000000 00:00 0
";

    #[test]
    fn parses_proc_maps_lines() {
        let maps = MemoryMaps::parse(MAPS);
        assert_eq!(maps.mappings().len(), 4);
        assert!(maps.is_executable(0x55d000000000));
        assert!(!maps.is_executable(0x55d000010000));
        assert!(maps.is_in_uprobes(0x7ffff0000800));
        assert_eq!(maps.find(0x7ffff7ff8000).unwrap().path, "");
        assert!(maps.find(0x1000).is_none());
    }

    #[test]
    fn insert_clips_overlapping_mappings() {
        let mut maps = MemoryMaps::parse(MAPS);
        maps.insert(MemoryMapping {
            start: 0x55d000000000,
            end: 0x55d000020000,
            file_offset: 0,
            executable: true,
            path: "/usr/bin/app2".to_string(),
        });
        assert_eq!(maps.find(0x55d000015000).unwrap().path, "/usr/bin/app2");
        assert!(maps.is_executable(0x55d000015000));
    }
}
