//! `/proc/<pid>/maps` parsing and discovery of the objects worth inspecting.

use crate::RemoteError;
use sonde_types::AddressRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub range: AddressRange,
    pub perms: Permissions,
    pub offset: u64,
    pub inode: u64,
    /// Empty for anonymous mappings.
    pub pathname: String,
}

impl MapEntry {
    pub fn parse(line: &str) -> Result<Self, RemoteError> {
        let bad = |reason| RemoteError::Maps {
            line: line.to_string(),
            reason,
        };
        let mut fields = line.split_ascii_whitespace();
        let range = fields.next().ok_or_else(|| bad("missing address range"))?;
        let perms = fields.next().ok_or_else(|| bad("missing permissions"))?;
        let offset = fields.next().ok_or_else(|| bad("missing offset"))?;
        let _dev = fields.next().ok_or_else(|| bad("missing device"))?;
        let inode = fields.next().ok_or_else(|| bad("missing inode"))?;
        let pathname = fields.collect::<Vec<_>>().join(" ");

        let (start, end) = range.split_once('-').ok_or_else(|| bad("malformed range"))?;
        let start = u64::from_str_radix(start, 16).map_err(|_| bad("malformed start"))?;
        let end = u64::from_str_radix(end, 16).map_err(|_| bad("malformed end"))?;
        let range = AddressRange::new(start, end).map_err(|_| bad("inverted range"))?;

        let p = perms.as_bytes();
        if p.len() != 4 {
            return Err(bad("malformed permissions"));
        }
        let perms = Permissions {
            read: p[0] == b'r',
            write: p[1] == b'w',
            exec: p[2] == b'x',
            shared: p[3] == b's',
        };

        Ok(Self {
            range,
            perms,
            offset: u64::from_str_radix(offset, 16).map_err(|_| bad("malformed offset"))?,
            inode: inode.parse().map_err(|_| bad("malformed inode"))?,
            pathname,
        })
    }

    pub fn is_pseudo(&self) -> bool {
        self.pathname.starts_with('[')
    }
}

pub fn parse_maps(text: &str) -> Result<Vec<MapEntry>, RemoteError> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(MapEntry::parse)
        .collect()
}

pub fn read_maps(pid: libc::pid_t) -> Result<Vec<MapEntry>, RemoteError> {
    let text = std::fs::read_to_string(format!("/proc/{pid}/maps")).map_err(|source| {
        RemoteError::Io {
            context: "read /proc/<pid>/maps",
            source,
        }
    })?;
    parse_maps(&text)
}

/// System libraries whose memory is never part of the explored state.
const FILTERED_LIBRARIES: &[&str] = &[
    "ld",
    "ld-linux",
    "ld-linux-x86",
    "ld-linux-aarch64",
    "libasan",
    "libbz2",
    "libc",
    "libc++",
    "libcrypt",
    "libcrypto",
    "libcxxrt",
    "libdl",
    "libdw",
    "libelf",
    "libevent",
    "libffi",
    "libgcc_s",
    "libgfortran",
    "libgmp",
    "liblzma",
    "libm",
    "libpcre2",
    "libpthread",
    "libquadmath",
    "libresolv",
    "librt",
    "libselinux",
    "libssl",
    "libstdc++",
    "libtsan",
    "libubsan",
    "libunwind",
    "libz",
    "libzstd",
];

/// `/usr/lib/libfoo-1.2.so.3` gives `libfoo`; non-library paths give an empty name.
pub fn library_name(pathname: &str) -> String {
    let base = pathname.rsplit('/').next().unwrap_or(pathname);
    let Some(pos) = base.rfind(".so") else {
        return String::new();
    };
    let mut name = base[..pos].to_string();
    while let Some(dash) = name.rfind('-') {
        let suffix = &name[dash + 1..];
        if !suffix.chars().all(|c| c == '.' || c.is_ascii_digit()) {
            break;
        }
        name.truncate(dash);
    }
    name
}

pub fn is_filtered_library(pathname: &str) -> bool {
    let name = library_name(pathname);
    FILTERED_LIBRARIES.contains(&name.as_str())
}

/// Where one loaded object lives in the address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub path: String,
    pub is_executable: bool,
    /// Start of the mapping at file offset 0.
    pub base: u64,
    pub text: Option<AddressRange>,
    /// Writable segment, extended over an adjacent anonymous `.bss` mapping.
    pub rw: Option<AddressRange>,
}

/// The main executable (first mapping) and every non-system library.
pub fn locate_objects(maps: &[MapEntry]) -> Vec<ObjectLocation> {
    let mut objects: Vec<ObjectLocation> = Vec::new();
    for (index, entry) in maps.iter().enumerate() {
        if entry.pathname.is_empty() || entry.is_pseudo() {
            continue;
        }
        let position = objects.iter().position(|o| o.path == entry.pathname);
        let object = match position {
            Some(i) => &mut objects[i],
            None => {
                let is_executable = index == 0;
                if !is_executable && is_filtered_library(&entry.pathname) {
                    continue;
                }
                objects.push(ObjectLocation {
                    path: entry.pathname.clone(),
                    is_executable,
                    base: entry.range.start - entry.offset,
                    text: None,
                    rw: None,
                });
                let last = objects.len() - 1;
                &mut objects[last]
            }
        };

        if entry.perms.exec && entry.perms.read && object.text.is_none() {
            object.text = Some(entry.range);
        }
        if entry.perms.write && entry.perms.read && !entry.perms.shared {
            let mut rw = match object.rw {
                Some(existing) if existing.end == entry.range.start => AddressRange {
                    start: existing.start,
                    end: entry.range.end,
                },
                _ => entry.range,
            };
            if let Some(next) = maps.get(index + 1)
                && next.pathname.is_empty()
                && next.perms.write
                && next.range.start == rw.end
            {
                rw.end = next.range.end;
            }
            object.rw = Some(rw);
        }
    }
    objects
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
555555554000-555555555000 r--p 00000000 08:01 131 /opt/app/bin/pingpong
555555555000-555555556000 r-xp 00001000 08:01 131 /opt/app/bin/pingpong
555555557000-555555558000 rw-p 00002000 08:01 131 /opt/app/bin/pingpong
555555558000-55555555a000 rw-p 00000000 00:00 0
55555555a000-55555557b000 rw-p 00000000 00:00 0 [heap]
7ffff7d80000-7ffff7da8000 r--p 00000000 08:01 77 /usr/lib/x86_64-linux-gnu/libc.so.6
7ffff7da8000-7ffff7f3d000 r-xp 00028000 08:01 77 /usr/lib/x86_64-linux-gnu/libc.so.6
7ffff7f90000-7ffff7f92000 rw-p 00214000 08:01 77 /usr/lib/x86_64-linux-gnu/libc.so.6
7ffff7fa0000-7ffff7fa1000 r--p 00000000 08:01 90 /opt/app/lib/libsimkernel-3.36.so
7ffff7fa1000-7ffff7fa2000 r-xp 00001000 08:01 90 /opt/app/lib/libsimkernel-3.36.so
7ffff7fa3000-7ffff7fa4000 rw-p 00003000 08:01 90 /opt/app/lib/libsimkernel-3.36.so
7ffffffde000-7ffffffff000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn parses_every_field() {
        let maps = parse_maps(SAMPLE).expect("sample parses");
        assert_eq!(maps.len(), 12);
        let text = &maps[1];
        assert_eq!(text.range.start, 0x555555555000);
        assert!(text.perms.exec && text.perms.read && !text.perms.write);
        assert_eq!(text.offset, 0x1000);
        assert_eq!(text.inode, 131);
        assert_eq!(maps[3].pathname, "");
        assert!(maps[4].is_pseudo());
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(MapEntry::parse("not a maps line").is_err());
        assert!(MapEntry::parse("2000-1000 rw-p 0 00:00 0").is_err());
    }

    #[test]
    fn library_names_drop_extension_and_version() {
        assert_eq!(library_name("/usr/lib/libc.so.6"), "libc");
        assert_eq!(library_name("/lib/libc-2.31.so"), "libc");
        assert_eq!(library_name("/usr/lib/libstdc++.so.6.0.30"), "libstdc++");
        assert_eq!(library_name("/lib64/ld-linux-x86-64.so.2"), "ld-linux-x86");
        assert_eq!(library_name("/opt/app/lib/libsimkernel-3.36.so"), "libsimkernel");
        assert_eq!(library_name("/opt/app/bin/pingpong"), "");
    }

    #[test]
    fn locate_objects_skips_system_libraries_and_extends_bss() {
        let maps = parse_maps(SAMPLE).expect("sample parses");
        let objects = locate_objects(&maps);
        assert_eq!(objects.len(), 2);

        let exe = &objects[0];
        assert!(exe.is_executable);
        assert_eq!(exe.base, 0x555555554000);
        assert_eq!(
            exe.rw,
            Some(AddressRange {
                start: 0x555555557000,
                end: 0x55555555a000
            })
        );
        assert_eq!(exe.text.map(|t| t.start), Some(0x555555555000));

        let lib = &objects[1];
        assert!(lib.path.ends_with("libsimkernel-3.36.so"));
        assert_eq!(lib.base, 0x7ffff7fa0000);
    }
}
