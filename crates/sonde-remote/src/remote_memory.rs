use crate::debuginfo::ObjectInformation;
use crate::maps::{self, MapEntry};
use crate::memory::{AddressSpace, ProcessLayout};
use crate::RemoteError;
use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Global of the instrumented allocator holding the heap descriptor address.
pub const HEAP_DESCRIPTOR_SYMBOL: &str = "__sonde_heap_descriptor";

/// Handle on the memory of a traced application, through `/proc/<pid>/mem`.
#[derive(Debug)]
pub struct RemoteProcessMemory {
    pid: libc::pid_t,
    mem: File,
    maps: Vec<MapEntry>,
    layout: ProcessLayout,
    heap_descriptor: Cell<Option<Option<u64>>>,
}

impl RemoteProcessMemory {
    /// Opens the memory file, reads the maps and loads debug information of every
    /// non-system object. The heap descriptor symbol must exist.
    pub fn open(pid: libc::pid_t) -> Result<Self, RemoteError> {
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))
            .map_err(|source| RemoteError::Io {
                context: "open /proc/<pid>/mem",
                source,
            })?;
        let maps = maps::read_maps(pid)?;

        let mut objects = Vec::new();
        for location in maps::locate_objects(&maps) {
            match ObjectInformation::load(&location) {
                Ok(info) => objects.push(Arc::new(info)),
                Err(e) if location.is_executable => return Err(e),
                Err(e) => {
                    warn!(path = %location.path, %e, "library without usable debug information");
                    objects.push(Arc::new(ObjectInformation {
                        path: location.path.clone(),
                        text: location.text,
                        rw: location.rw,
                        ..ObjectInformation::default()
                    }));
                }
            }
        }

        let mut layout = ProcessLayout::new(objects);
        layout.heap_pointer = Some(layout.resolve_global(HEAP_DESCRIPTOR_SYMBOL)?);
        debug!(pid, objects = layout.objects.len(), "application memory opened");

        Ok(Self {
            pid,
            mem,
            maps,
            layout,
            heap_descriptor: Cell::new(None),
        })
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn maps(&self) -> &[MapEntry] {
        &self.maps
    }
}

impl AddressSpace for RemoteProcessMemory {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), RemoteError> {
        let mut done = 0;
        while done < buf.len() {
            match self.mem.read_at(&mut buf[done..], address + done as u64) {
                Ok(0) => {
                    return Err(RemoteError::ShortRead {
                        address,
                        wanted: buf.len(),
                        got: done,
                    });
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(RemoteError::Io {
                        context: "pread /proc/<pid>/mem",
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<(), RemoteError> {
        let mut done = 0;
        while done < data.len() {
            match self.mem.write_at(&data[done..], address + done as u64) {
                Ok(0) => {
                    return Err(RemoteError::ShortWrite {
                        address,
                        wanted: data.len(),
                        got: done,
                    });
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(RemoteError::Io {
                        context: "pwrite /proc/<pid>/mem",
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    fn layout(&self) -> &ProcessLayout {
        &self.layout
    }

    fn layout_mut(&mut self) -> &mut ProcessLayout {
        &mut self.layout
    }

    fn clear_cache(&mut self) {
        self.heap_descriptor.set(None);
    }

    fn heap_descriptor(&self) -> Result<Option<u64>, RemoteError> {
        if let Some(cached) = self.heap_descriptor.get() {
            return Ok(cached);
        }
        let descriptor = match self.layout.heap_pointer {
            Some(pointer) => {
                let value = self.read_u64(pointer)?;
                (value != 0).then_some(value)
            }
            None => None,
        };
        self.heap_descriptor.set(Some(descriptor));
        Ok(descriptor)
    }
}
