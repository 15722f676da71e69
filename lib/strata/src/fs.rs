//! Filesystem capability behind the store. The engine owns its backing
//! device exclusively and only ever talks through this narrow interface;
//! real storage and in-memory test doubles are injected at construction.

use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::Rc;

use hashbrown::HashMap;

/// Names are slash-separated paths relative to the volume root, one
/// directory per file type (`data/DATA_665F1C00.dat`).
pub trait Volume {
    fn append(&mut self, name: &str, data: &[u8]) -> io::Result<()>;

    /// Durability point: everything appended to `name` so far survives
    /// power loss once this returns.
    fn sync(&mut self, name: &str) -> io::Result<()>;

    fn read(&self, name: &str) -> io::Result<Vec<u8>>;

    fn len(&self, name: &str) -> io::Result<u64>;

    fn truncate(&mut self, name: &str, len: u64) -> io::Result<()>;

    /// Names under `dir`, sorted lexicographically.
    fn list(&self, dir: &str) -> io::Result<Vec<String>>;

    fn delete(&mut self, name: &str) -> io::Result<()>;

    fn exists(&self, name: &str) -> bool;
}

/// Volume on a real filesystem rooted at a data directory.
pub struct DiskVolume {
    root: PathBuf,
}

impl DiskVolume {
    pub fn new<P: Into<PathBuf>>(root: P) -> DiskVolume {
        DiskVolume { root: root.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Volume for DiskVolume {
    fn append(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        let path = self.path(name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(data)
    }

    fn sync(&mut self, name: &str) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(self.path(name))?;
        file.sync_all()
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(name))
    }

    fn len(&self, name: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.path(name))?.len())
    }

    fn truncate(&mut self, name: &str, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(self.path(name))?;
        file.set_len(len)?;
        file.sync_all()
    }

    fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let path = self.root.join(dir);

        if !path.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();

        for entry in fs::read_dir(path)? {
            let entry = entry?;

            if entry.file_type()?.is_file() {
                names.push(format!("{}/{}", dir, entry.file_name().to_string_lossy()));
            }
        }

        names.sort();
        Ok(names)
    }

    fn delete(&mut self, name: &str) -> io::Result<()> {
        fs::remove_file(self.path(name))
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }
}

/// In-memory volume. Serves diskless RAM buffering during outages and the
/// crash-recovery tests, which simulate power loss by truncating files at
/// arbitrary offsets. Clones share the same backing map.
#[derive(Clone)]
pub struct MemVolume {
    files: Rc<RefCell<HashMap<String, Vec<u8>>>>,
}

impl MemVolume {
    pub fn new() -> MemVolume {
        MemVolume {
            files: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

impl Volume for MemVolume {
    fn append(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        self.files
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(Vec::new)
            .extend_from_slice(data);
        Ok(())
    }

    fn sync(&mut self, _name: &str) -> io::Result<()> {
        Ok(())
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        self.files
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }

    fn len(&self, name: &str) -> io::Result<u64> {
        self.files
            .borrow()
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }

    fn truncate(&mut self, name: &str, len: u64) -> io::Result<()> {
        match self.files.borrow_mut().get_mut(name) {
            Some(data) => {
                data.truncate(len as usize);
                Ok(())
            }
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let prefix = format!("{}/", dir);

        let mut names: Vec<String> = self
            .files
            .borrow()
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();

        names.sort();
        Ok(names)
    }

    fn delete(&mut self, name: &str) -> io::Result<()> {
        match self.files.borrow_mut().remove(name) {
            Some(_) => Ok(()),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.files.borrow().contains_key(name)
    }
}
