// `Storage` over std::fs. On the device this runs against the mounted
// SPIFFS/LittleFS VFS; on a host it is just a directory.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::transport::{FileSink, Storage};

#[derive(Debug, Default, Clone, Copy)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }

    /// Create the storage root if it does not exist yet
    pub fn ensure_root(&self, root: &Path) -> io::Result<()> {
        fs::create_dir_all(root)
    }
}

struct FsFile {
    writer: BufWriter<File>,
}

impl Write for FsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl FileSink for FsFile {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

impl Storage for FsStorage {
    fn list_files(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn delete(&mut self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn create<'a>(&'a mut self, path: &Path) -> io::Result<Box<dyn FileSink + 'a>> {
        let file = File::create(path)?;
        Ok(Box::new(FsFile {
            writer: BufWriter::new(file),
        }))
    }

    fn open_read<'a>(&'a self, path: &Path) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn file_len(&self, path: &Path) -> io::Result<Option<u64>> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
