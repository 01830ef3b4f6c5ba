use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::trace;

/// Extension of files that are still being written.
pub const PART_EXT: &str = "samfetch_part";

/// Add an extension to a file path.
pub fn add_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Path where `path` lives until it is complete.
pub fn part_path(path: &Path) -> PathBuf {
    add_extension(path, PART_EXT)
}

/// Delete a file, but don't error out if the path doesn't exist.
pub fn delete_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Output file that is written under its part path and only moved to its
/// final path by [`Self::commit`]. Dropping it without committing leaves the
/// part file behind.
#[derive(Debug)]
pub struct PartFile {
    file: BufWriter<File>,
    part_path: PathBuf,
    path: PathBuf,
}

impl PartFile {
    /// Create (or truncate) the part file for `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let part_path = part_path(path);
        trace!("Creating part file: {part_path:?}");

        Ok(Self {
            file: BufWriter::new(File::create(&part_path)?),
            part_path,
            path: path.to_owned(),
        })
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    /// Flush and close the file, then move it into place.
    pub fn commit(self) -> io::Result<PathBuf> {
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        drop(file);

        fs::rename(&self.part_path, &self.path)?;
        trace!("Committed {:?}", self.path);

        Ok(self.path)
    }
}

impl Write for PartFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
