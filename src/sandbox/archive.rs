//! Tar payloads for moving files in and out of containers.

use std::io::{self, Read};
use std::path::Path;

use bytes::Bytes;

/// A tar archive holding one regular file named `name`.
pub fn single_file(name: &str, contents: &[u8], mode: u32) -> io::Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, name, contents)?;
    Ok(Bytes::from(builder.into_inner()?))
}

/// A tar archive of everything under `dir`, paths relative to it.
pub fn directory(dir: &Path) -> io::Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    Ok(Bytes::from(builder.into_inner()?))
}

/// Contents of the first regular file in a tar archive.
pub fn extract_single_file(tarball: &[u8]) -> io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(tarball);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "archive contains no regular file",
    ))
}

/// Split an absolute container path into its directory and file name.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => (".", path),
    }
}
