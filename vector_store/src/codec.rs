use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use crate::{Key, Result, StoreErr};

const VECTOR_EXT: &str = "vec";
const TMP_EXT: &str = "tmp";

/// Marks a directory as owned by a live store, never copied into snapshots.
pub(crate) const OWNER_FILE: &str = ".owner";
pub(crate) const LAYOUT_FILE: &str = "layout.json";

/// Returns the file holding `key`'s vector inside `dir`.
pub(crate) fn key_path(dir: &Path, key: Key) -> PathBuf {
    dir.join(format!("{key}.{VECTOR_EXT}"))
}

/// Lists every key with a persisted vector inside `dir`.
pub(crate) fn scan_keys(dir: &Path) -> Result<Vec<Key>> {
    let mut keys = Vec::new();

    for entry in fs::read_dir(dir).map_err(StoreErr::io(dir))? {
        let path = entry.map_err(StoreErr::io(dir))?.path();
        if !path.extension().is_some_and(|ext| ext == VECTOR_EXT) {
            continue;
        }

        let key = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse().ok());

        if let Some(key) = key {
            keys.push(key);
        }
    }

    Ok(keys)
}

/// Writes `data` to `path` through a temporary file and a rename, so concurrent
/// readers observe either the previous or the new contents.
pub(crate) fn write_vector(path: &Path, data: &[f32]) -> Result<()> {
    let tmp = path.with_extension(TMP_EXT);
    fs::write(&tmp, bytemuck::cast_slice::<f32, u8>(data)).map_err(StoreErr::io(&tmp))?;
    fs::rename(&tmp, path).map_err(StoreErr::io(path))
}

/// Reads a vector of exactly `len` values from `path`.
pub(crate) fn read_vector(path: &Path, len: usize) -> Result<Box<[f32]>> {
    let bytes = fs::read(path).map_err(StoreErr::io(path))?;
    let expected = len * size_of::<f32>();

    if bytes.len() != expected {
        return Err(StoreErr::ShapeMismatch {
            what: "stored vector bytes",
            got: bytes.len(),
            expected,
        });
    }

    // The byte buffer is not f32 aligned.
    let mut data = vec![0f32; len].into_boxed_slice();
    bytemuck::cast_slice_mut::<f32, u8>(&mut data).copy_from_slice(&bytes);
    Ok(data)
}

/// Forces `path` to durable storage.
pub(crate) fn sync_file(path: &Path) -> Result<()> {
    File::open(path)
        .and_then(|file| file.sync_all())
        .map_err(StoreErr::io(path))
}

/// Forces the directory entries of `dir` to durable storage.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    sync_file(dir)?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Recursively copies `src` into a new directory `dst`, `dst` must not exist.
pub(crate) fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir(dst).map_err(StoreErr::io(dst))?;

    for entry in fs::read_dir(src).map_err(StoreErr::io(src))? {
        let entry = entry.map_err(StoreErr::io(src))?;
        let from = entry.path();
        let name = entry.file_name();

        if name == OWNER_FILE || from.extension().is_some_and(|ext| ext == TMP_EXT) {
            continue;
        }

        let to = dst.join(&name);
        if entry.file_type().map_err(StoreErr::io(&from))?.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(StoreErr::io(&from))?;
        }
    }

    Ok(())
}
