//! Reading reference photos and probe frames from disk.

use anyhow::{bail, Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

/// Read a directory of per-person directories into `(label, image)` pairs.
///
/// Each subdirectory name is the identity label and every file inside it
/// is a reference photo. Hidden entries are ignored.
pub fn scan_reference_dir(root: &Path) -> Result<Vec<(String, RgbImage)>> {
    let mut people = sorted_entries(root)?;
    people.retain(|p| !is_hidden(p));

    if people.is_empty() {
        bail!("{} contains no person directories", root.display());
    }

    let mut batch = Vec::new();
    for person in people {
        if !person.is_dir() {
            bail!(
                "{} should contain only directories, found file {}",
                root.display(),
                person.display()
            );
        }
        let label = person
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("unnamed directory {}", person.display()))?;

        for photo in sorted_entries(&person)? {
            if is_hidden(&photo) || !photo.is_file() {
                continue;
            }
            let image = load_rgb(&photo)
                .with_context(|| format!("could not read an image in the {label} directory"))?;
            batch.push((label.clone(), image));
        }
    }

    tracing::info!(root = %root.display(), images = batch.len(), "reference photos scanned");
    Ok(batch)
}

/// Image files directly inside `dir`, sorted by name.
pub fn frame_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = sorted_entries(dir)?;
    files.retain(|p| p.is_file() && !is_hidden(p));
    Ok(files)
}

pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    let image = image::open(path).with_context(|| format!("decoding {}", path.display()))?;
    Ok(image.to_rgb8())
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("listing directory {}", dir.display()))?;
    entries.sort();
    Ok(entries)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}
