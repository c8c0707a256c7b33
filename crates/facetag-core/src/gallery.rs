//! Enrolled reference gallery and its on-disk form.

use crate::metric::MetricError;
use crate::types::{Embedding, GalleryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error(transparent)]
    Metric(#[from] MetricError),
    #[error("gallery file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("gallery file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not serialize gallery for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("gallery file {path} was built for {stored}-d embeddings, expected {expected}")]
    IncompatibleDimension {
        path: PathBuf,
        stored: usize,
        expected: usize,
    },
}

/// Insertion-ordered collection of (name, embedding) entries.
///
/// The embedding length is fixed by the first entry; every later entry
/// must match it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a gallery from entries, validating that all share one dimension.
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        let mut gallery = Self::new();
        gallery.bulk_load(entries)?;
        Ok(gallery)
    }

    pub fn insert(&mut self, entry: GalleryEntry) -> Result<(), GalleryError> {
        if let Some(expected) = self.dimension() {
            check_dimension(expected, &entry.embedding)?;
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Replace the contents with `entries`. On error the gallery is unchanged.
    pub fn bulk_load(&mut self, entries: Vec<GalleryEntry>) -> Result<(), GalleryError> {
        if let Some(first) = entries.first() {
            let expected = first.embedding.len();
            for entry in &entries[1..] {
                check_dimension(expected, &entry.embedding)?;
            }
        }
        self.entries = entries;
        Ok(())
    }

    /// Group embeddings by name, in order of each name's first occurrence.
    pub fn grouped_by_name(&self) -> Vec<(&str, Vec<&Embedding>)> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<(&str, Vec<&Embedding>)> = Vec::new();

        for entry in &self.entries {
            match index.get(entry.name.as_str()) {
                Some(&i) => groups[i].1.push(&entry.embedding),
                None => {
                    index.insert(&entry.name, groups.len());
                    groups.push((&entry.name, vec![&entry.embedding]));
                }
            }
        }

        groups
    }

    /// Distinct names with the number of reference embeddings for each.
    pub fn names(&self) -> Vec<(String, usize)> {
        self.grouped_by_name()
            .into_iter()
            .map(|(name, group)| (name.to_string(), group.len()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Embedding length shared by every entry, or `None` when empty.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.len())
    }

    pub fn iter(&self) -> impl Iterator<Item = &GalleryEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }
}

fn check_dimension(expected: usize, embedding: &Embedding) -> Result<(), MetricError> {
    if embedding.len() != expected {
        return Err(MetricError::DimensionMismatch {
            expected,
            actual: embedding.len(),
        });
    }
    Ok(())
}

/// Serialized gallery file layout.
#[derive(Debug, Serialize, Deserialize)]
struct GalleryFile {
    model: Option<String>,
    dimension: Option<usize>,
    created_at: DateTime<Utc>,
    entries: Vec<GalleryEntry>,
}

/// A gallery loaded from disk together with its provenance.
#[derive(Debug, Clone)]
pub struct StoredGallery {
    pub gallery: Gallery,
    /// Model preset that produced the embeddings.
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// JSON file holding the persisted gallery.
///
/// The file's presence is the only "already enrolled" signal.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    path: PathBuf,
}

impl GalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the stored gallery, or `None` if nothing has been enrolled yet.
    pub fn load(&self) -> Result<Option<StoredGallery>, GalleryError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(GalleryError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let file: GalleryFile =
            serde_json::from_slice(&bytes).map_err(|source| GalleryError::Malformed {
                path: self.path.clone(),
                source,
            })?;

        let gallery = Gallery::from_entries(file.entries)?;
        if let (Some(expected), Some(actual)) = (file.dimension, gallery.dimension()) {
            if expected != actual {
                return Err(MetricError::DimensionMismatch { expected, actual }.into());
            }
        }

        tracing::debug!(
            path = %self.path.display(),
            entries = gallery.len(),
            model = ?file.model,
            "gallery loaded"
        );

        Ok(Some(StoredGallery {
            gallery,
            model: file.model,
            created_at: file.created_at,
        }))
    }

    /// Load the stored gallery and require its embeddings to be `expected`-d.
    pub fn load_for_dimension(&self, expected: usize) -> Result<Option<StoredGallery>, GalleryError> {
        let stored = self.load()?;
        if let Some(dim) = stored.as_ref().and_then(|s| s.gallery.dimension()) {
            if dim != expected {
                return Err(GalleryError::IncompatibleDimension {
                    path: self.path.clone(),
                    stored: dim,
                    expected,
                });
            }
        }
        Ok(stored)
    }

    /// Replace the stored gallery. Writes to a sibling temp file and renames
    /// it over the target so readers never see a partial file.
    pub fn save(&self, gallery: &Gallery, model: Option<&str>) -> Result<(), GalleryError> {
        let io_err = |source| GalleryError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file = GalleryFile {
            model: model.map(str::to_string),
            dimension: gallery.dimension(),
            created_at: Utc::now(),
            entries: gallery.entries().to_vec(),
        };
        let json = serde_json::to_vec(&file).map_err(|source| GalleryError::Serialize {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        tracing::info!(
            path = %self.path.display(),
            entries = gallery.len(),
            "gallery saved"
        );
        Ok(())
    }
}
