//! Gallery of known faces, built from a directory of labelled images.

use crate::types::{Detection, Frame, GalleryEntry};
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Produces (location, embedding) pairs for every face in a frame.
pub trait FaceExtractor {
    type Error: std::error::Error + Send + Sync + 'static;

    fn extract(&mut self, frame: &Frame) -> Result<Vec<Detection>, Self::Error>;
}

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read gallery directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("face extraction failed for {path}: {source}")]
    Extract {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("no usable faces in gallery {0}; add one clear photo per person")]
    Empty(PathBuf),
}

/// How an image filename maps to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingConvention {
    /// `Alice.jpg` → `Alice`.
    Stem,
    /// `Alice_2.jpg` → `Alice` (stems without the separator are used whole).
    Prefix(char),
}

impl Default for NamingConvention {
    fn default() -> Self {
        NamingConvention::Prefix('_')
    }
}

impl NamingConvention {
    /// Identity for an image path, or `None` if the name is empty.
    pub fn identity_for(&self, path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        let name = match self {
            NamingConvention::Stem => stem,
            NamingConvention::Prefix(sep) => stem.split(*sep).next().unwrap_or(stem),
        };
        let name = name.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}

/// Image that was left out of the gallery, and why.
#[derive(Debug, Clone)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: String,
}

/// Immutable set of reference embeddings, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    skipped: Vec<SkippedImage>,
}

impl Gallery {
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        Self {
            entries,
            skipped: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn skipped(&self) -> &[SkippedImage] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct identities in first-seen order.
    pub fn identities(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !seen.contains(&entry.identity.as_str()) {
                seen.push(&entry.identity);
            }
        }
        seen
    }
}

fn is_gallery_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decode an image file into a grayscale frame.
pub fn decode_image(path: &Path) -> Result<Frame, image::ImageError> {
    let gray = image::open(path)?.to_luma8();
    let (width, height) = gray.dimensions();
    Ok(Frame {
        data: gray.into_raw(),
        width,
        height,
        sequence: 0,
    })
}

/// Build the gallery from every image in `dir`.
///
/// Files are visited in filename order. Images that cannot be decoded or
/// contain no face are skipped with a warning; only the first face of an
/// image is used. An empty result is an error.
pub fn load_gallery<E: FaceExtractor>(
    dir: &Path,
    naming: NamingConvention,
    extractor: &mut E,
) -> Result<Gallery, GalleryError> {
    let read_dir = std::fs::read_dir(dir).map_err(|source| GalleryError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = read_dir
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_gallery_image(p))
        .collect();
    paths.sort();

    let mut gallery = Gallery::default();

    for path in paths {
        let Some(identity) = naming.identity_for(&path) else {
            tracing::warn!(path = %path.display(), "cannot derive identity from filename; skipping");
            gallery.skipped.push(SkippedImage {
                path,
                reason: "no identity in filename".into(),
            });
            continue;
        };

        let frame = match decode_image(&path) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot decode image; skipping");
                gallery.skipped.push(SkippedImage {
                    path,
                    reason: format!("decode failed: {e}"),
                });
                continue;
            }
        };

        let detections = extractor
            .extract(&frame)
            .map_err(|e| GalleryError::Extract {
                path: path.clone(),
                source: Box::new(e),
            })?;

        let Some(first) = detections.into_iter().next() else {
            tracing::warn!(path = %path.display(), "no face found; skipping");
            gallery.skipped.push(SkippedImage {
                path,
                reason: "no face found".into(),
            });
            continue;
        };

        tracing::debug!(path = %path.display(), identity = %identity, "gallery face loaded");
        gallery.entries.push(GalleryEntry {
            identity,
            embedding: first.embedding,
        });
    }

    if gallery.is_empty() {
        return Err(GalleryError::Empty(dir.to_path_buf()));
    }

    tracing::info!(
        entries = gallery.len(),
        identities = gallery.identities().len(),
        skipped = gallery.skipped.len(),
        "gallery loaded"
    );
    Ok(gallery)
}
