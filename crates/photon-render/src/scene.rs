//! Scene geometry handed to the trace kernel.
//!
//! Geometry generation lives outside the renderer. A scene is a list of
//! opaque byte blobs whose layout only the kernel interprets; each one is
//! uploaded into its own device-local buffer and bound as a storage buffer.

use std::path::Path;

/// One storage-buffer payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeometryBlob {
    /// Name used in log lines and buffer debug names.
    pub label: String,
    pub bytes: Vec<u8>,
}

impl GeometryBlob {
    pub fn new(label: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            bytes,
        }
    }

    /// Build a blob from plain-old-data records.
    pub fn from_pod<T: bytemuck::Pod>(label: impl Into<String>, records: &[T]) -> Self {
        Self::new(label, bytemuck::cast_slice(records).to_vec())
    }

    /// Load a blob from a file, labelled with the file name.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let label = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Ok(Self::new(label, bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Source of geometry for [`prerender`](crate::Renderer::prerender).
pub trait Scene {
    /// Geometry blobs in binding order, starting at the first geometry binding.
    fn geometry(&self) -> &[GeometryBlob];
}

/// A fixed set of geometry blobs.
#[derive(Clone, Debug, Default)]
pub struct StaticScene {
    blobs: Vec<GeometryBlob>,
}

impl StaticScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob; it gets the next geometry binding.
    pub fn with_blob(mut self, blob: GeometryBlob) -> Self {
        self.blobs.push(blob);
        self
    }

    /// Total bytes across all blobs.
    pub fn total_bytes(&self) -> u64 {
        self.blobs.iter().map(|b| b.len() as u64).sum()
    }
}

impl Scene for StaticScene {
    fn geometry(&self) -> &[GeometryBlob] {
        &self.blobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_blob_is_little_endian_bytes() {
        let blob = GeometryBlob::from_pod("spheres", &[1.0f32, 2.0]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob.bytes[..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn static_scene_keeps_binding_order() {
        let scene = StaticScene::new()
            .with_blob(GeometryBlob::new("a", vec![0; 16]))
            .with_blob(GeometryBlob::new("b", vec![0; 32]));
        let labels: Vec<_> = scene.geometry().iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, ["a", "b"]);
        assert_eq!(scene.total_bytes(), 48);
    }

    #[test]
    fn load_labels_with_file_name() {
        let path = std::env::temp_dir().join(format!("photon-scene-{}.bin", std::process::id()));
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let blob = GeometryBlob::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(blob.bytes, vec![1, 2, 3]);
        assert!(blob.label.starts_with("photon-scene-"));
    }
}
