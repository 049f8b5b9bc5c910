//! Scene used when no geometry files are given.

use bytemuck::{Pod, Zeroable};
use photon_render::{GeometryBlob, StaticScene};

/// One sphere as the trace kernel reads it (std430).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Sphere {
    pub center: [f32; 3],
    pub radius: f32,
    /// Linear RGB albedo; `w` unused.
    pub albedo: [f32; 4],
}

impl Sphere {
    pub const fn new(center: [f32; 3], radius: f32, albedo: [f32; 3]) -> Self {
        Self {
            center,
            radius,
            albedo: [albedo[0], albedo[1], albedo[2], 0.0],
        }
    }
}

/// A ground sphere with three smaller ones resting on it.
pub fn demo_spheres() -> Vec<Sphere> {
    vec![
        Sphere::new([0.0, -1000.0, 0.0], 1000.0, [0.5, 0.5, 0.5]),
        Sphere::new([0.0, 1.0, 0.0], 1.0, [0.8, 0.3, 0.3]),
        Sphere::new([-2.2, 0.7, 0.5], 0.7, [0.3, 0.8, 0.3]),
        Sphere::new([2.0, 0.5, -0.8], 0.5, [0.3, 0.3, 0.8]),
    ]
}

pub fn demo_scene() -> StaticScene {
    StaticScene::new().with_blob(GeometryBlob::from_pod("demo spheres", &demo_spheres()))
}

/// Scene from blob files in binding order, or the demo scene if none.
pub fn load_scene(paths: &[std::path::PathBuf]) -> anyhow::Result<StaticScene> {
    if paths.is_empty() {
        return Ok(demo_scene());
    }
    paths.iter().try_fold(StaticScene::new(), |scene, path| {
        let blob = GeometryBlob::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to read geometry {}: {e}", path.display()))?;
        Ok(scene.with_blob(blob))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_render::Scene;

    #[test]
    fn sphere_record_is_32_bytes() {
        assert_eq!(std::mem::size_of::<Sphere>(), 32);
    }

    #[test]
    fn demo_scene_is_one_blob() {
        let scene = load_scene(&[]).unwrap();
        assert_eq!(scene.geometry().len(), 1);
        assert_eq!(scene.total_bytes(), 32 * demo_spheres().len() as u64);
    }

    #[test]
    fn missing_geometry_file_names_the_path() {
        let err = load_scene(&["does-not-exist.bin".into()]).unwrap_err();
        assert!(err.to_string().contains("does-not-exist.bin"));
    }
}
