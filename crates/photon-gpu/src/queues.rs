//! Queue family selection.
//!
//! Kept free of live Vulkan calls so the choice can be tested against
//! synthetic family tables.

use crate::error::{GpuError, Result};
use ash::vk;

/// Queue families the renderer submits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Family running the trace kernel.
    pub compute: u32,
    /// Family for staging copies. Falls back to `compute`.
    pub transfer: u32,
    /// Family that can present to the target surface, when there is one.
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Distinct family indices, in ascending order.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.compute, self.transfer];
        families.extend(self.present);
        families.sort_unstable();
        families.dedup();
        families
    }

    /// Whether presentation runs on a different family than compute, so
    /// buffers must be handed across with ownership barriers.
    pub fn needs_ownership_transfer(&self) -> bool {
        self.present.is_some_and(|present| present != self.compute)
    }
}

/// Pick compute, transfer, and (optionally) present families.
///
/// Compute prefers a family without graphics so tracing can overlap the
/// present engine. Present prefers a graphics-capable family with surface
/// support; if none exists any supporting family is taken.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
    want_present: bool,
) -> Result<QueueFamilyIndices> {
    let usable = |f: &vk::QueueFamilyProperties| f.queue_count > 0;
    let has = |f: &vk::QueueFamilyProperties, flags| usable(f) && f.queue_flags.contains(flags);

    let indexed = || families.iter().enumerate().map(|(i, f)| (i as u32, f));

    let dedicated_compute = indexed()
        .find(|&(_, f)| {
            has(f, vk::QueueFlags::COMPUTE) && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|(i, _)| i);
    let any_compute = indexed()
        .find(|&(_, f)| has(f, vk::QueueFlags::COMPUTE))
        .map(|(i, _)| i);
    let compute = dedicated_compute
        .or(any_compute)
        .ok_or_else(|| GpuError::DeviceInit("no compute-capable queue family".to_string()))?;

    let transfer = indexed()
        .find(|&(_, f)| {
            has(f, vk::QueueFlags::TRANSFER)
                && !f
                    .queue_flags
                    .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map_or(compute, |(i, _)| i);

    let present = if want_present {
        let graphics_present = indexed()
            .find(|&(i, f)| has(f, vk::QueueFlags::GRAPHICS) && supports_present(i))
            .map(|(i, _)| i);
        let any_present = indexed()
            .find(|&(i, f)| usable(f) && supports_present(i))
            .map(|(i, _)| i);
        Some(graphics_present.or(any_present).ok_or_else(|| {
            GpuError::DeviceInit("no queue family can present to the surface".to_string())
        })?)
    } else {
        None
    };

    Ok(QueueFamilyIndices {
        compute,
        transfer,
        present,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn desktop_table() -> Vec<vk::QueueFamilyProperties> {
        vec![
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ]
    }

    #[test]
    fn prefers_dedicated_families() {
        let indices = select_queue_families(&desktop_table(), |i| i == 0, true).unwrap();
        assert_eq!(indices.compute, 2);
        assert_eq!(indices.transfer, 1);
        assert_eq!(indices.present, Some(0));
        assert!(indices.needs_ownership_transfer());
        assert_eq!(indices.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn single_universal_family() {
        let table = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let indices = select_queue_families(&table, |_| true, true).unwrap();
        assert_eq!(indices.compute, 0);
        assert_eq!(indices.transfer, 0);
        assert_eq!(indices.present, Some(0));
        assert!(!indices.needs_ownership_transfer());
        assert_eq!(indices.unique(), vec![0]);
    }

    #[test]
    fn headless_skips_present() {
        let indices = select_queue_families(&desktop_table(), |_| false, false).unwrap();
        assert_eq!(indices.present, None);
        assert!(!indices.needs_ownership_transfer());
    }

    #[test]
    fn present_falls_back_to_non_graphics_family() {
        let indices = select_queue_families(&desktop_table(), |i| i == 2, true).unwrap();
        assert_eq!(indices.present, Some(2));
        assert!(!indices.needs_ownership_transfer());
    }

    #[test]
    fn missing_present_support_is_an_error() {
        let err = select_queue_families(&desktop_table(), |_| false, true).unwrap_err();
        assert!(matches!(err, GpuError::DeviceInit(_)));
    }

    #[test]
    fn missing_compute_is_an_error() {
        let table = [family(vk::QueueFlags::TRANSFER)];
        assert!(select_queue_families(&table, |_| true, false).is_err());
    }

    #[test]
    fn empty_families_are_ignored() {
        let mut table = desktop_table();
        table[2].queue_count = 0;
        let indices = select_queue_families(&table, |i| i == 0, true).unwrap();
        assert_eq!(indices.compute, 0);
    }
}
