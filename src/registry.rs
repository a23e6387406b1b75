//! Session-scoped registry of placed image volumes, keyed by Frame of
//! Reference UID, used to align later dose and structure imports.

use crate::{geometry::PatientGeometry, output::WorldTransform};

use log::debug;
use nalgebra::{Matrix3, Point3, Vector3};
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

/// Geometry of a placed image volume, recorded so later imports in the same
/// frame of reference can be positioned relative to it.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameAnchor {
    pub frame_uid: Option<String>,
    /// Patient-space position of voxel `[0, 0, 0]` in mm
    pub origin: Point3<f64>,
    /// Maps `[slice, row, col]` index deltas to mm
    pub basis: Matrix3<f64>,
    /// `(slice, row, col)` spacing in mm
    pub spacing: Vector3<f64>,
}

impl FrameAnchor {
    pub fn from_geometry(geometry: &PatientGeometry, frame_uid: Option<String>) -> Self {
        Self {
            frame_uid,
            origin: *geometry.origin(),
            basis: *geometry.basis(),
            spacing: *geometry.spacing(),
        }
    }

    /// Displacement of `point` from the anchor origin, expressed along the
    /// anchor's own axes in mm: the index-space offset re-scaled by the
    /// anchor's spacing.
    pub fn local_offset(&self, point: &Point3<f64>) -> Option<Vector3<f64>> {
        let inverse_basis = self.basis.try_inverse()?;
        Some((inverse_basis * (point - self.origin)).component_mul(&self.spacing))
    }

    /// Placement of a volume inside the anchor volume's local scene frame,
    /// where the anchor sits at the identity transform.
    pub fn relative_transform(&self, geometry: &PatientGeometry) -> Option<WorldTransform> {
        let offset = self.local_offset(geometry.origin())?;
        let anchor_directions =
            self.basis * Matrix3::from_diagonal(&self.spacing.map(|s| 1.0 / s));
        let rotation = anchor_directions.try_inverse()? * geometry.axis_directions();
        Some(WorldTransform::new(Point3::from(offset / 1000.0), rotation))
    }
}

#[derive(Debug, Default)]
struct Anchors {
    by_frame: HashMap<Option<String>, FrameAnchor>,
    latest: Option<Option<String>>,
}

/// Read-mostly map from Frame of Reference UID to the most recently
/// registered anchor. Shared between imports through `Arc`.
#[derive(Debug, Default)]
pub struct FrameRegistry {
    anchors: RwLock<Anchors>,
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `anchor` under its frame UID, replacing any earlier anchor for
    /// the same frame.
    pub fn register(&self, anchor: FrameAnchor) {
        let mut anchors = self.anchors.write().unwrap_or_else(PoisonError::into_inner);
        let key = anchor.frame_uid.clone();
        debug!("Registering frame anchor for {:?}", key);
        anchors.by_frame.insert(key.clone(), anchor);
        anchors.latest = Some(key);
    }

    /// Anchor registered for exactly `frame_uid`. Without a UID, the most
    /// recently registered anchor of any frame is returned.
    pub fn lookup(&self, frame_uid: Option<&str>) -> Option<FrameAnchor> {
        let anchors = self.anchors.read().unwrap_or_else(PoisonError::into_inner);
        match frame_uid {
            Some(uid) => anchors.by_frame.get(&Some(uid.to_string())).cloned(),
            None => anchors
                .latest
                .as_ref()
                .and_then(|key| anchors.by_frame.get(key))
                .cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.anchors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_frame
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.anchors.write().unwrap_or_else(PoisonError::into_inner) = Anchors::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::{sync::Arc, thread};

    fn anchor(frame_uid: Option<&str>, origin: Point3<f64>) -> FrameAnchor {
        FrameAnchor {
            frame_uid: frame_uid.map(str::to_string),
            origin,
            basis: Matrix3::from_columns(&[
                Vector3::new(0.0, 0.0, -2.0),
                Vector3::new(0.0, 0.5, 0.0),
                Vector3::new(0.5, 0.0, 0.0),
            ]),
            spacing: Vector3::new(2.0, 0.5, 0.5),
        }
    }

    #[test]
    fn last_registration_wins() {
        let registry = FrameRegistry::new();
        registry.register(anchor(Some("1.2"), Point3::origin()));
        registry.register(anchor(Some("1.2"), Point3::new(1.0, 2.0, 3.0)));

        let found = registry.lookup(Some("1.2")).unwrap();

        assert_eq!(found.origin, Point3::new(1.0, 2.0, 3.0));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_is_exact_for_uids() {
        let registry = FrameRegistry::new();
        registry.register(anchor(Some("1.2"), Point3::origin()));

        assert!(registry.lookup(Some("1.3")).is_none());
        assert!(FrameRegistry::new().lookup(None).is_none());
    }

    #[test]
    fn lookup_without_uid_returns_latest() {
        let registry = FrameRegistry::new();
        registry.register(anchor(Some("1.2"), Point3::origin()));
        registry.register(anchor(None, Point3::new(5.0, 0.0, 0.0)));
        registry.register(anchor(Some("1.3"), Point3::new(7.0, 0.0, 0.0)));

        assert_eq!(registry.lookup(None).unwrap().origin.x, 7.0);
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_readers_see_registered_anchor() {
        let registry = Arc::new(FrameRegistry::new());
        registry.register(anchor(Some("1.2"), Point3::new(0.0, 0.0, 6.0)));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.lookup(Some("1.2")).map(|a| a.origin))
            })
            .collect();

        for reader in readers {
            assert_eq!(reader.join().unwrap(), Some(Point3::new(0.0, 0.0, 6.0)));
        }
    }

    #[test]
    fn local_offset_is_expressed_along_anchor_axes() {
        let anchor = anchor(Some("1.2"), Point3::new(0.0, 0.0, 6.0));

        let offset = anchor.local_offset(&Point3::new(10.0, 4.0, 2.0)).unwrap();

        assert_relative_eq!(offset, Vector3::new(4.0, 4.0, 10.0), epsilon = 1e-12);
    }

    #[test]
    fn relative_transform_of_the_anchor_geometry_is_identity() {
        let geometry = PatientGeometry::new(
            Point3::new(0.0, 0.0, 6.0),
            Matrix3::from_columns(&[-Vector3::z(), Vector3::y(), Vector3::x()]),
            Vector3::new(2.0, 0.5, 0.5),
            (4, 4, 4),
        )
        .unwrap();
        let anchor = FrameAnchor::from_geometry(&geometry, Some("1.2".to_string()));

        let transform = anchor.relative_transform(&geometry).unwrap();

        assert_relative_eq!(transform.translation, Point3::origin(), epsilon = 1e-12);
        assert_relative_eq!(transform.rotation, Matrix3::identity(), epsilon = 1e-12);
    }
}
