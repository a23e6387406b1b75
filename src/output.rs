//! Boundary to the host scene: volume storage, point storage and placement.
//!
//! The core never touches scene state directly. It hands finished arrays
//! to a [`VolumeSink`] or [`PointSink`] and positions the returned handles
//! through a [`SceneSink`].

use crate::geometry::PatientGeometry;

use log::{debug, warn};
use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
use ndarray::Array3;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("Invalid voxel spacing {0:?}, spacing values must be positive")]
    InvalidSpacing([f64; 3]),

    #[error("Volume {0} has no voxels")]
    EmptyVolume(String),

    #[error("Point set {name}: attribute {attribute} has {found} values for {expected} points")]
    DimensionMismatch {
        name: String,
        attribute: String,
        expected: usize,
        found: usize,
    },

    #[error("Unknown output handle {0}")]
    UnknownHandle(String),

    #[error("Storage backend failed: {0}")]
    Backend(String),
}

/// Identifier of an object produced by a sink.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    pub id: u64,
    pub name: String,
}

/// Placement of a produced object: translation in metres and a rotation
/// whose columns are the unit directions of the object's local axes.
#[derive(Clone, Debug, PartialEq)]
pub struct WorldTransform {
    pub translation: Point3<f64>,
    pub rotation: Matrix3<f64>,
}

impl Default for WorldTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl WorldTransform {
    pub fn new(translation: Point3<f64>, rotation: Matrix3<f64>) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Point3::origin(), Matrix3::identity())
    }

    /// Place a volume directly in patient space (converted to metres).
    pub fn from_geometry(geometry: &PatientGeometry) -> Self {
        Self::new(
            Point3::from(geometry.origin().coords / 1000.0),
            geometry.axis_directions(),
        )
    }

    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        let mut matrix = self.rotation.to_homogeneous();
        matrix
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&self.translation.coords);
        matrix
    }
}

/// Points with named per-point scalar attributes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointSet {
    pub positions: Vec<Point3<f64>>,
    pub attributes: Vec<(String, Vec<f64>)>,
}

impl PointSet {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn attribute(&self, name: &str) -> Option<&[f64]> {
        self.attributes
            .iter()
            .find(|(attribute, _)| attribute == name)
            .map(|(_, values)| values.as_slice())
    }

    fn validate(&self, name: &str) -> Result<(), StorageError> {
        match self
            .attributes
            .iter()
            .find(|(_, values)| values.len() != self.positions.len())
        {
            Some((attribute, values)) => Err(StorageError::DimensionMismatch {
                name: name.to_string(),
                attribute: attribute.clone(),
                expected: self.positions.len(),
                found: values.len(),
            }),
            None => Ok(()),
        }
    }
}

pub trait VolumeSink {
    /// Store a scalar volume with `[slice, row, col]` spacing in metres.
    fn store_volume(
        &mut self,
        name: &str,
        voxels: &Array3<f32>,
        spacing_m: [f64; 3],
    ) -> Result<Handle, StorageError>;

    /// Remove a previously stored volume.
    fn discard_volume(&mut self, handle: &Handle) -> Result<(), StorageError>;
}

pub trait PointSink {
    fn store_points(&mut self, name: &str, points: &PointSet) -> Result<Handle, StorageError>;

    fn discard_points(&mut self, handle: &Handle) -> Result<(), StorageError>;
}

pub trait SceneSink {
    fn place(&mut self, handle: &Handle, transform: &WorldTransform) -> Result<(), StorageError>;
}

/// A finished volume waiting to be written.
#[derive(Clone, Debug)]
pub struct VolumeOutput {
    pub name: String,
    pub voxels: Array3<f32>,
    /// `(slice, row, col)` spacing in mm
    pub spacing: Vector3<f64>,
    pub transform: WorldTransform,
}

/// A finished point set waiting to be written.
#[derive(Clone, Debug)]
pub struct PointOutput {
    pub name: String,
    pub points: PointSet,
    pub transform: WorldTransform,
}

pub struct OutputAdapter;

impl OutputAdapter {
    /// Store and place every volume. Either all volumes end up in the sink
    /// or, on the first failure, the ones already stored are discarded.
    pub fn emit_volumes<S>(
        sink: &mut S,
        outputs: &[VolumeOutput],
    ) -> Result<Vec<Handle>, StorageError>
    where
        S: VolumeSink + SceneSink,
    {
        let mut handles = Vec::with_capacity(outputs.len());
        for output in outputs {
            match Self::emit_volume(sink, output) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    Self::rollback(&handles, |handle| sink.discard_volume(handle));
                    return Err(err);
                }
            }
        }
        Ok(handles)
    }

    /// Store and place every point set, all or nothing.
    pub fn emit_points<S>(
        sink: &mut S,
        outputs: &[PointOutput],
    ) -> Result<Vec<Handle>, StorageError>
    where
        S: PointSink + SceneSink,
    {
        let mut handles = Vec::with_capacity(outputs.len());
        for output in outputs {
            let result = output
                .points
                .validate(&output.name)
                .and_then(|_| sink.store_points(&output.name, &output.points))
                .and_then(|handle| {
                    if let Err(err) = sink.place(&handle, &output.transform) {
                        Self::rollback(std::slice::from_ref(&handle), |h| sink.discard_points(h));
                        return Err(err);
                    }
                    Ok(handle)
                });
            match result {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    Self::rollback(&handles, |handle| sink.discard_points(handle));
                    return Err(err);
                }
            }
        }
        Ok(handles)
    }

    fn emit_volume<S>(sink: &mut S, output: &VolumeOutput) -> Result<Handle, StorageError>
    where
        S: VolumeSink + SceneSink,
    {
        let spacing_m = [
            output.spacing.x / 1000.0,
            output.spacing.y / 1000.0,
            output.spacing.z / 1000.0,
        ];
        if spacing_m.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(StorageError::InvalidSpacing(spacing_m));
        }
        if output.voxels.is_empty() {
            return Err(StorageError::EmptyVolume(output.name.clone()));
        }

        let handle = sink.store_volume(&output.name, &output.voxels, spacing_m)?;
        if let Err(err) = sink.place(&handle, &output.transform) {
            Self::rollback(std::slice::from_ref(&handle), |h| sink.discard_volume(h));
            return Err(err);
        }
        debug!("Stored volume {} as {:?}", output.name, handle);
        Ok(handle)
    }

    fn rollback<F>(handles: &[Handle], mut discard: F)
    where
        F: FnMut(&Handle) -> Result<(), StorageError>,
    {
        for handle in handles {
            if let Err(err) = discard(handle) {
                warn!("Unable to discard {}: {err}", handle.name);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoredVolume {
    pub handle: Handle,
    pub voxels: Array3<f32>,
    pub spacing_m: [f64; 3],
}

#[derive(Clone, Debug)]
pub struct StoredPoints {
    pub handle: Handle,
    pub points: PointSet,
}

/// Sink keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    next_id: u64,
    pub volumes: Vec<StoredVolume>,
    pub point_sets: Vec<StoredPoints>,
    pub placements: HashMap<Handle, WorldTransform>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn volume(&self, name: &str) -> Option<&StoredVolume> {
        self.volumes.iter().find(|volume| volume.handle.name == name)
    }

    pub fn points(&self, name: &str) -> Option<&StoredPoints> {
        self.point_sets.iter().find(|points| points.handle.name == name)
    }

    pub fn placement(&self, name: &str) -> Option<&WorldTransform> {
        self.placements
            .iter()
            .find(|(handle, _)| handle.name == name)
            .map(|(_, transform)| transform)
    }

    fn next_handle(&mut self, name: &str) -> Handle {
        self.next_id += 1;
        Handle {
            id: self.next_id,
            name: name.to_string(),
        }
    }
}

impl VolumeSink for MemorySink {
    fn store_volume(
        &mut self,
        name: &str,
        voxels: &Array3<f32>,
        spacing_m: [f64; 3],
    ) -> Result<Handle, StorageError> {
        if spacing_m.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(StorageError::InvalidSpacing(spacing_m));
        }
        if voxels.is_empty() {
            return Err(StorageError::EmptyVolume(name.to_string()));
        }
        let handle = self.next_handle(name);
        self.volumes.push(StoredVolume {
            handle: handle.clone(),
            voxels: voxels.clone(),
            spacing_m,
        });
        Ok(handle)
    }

    fn discard_volume(&mut self, handle: &Handle) -> Result<(), StorageError> {
        let before = self.volumes.len();
        self.volumes.retain(|volume| &volume.handle != handle);
        self.placements.remove(handle);
        if self.volumes.len() == before {
            return Err(StorageError::UnknownHandle(handle.name.clone()));
        }
        Ok(())
    }
}

impl PointSink for MemorySink {
    fn store_points(&mut self, name: &str, points: &PointSet) -> Result<Handle, StorageError> {
        points.validate(name)?;
        let handle = self.next_handle(name);
        self.point_sets.push(StoredPoints {
            handle: handle.clone(),
            points: points.clone(),
        });
        Ok(handle)
    }

    fn discard_points(&mut self, handle: &Handle) -> Result<(), StorageError> {
        let before = self.point_sets.len();
        self.point_sets.retain(|points| &points.handle != handle);
        self.placements.remove(handle);
        if self.point_sets.len() == before {
            return Err(StorageError::UnknownHandle(handle.name.clone()));
        }
        Ok(())
    }
}

impl SceneSink for MemorySink {
    fn place(&mut self, handle: &Handle, transform: &WorldTransform) -> Result<(), StorageError> {
        self.placements.insert(handle.clone(), transform.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn output(name: &str, spacing: Vector3<f64>) -> VolumeOutput {
        VolumeOutput {
            name: name.to_string(),
            voxels: Array3::from_elem((2, 2, 2), 1.0),
            spacing,
            transform: WorldTransform::identity(),
        }
    }

    #[test]
    fn volumes_are_stored_in_metres_and_placed() {
        let mut sink = MemorySink::new();

        let handles =
            OutputAdapter::emit_volumes(&mut sink, &[output("CT", Vector3::new(2.0, 0.5, 0.5))])
                .unwrap();

        assert_eq!(handles.len(), 1);
        let stored = sink.volume("CT").unwrap();
        assert_relative_eq!(stored.spacing_m[0], 0.002);
        assert_relative_eq!(stored.spacing_m[2], 0.0005);
        assert_eq!(sink.placement("CT"), Some(&WorldTransform::identity()));
    }

    #[test]
    fn failed_batch_leaves_nothing_behind() {
        let mut sink = MemorySink::new();
        let outputs = [
            output("PTV", Vector3::new(1.0, 1.0, 1.0)),
            output("CTV", Vector3::new(0.0, 1.0, 1.0)),
        ];

        let result = OutputAdapter::emit_volumes(&mut sink, &outputs);

        assert!(matches!(result, Err(StorageError::InvalidSpacing(_))));
        assert!(sink.volumes.is_empty());
        assert!(sink.placements.is_empty());
    }

    #[test]
    fn mismatched_point_attributes_are_rejected() {
        let mut sink = MemorySink::new();
        let points = PointSet {
            positions: vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0)],
            attributes: vec![("spot_weight".to_string(), vec![1.0])],
        };

        let result = OutputAdapter::emit_points(
            &mut sink,
            &[PointOutput {
                name: "spots".to_string(),
                points,
                transform: WorldTransform::identity(),
            }],
        );

        assert!(matches!(
            result,
            Err(StorageError::DimensionMismatch { expected: 2, found: 1, .. })
        ));
        assert!(sink.point_sets.is_empty());
    }

    #[test]
    fn homogeneous_matrix_carries_translation() {
        let transform = WorldTransform::new(Point3::new(0.1, 0.2, 0.3), Matrix3::identity());

        let matrix = transform.to_homogeneous();

        assert_relative_eq!(matrix[(0, 3)], 0.1);
        assert_relative_eq!(matrix[(2, 3)], 0.3);
        assert_relative_eq!(matrix[(3, 3)], 1.0);
    }
}
