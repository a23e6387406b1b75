//! Patient-space geometry shared by every reconstructed volume.
//!
//! Index vectors are always ordered `[slice, row, col]`, matching the layout
//! of the voxel arrays (`Array3` with shape `(num_slices, rows, cols)`).
//! A voxel index maps to patient space (mm) as
//! `origin + basis * index`, and back as `inverse_basis * (point - origin)`.

use crate::{metadata::ImageOrientation, structure::ContourPolygon, volume::SeriesVolume};

use log::{debug, warn};
use nalgebra::{Matrix3, Point3, Vector3};
use thiserror::Error;

/// Tolerance below which vectors and deltas are treated as degenerate (mm).
pub const EPSILON: f64 = 1e-6;

/// Contour slice positions closer than this are considered the same plane (mm).
const SLICE_MERGE_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("No referenced image slices available")]
    NoSlices,

    #[error("No valid contour points found in the structure set")]
    NoContours,

    #[error("Invalid grid dimensions {0:?}")]
    InvalidDimensions((usize, usize, usize)),

    #[error("Invalid voxel spacing {0:?}")]
    InvalidSpacing([f64; 3]),

    #[error("Patient basis is not invertible")]
    SingularBasis,

    #[error("No ROI produced a non-empty mask")]
    NoMasks,
}

/// Orthonormal in-plane directions and slice normal of an image plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaneAxes {
    pub row: Vector3<f64>,
    pub column: Vector3<f64>,
    pub normal: Vector3<f64>,
}

impl PlaneAxes {
    /// Normalize the orientation cosines and derive the slice normal.
    ///
    /// Degenerate cosines (zero length or parallel) fall back to the
    /// identity orientation, whose normal is +Z. The column direction is
    /// re-derived from the normal so the three axes are exactly orthonormal.
    pub fn from_orientation(orientation: &ImageOrientation) -> Self {
        let axes = orientation
            .row
            .try_normalize(EPSILON)
            .zip(orientation.column.try_normalize(EPSILON))
            .and_then(|(row, column)| {
                let normal = row.cross(&column).try_normalize(EPSILON)?;
                Some(Self {
                    row,
                    column: normal.cross(&row),
                    normal,
                })
            });

        axes.unwrap_or_else(|| {
            warn!("Degenerate ImageOrientationPatient {orientation:?}, using identity orientation");
            Self::identity()
        })
    }

    pub fn identity() -> Self {
        Self {
            row: Vector3::x(),
            column: Vector3::y(),
            normal: Vector3::z(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatientGeometry {
    origin: Point3<f64>,
    basis: Matrix3<f64>,
    inverse_basis: Matrix3<f64>,
    spacing: Vector3<f64>,
    dims: (usize, usize, usize),
}

impl PatientGeometry {
    /// Build a geometry from unit axis directions (columns in `[slice, row,
    /// col]` order) scaled by the per-axis spacing.
    pub fn new(
        origin: Point3<f64>,
        directions: Matrix3<f64>,
        spacing: Vector3<f64>,
        dims: (usize, usize, usize),
    ) -> Result<Self, GeometryError> {
        if dims.0 == 0 || dims.1 == 0 || dims.2 == 0 {
            return Err(GeometryError::InvalidDimensions(dims));
        }
        if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(GeometryError::InvalidSpacing([spacing.x, spacing.y, spacing.z]));
        }

        let basis = directions * Matrix3::from_diagonal(&spacing);
        let inverse_basis = basis.try_inverse().ok_or(GeometryError::SingularBasis)?;

        Ok(Self {
            origin,
            basis,
            inverse_basis,
            spacing,
            dims,
        })
    }

    /// Geometry of an assembled image series.
    ///
    /// The origin is the position of the slice at array index 0 and the slice
    /// axis points from that slice toward the last one, so the sign follows
    /// whatever order the assembler produced.
    pub fn from_series(volume: &SeriesVolume) -> Result<Self, GeometryError> {
        let slices = volume.slices();
        let (first, last) = match (slices.first(), slices.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(GeometryError::NoSlices),
        };

        let axes = PlaneAxes::from_orientation(&first.orientation);
        let direction = if (last.position - first.position).dot(&axes.normal) < 0.0 {
            -1.0
        } else {
            1.0
        };
        let (row_spacing, column_spacing) = first.pixel_spacing;

        let geometry = Self::new(
            first.position,
            Matrix3::from_columns(&[axes.normal * direction, axes.column, axes.row]),
            Vector3::new(volume.slice_spacing(), row_spacing, column_spacing),
            volume.dim(),
        )?;
        debug!("Series geometry: {geometry:?}");
        Ok(geometry)
    }

    /// Synthesize a grid bounding every contour when no reference image
    /// series is available.
    ///
    /// In-plane spacing is 1 mm. The slice spacing is the median distance
    /// between distinct contour planes (1 mm for a single plane). The grid
    /// starts at the minimum corner of the contour bounds and keeps a
    /// one-voxel margin.
    pub fn from_contours(contours: &[&ContourPolygon]) -> Result<Self, GeometryError> {
        if contours.is_empty() {
            return Err(GeometryError::NoContours);
        }

        let normal = contour_normal(contours);
        let row_seed = contour_row_direction(contours, &normal);
        let column = normal.cross(&row_seed).normalize();
        let row = column.cross(&normal).normalize();

        let all_points = || contours.iter().flat_map(|contour| contour.points().iter());
        let (min_row, max_row) = bounds(all_points().map(|p| p.coords.dot(&row)));
        let (min_column, max_column) = bounds(all_points().map(|p| p.coords.dot(&column)));

        let mut planes: Vec<f64> = contours
            .iter()
            .map(|contour| contour.mean_projection(&normal))
            .collect();
        planes.sort_by(f64::total_cmp);
        planes.dedup_by(|next, kept| (*next - *kept).abs() <= SLICE_MERGE_TOLERANCE);

        let (slice_spacing, min_slice, max_slice) = if planes.len() > 1 {
            let deltas: Vec<f64> = planes
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).abs())
                .filter(|delta| *delta > EPSILON)
                .collect();
            (median(&deltas).unwrap_or(1.0), planes[0], planes[planes.len() - 1])
        } else {
            let (min_slice, max_slice) = bounds(all_points().map(|p| p.coords.dot(&normal)));
            (1.0, min_slice, max_slice)
        };

        let (row_spacing, column_spacing) = (1.0, 1.0);
        let rows = ((max_row - min_row) / row_spacing).ceil() as usize + 2;
        let columns = ((max_column - min_column) / column_spacing).ceil() as usize + 2;
        let num_slices = ((max_slice - min_slice) / slice_spacing).ceil() as usize + 1;

        let origin = Point3::from(row * min_row + column * min_column + normal * min_slice);

        let geometry = Self::new(
            origin,
            Matrix3::from_columns(&[normal, row, column]),
            Vector3::new(slice_spacing, row_spacing, column_spacing),
            (num_slices.max(1), rows.max(1), columns.max(1)),
        )?;
        debug!("Contour-derived geometry: {geometry:?}");
        Ok(geometry)
    }

    pub fn origin(&self) -> &Point3<f64> {
        &self.origin
    }

    /// Maps `[slice, row, col]` index deltas to mm displacements.
    pub fn basis(&self) -> &Matrix3<f64> {
        &self.basis
    }

    pub fn inverse_basis(&self) -> &Matrix3<f64> {
        &self.inverse_basis
    }

    /// `(slice, row, col)` spacing in mm
    pub fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    /// `(num_slices, rows, cols)`
    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    /// Unit direction of each index axis, as columns in `[slice, row, col]` order.
    pub fn axis_directions(&self) -> Matrix3<f64> {
        self.basis * Matrix3::from_diagonal(&self.spacing.map(|s| 1.0 / s))
    }

    pub fn index_to_patient(&self, index: &Vector3<f64>) -> Point3<f64> {
        self.origin + self.basis * index
    }

    pub fn patient_to_index(&self, point: &Point3<f64>) -> Vector3<f64> {
        self.inverse_basis * (point - self.origin)
    }
}

/// Normal of the first non-degenerate triangle fan found in the contours,
/// or the direction of least variance when every contour is collinear.
fn contour_normal(contours: &[&ContourPolygon]) -> Vector3<f64> {
    let fan_normal = contours.iter().find_map(|contour| {
        let points = contour.points();
        let base = points[0];
        points.windows(2).skip(1).find_map(|pair| {
            (pair[0] - base)
                .cross(&(pair[1] - base))
                .try_normalize(EPSILON)
        })
    });
    if let Some(normal) = fan_normal {
        return normal;
    }

    warn!("All contours are collinear, estimating plane normal from point covariance");
    let points: Vec<&Point3<f64>> = contours.iter().flat_map(|c| c.points().iter()).collect();
    let count = points.len() as f64;
    let centroid = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords)
        / count;
    let covariance = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = p.coords - centroid;
        acc + d * d.transpose()
    }) / (count - 1.0).max(1.0);

    let eigen = covariance.symmetric_eigen();
    let smallest = eigen.eigenvalues.imin();
    eigen
        .eigenvectors
        .column(smallest)
        .into_owned()
        .try_normalize(EPSILON)
        .unwrap_or_else(Vector3::z)
}

/// First contour edge with an in-plane component, projected onto the plane.
fn contour_row_direction(contours: &[&ContourPolygon], normal: &Vector3<f64>) -> Vector3<f64> {
    let in_plane = |v: Vector3<f64>| v - normal * v.dot(normal);

    contours
        .iter()
        .find_map(|contour| {
            contour
                .edges()
                .find_map(|edge| in_plane(edge).try_normalize(EPSILON))
        })
        .unwrap_or_else(|| {
            let trial = if Vector3::x().dot(normal).abs() > 0.9 {
                Vector3::y()
            } else {
                Vector3::x()
            };
            in_plane(trial).normalize()
        })
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), v| {
        (min.min(v), max.max(v))
    })
}

pub(crate) fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
