//! Even-odd rasterization of RT Structure Set contours into voxel masks.
//!
//! Every contour toggles the pixels it encloses on its slice plane, so
//! contours nested on one plane carve holes out of each other.

use crate::{
    geometry::PatientGeometry,
    structure::{ContourPolygon, Roi},
};

use log::{debug, warn};
use ndarray::{Array3, ArrayViewMut2, s};
use rayon::prelude::*;

/// Voxel mask of one ROI on a [`PatientGeometry`] grid.
#[derive(Clone, Debug, PartialEq)]
pub struct StructureMask {
    pub name: String,
    pub mask: Array3<bool>,
}

impl StructureMask {
    /// Mask as 0/1 densities, the form handed to volume sinks.
    pub fn to_density(&self) -> Array3<f32> {
        self.mask.mapv(|inside| if inside { 1.0 } else { 0.0 })
    }

    pub fn voxel_count(&self) -> usize {
        self.mask.iter().filter(|inside| **inside).count()
    }
}

pub struct ContourRasterizer;

impl ContourRasterizer {
    /// Rasterize every ROI, dropping those whose mask is empty.
    pub fn rasterize_all(
        rois: &[Roi],
        geometry: &PatientGeometry,
        parallel: bool,
    ) -> Vec<StructureMask> {
        if parallel {
            rois.par_iter()
                .filter_map(|roi| Self::rasterize_roi(roi, geometry))
                .collect()
        } else {
            rois.iter()
                .filter_map(|roi| Self::rasterize_roi(roi, geometry))
                .collect()
        }
    }

    /// Rasterize one ROI. Returns `None` when no voxel ends up inside.
    pub fn rasterize_roi(roi: &Roi, geometry: &PatientGeometry) -> Option<StructureMask> {
        let (num_slices, rows, cols) = geometry.dims();
        let mut mask = Array3::<bool>::from_elem((num_slices, rows, cols), false);

        for contour in &roi.contours {
            let (slice_index, polygon) = Self::to_index_space(contour, geometry);
            match usize::try_from(slice_index) {
                Ok(index) if index < num_slices => {
                    Self::xor_polygon(mask.slice_mut(s![index, .., ..]), &polygon);
                }
                _ => debug!(
                    "ROI {}: contour maps to slice {slice_index}, outside 0..{num_slices}",
                    roi.name
                ),
            }
        }

        if mask.iter().any(|inside| *inside) {
            Some(StructureMask {
                name: roi.name.clone(),
                mask,
            })
        } else {
            warn!("ROI {} produced an empty mask, dropping it", roi.name);
            None
        }
    }

    /// Map a contour to fractional `(row, col)` coordinates and the nearest
    /// slice plane.
    fn to_index_space(
        contour: &ContourPolygon,
        geometry: &PatientGeometry,
    ) -> (i64, Vec<(f64, f64)>) {
        let indices: Vec<_> = contour
            .points()
            .iter()
            .map(|point| geometry.patient_to_index(point))
            .collect();
        let mean_slice = indices.iter().map(|index| index.x).sum::<f64>() / indices.len() as f64;
        let polygon = indices.iter().map(|index| (index.y, index.z)).collect();
        (mean_slice.round_ties_even() as i64, polygon)
    }

    /// Toggle every pixel whose center lies inside `polygon` (even-odd rule).
    ///
    /// A pixel `(r, c)` is tested at `(r + 0.5, c + 0.5)` with a ray toward
    /// increasing columns. Horizontal edges never count as crossings.
    pub fn xor_polygon(mut plane: ArrayViewMut2<'_, bool>, polygon: &[(f64, f64)]) {
        let (rows, cols) = plane.dim();
        if polygon.len() < ContourPolygon::MIN_POINTS || rows == 0 || cols == 0 {
            return;
        }

        let (min_r, max_r, min_c, max_c) = polygon.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
            |(min_r, max_r, min_c, max_c), &(r, c)| {
                (min_r.min(r), max_r.max(r), min_c.min(c), max_c.max(c))
            },
        );
        let row_range = clamp_range(min_r, max_r, rows);
        let col_range = clamp_range(min_c, max_c, cols);
        let (Some((r0, r1)), Some((c0, c1))) = (row_range, col_range) else {
            return;
        };

        let edges: Vec<_> = polygon
            .iter()
            .zip(polygon.iter().cycle().skip(1))
            .filter(|((ri, _), (rj, _))| ri != rj)
            .collect();

        let mut crossings = Vec::with_capacity(edges.len());
        for r in r0..=r1 {
            let y = r as f64 + 0.5;
            crossings.clear();
            crossings.extend(
                edges
                    .iter()
                    .filter(|((ri, _), (rj, _))| (*ri > y) != (*rj > y))
                    .map(|((ri, ci), (rj, cj))| (cj - ci) * (y - ri) / (rj - ri) + ci),
            );
            if crossings.is_empty() {
                continue;
            }
            for c in c0..=c1 {
                let x = c as f64 + 0.5;
                let count = crossings.iter().filter(|&&x_cross| x < x_cross).count();
                if count % 2 == 1 {
                    plane[[r, c]] ^= true;
                }
            }
        }
    }
}

/// Inclusive pixel range covering `[min, max]`, clipped to `0..len`.
fn clamp_range(min: f64, max: f64, len: usize) -> Option<(usize, usize)> {
    let low = min.floor().max(0.0);
    let high = max.ceil().min((len - 1) as f64);
    if !low.is_finite() || !high.is_finite() || low > high {
        return None;
    }
    Some((low as usize, high as usize))
}
