use crate::{
    geometry::{EPSILON, GeometryError, PatientGeometry, PlaneAxes, median},
    metadata::{DecodeError, DicomFile, SliceInfo, decode_frames, float_attr, multi_float_attr},
};

use dicom_dictionary_std::tags;
use log::debug;
use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;

/// A decoded RT Dose grid, frames ordered as stored (frame 0 at
/// ImagePositionPatient).
#[derive(Clone, Debug)]
pub struct DoseGrid {
    pub info: SliceInfo,
    /// GridFrameOffsetVector in mm, relative to frame 0
    pub frame_offsets: Vec<f64>,
    pub data: Array3<f32>,
}

impl DoseGrid {
    pub fn from_dicom_object(dicom_object: &DicomFile, rescale: bool) -> Result<Self, DecodeError> {
        let mut data = decode_frames(dicom_object)?;
        if rescale {
            if let Some(scaling) = float_attr(dicom_object, tags::DOSE_GRID_SCALING) {
                data.mapv_inplace(|value| value * scaling as f32);
            }
        }

        Ok(Self {
            info: SliceInfo::from_dicom_object(dicom_object),
            frame_offsets: multi_float_attr(dicom_object, tags::GRID_FRAME_OFFSET_VECTOR)
                .unwrap_or_default(),
            data,
        })
    }

    pub fn frame_of_reference_uid(&self) -> Option<&str> {
        self.info.frame_of_reference_uid.as_deref()
    }

    /// Signed distance between consecutive frames: the median non-zero delta
    /// of GridFrameOffsetVector, else SliceThickness, else 1 mm.
    pub fn slice_step(&self) -> f64 {
        let deltas: Vec<f64> = self
            .frame_offsets
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .filter(|delta| delta.abs() > EPSILON)
            .collect();

        let step = median(&deltas)
            .or(self.info.slice_thickness)
            .unwrap_or(1.0);
        if step.is_finite() && step != 0.0 {
            step
        } else {
            1.0
        }
    }

    pub fn geometry(&self) -> Result<PatientGeometry, GeometryError> {
        let axes = PlaneAxes::from_orientation(&self.info.orientation);
        let step = self.slice_step();
        let (row_spacing, column_spacing) = self.info.pixel_spacing;
        debug!("Dose grid {:?}, frame step {step} mm", self.data.dim());

        PatientGeometry::new(
            self.info.position,
            Matrix3::from_columns(&[axes.normal * step.signum(), axes.column, axes.row]),
            Vector3::new(step.abs(), row_spacing, column_spacing),
            self.data.dim(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn grid(frame_offsets: Vec<f64>, slice_thickness: Option<f64>) -> DoseGrid {
        DoseGrid {
            info: SliceInfo {
                position: Point3::new(-5.0, -5.0, 10.0),
                pixel_spacing: (2.0, 3.0),
                slice_thickness,
                ..SliceInfo::default()
            },
            frame_offsets,
            data: Array3::zeros((3, 4, 5)),
        }
    }

    #[test]
    fn frame_offsets_set_spacing_and_direction() {
        let dose = grid(vec![0.0, -2.5, -5.0], None);

        let geometry = dose.geometry().unwrap();

        assert_relative_eq!(*geometry.spacing(), Vector3::new(2.5, 2.0, 3.0));
        assert_relative_eq!(
            geometry.index_to_patient(&Vector3::new(2.0, 0.0, 0.0)),
            Point3::new(-5.0, -5.0, 5.0)
        );
        assert_eq!(geometry.dims(), (3, 4, 5));
    }

    #[test]
    fn missing_offsets_fall_back_to_thickness() {
        assert_relative_eq!(grid(Vec::new(), Some(4.0)).slice_step(), 4.0);
        assert_relative_eq!(grid(vec![0.0, 0.0], None).slice_step(), 1.0);
    }

    #[test]
    fn columns_follow_row_cosine() {
        let geometry = grid(vec![0.0, 1.0, 2.0], None).geometry().unwrap();

        let point = geometry.index_to_patient(&Vector3::new(0.0, 1.0, 2.0));

        assert_relative_eq!(point, Point3::new(1.0, -3.0, 10.0));
    }
}
