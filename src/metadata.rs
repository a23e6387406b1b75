use crate::enums::DicomKind;

use dicom::{
    core::Tag,
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder},
};
use dicom_dictionary_std::tags;
use nalgebra::{Point3, Vector3};
use ndarray::{Array2, Array3, s};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type DicomFile = FileDicomObject<InMemDicomObject>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unable to read DICOM file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: dicom::object::ReadError,
    },

    #[error("Unable to decode pixel data: {0}")]
    PixelData(#[from] dicom::pixeldata::Error),
}

/// Read a DICOM file from disk.
pub fn read_file(path: impl AsRef<Path>) -> Result<DicomFile, DecodeError> {
    let path = path.as_ref();
    open_file(path).map_err(|source| DecodeError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// The two in-plane direction cosines of ImageOrientationPatient.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageOrientation {
    /// Direction of increasing column index (along a row)
    pub row: Vector3<f64>,
    /// Direction of increasing row index (down a column)
    pub column: Vector3<f64>,
}

impl Default for ImageOrientation {
    fn default() -> Self {
        Self {
            row: Vector3::x(),
            column: Vector3::y(),
        }
    }
}

impl ImageOrientation {
    pub fn from_cosines(values: &[f64]) -> Option<Self> {
        if values.len() != 6 || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self {
            row: Vector3::new(values[0], values[1], values[2]),
            column: Vector3::new(values[3], values[4], values[5]),
        })
    }
}

/// Geometric and identifying attributes of one image slice, with every
/// optional attribute already resolved to its default.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceInfo {
    pub kind: Option<DicomKind>,
    pub series_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub frame_of_reference_uid: Option<String>,
    /// InstanceNumber, 0 when absent
    pub instance_number: i32,
    /// ImagePositionPatient of pixel (0, 0) in mm, origin when absent
    pub position: Point3<f64>,
    /// Identity orientation when absent or malformed
    pub orientation: ImageOrientation,
    /// (row spacing, column spacing) in mm, (1.0, 1.0) when absent
    pub pixel_spacing: (f64, f64),
    /// SliceThickness in mm, if present and positive
    pub slice_thickness: Option<f64>,
    pub rows: usize,
    pub columns: usize,
    /// Whether both ImagePositionPatient and ImageOrientationPatient were present
    pub has_patient_geometry: bool,
}

impl Default for SliceInfo {
    fn default() -> Self {
        Self {
            kind: None,
            series_uid: None,
            sop_instance_uid: None,
            frame_of_reference_uid: None,
            instance_number: 0,
            position: Point3::origin(),
            orientation: ImageOrientation::default(),
            pixel_spacing: (1.0, 1.0),
            slice_thickness: None,
            rows: 0,
            columns: 0,
            has_patient_geometry: false,
        }
    }
}

impl SliceInfo {
    /// Extract slice attributes. Never fails: missing or malformed optional
    /// attributes fall back to their documented defaults.
    pub fn from_dicom_object(dicom_object: &InMemDicomObject) -> Self {
        let position = multi_float_attr(dicom_object, tags::IMAGE_POSITION_PATIENT)
            .filter(|values| values.len() == 3)
            .map(|values| Point3::new(values[0], values[1], values[2]));
        let orientation = multi_float_attr(dicom_object, tags::IMAGE_ORIENTATION_PATIENT)
            .and_then(|values| ImageOrientation::from_cosines(&values));
        let pixel_spacing = multi_float_attr(dicom_object, tags::PIXEL_SPACING)
            .filter(|values| values.len() >= 2 && values[0] > 0.0 && values[1] > 0.0)
            .map(|values| (values[0], values[1]))
            .unwrap_or((1.0, 1.0));

        Self {
            kind: classify(dicom_object),
            series_uid: string_attr(dicom_object, tags::SERIES_INSTANCE_UID),
            sop_instance_uid: string_attr(dicom_object, tags::SOP_INSTANCE_UID),
            frame_of_reference_uid: string_attr(dicom_object, tags::FRAME_OF_REFERENCE_UID),
            instance_number: int_attr(dicom_object, tags::INSTANCE_NUMBER).unwrap_or(0),
            position: position.unwrap_or_else(Point3::origin),
            orientation: orientation.unwrap_or_default(),
            pixel_spacing,
            slice_thickness: float_attr(dicom_object, tags::SLICE_THICKNESS)
                .filter(|thickness| *thickness > 0.0),
            rows: int_attr(dicom_object, tags::ROWS).unwrap_or(0).max(0) as usize,
            columns: int_attr(dicom_object, tags::COLUMNS).unwrap_or(0).max(0) as usize,
            has_patient_geometry: position.is_some() && orientation.is_some(),
        }
    }
}

/// One decoded 2D image.
#[derive(Clone, Debug)]
pub struct Slice {
    pub info: SliceInfo,
    pub pixels: Array2<f32>,
}

impl Slice {
    pub fn new(info: SliceInfo, pixels: Array2<f32>) -> Self {
        Self { info, pixels }
    }

    /// Decode the first frame of pixel data for already extracted attributes.
    pub fn decode(dicom_object: &DicomFile, info: SliceInfo) -> Result<Self, DecodeError> {
        let frames = decode_frames(dicom_object)?;
        let pixels = frames.slice_move(s![0, .., ..]);
        Ok(Self { info, pixels })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.pixels.dim()
    }
}

/// Classify a decoded object by its Modality attribute.
pub fn classify(dicom_object: &InMemDicomObject) -> Option<DicomKind> {
    string_attr(dicom_object, tags::MODALITY).and_then(|m| DicomKind::from_modality(&m))
}

/// Decode every frame as (frames, rows, columns) with the modality LUT applied.
pub fn decode_frames(dicom_object: &DicomFile) -> Result<Array3<f32>, DecodeError> {
    let pixel_data = dicom_object.decode_pixel_data()?;
    let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::Default);
    let array = pixel_data.to_ndarray_with_options::<f32>(&options)?;
    Ok(array.slice_move(s![.., .., .., 0]))
}

pub(crate) fn string_attr(dicom_object: &InMemDicomObject, tag: Tag) -> Option<String> {
    dicom_object
        .element(tag)
        .ok()?
        .to_str()
        .ok()
        .map(|value| value.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn float_attr(dicom_object: &InMemDicomObject, tag: Tag) -> Option<f64> {
    dicom_object
        .element(tag)
        .ok()?
        .to_float64()
        .ok()
        .filter(|value| value.is_finite())
}

pub(crate) fn multi_float_attr(dicom_object: &InMemDicomObject, tag: Tag) -> Option<Vec<f64>> {
    dicom_object
        .element(tag)
        .ok()?
        .to_multi_float64()
        .ok()
        .filter(|values| !values.is_empty())
}

pub(crate) fn int_attr(dicom_object: &InMemDicomObject, tag: Tag) -> Option<i32> {
    dicom_object.element(tag).ok()?.to_int::<i32>().ok()
}

pub(crate) fn items(dicom_object: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
    dicom_object
        .element(tag)
        .ok()
        .and_then(|element| element.items())
        .unwrap_or(&[])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};
    use dicom::object::mem::InMemElement;

    pub(crate) fn element(tag: Tag, vr: VR, value: &str) -> InMemElement {
        DataElement::new(tag, vr, PrimitiveValue::from(value))
    }

    pub(crate) fn decimals(tag: Tag, values: &[f64]) -> InMemElement {
        let strings: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        DataElement::new(tag, VR::DS, PrimitiveValue::Strs(strings.into()))
    }

    #[test]
    fn full_attributes_are_extracted() {
        let object = InMemDicomObject::from_element_iter([
            element(tags::MODALITY, VR::CS, "CT"),
            element(tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3"),
            element(tags::INSTANCE_NUMBER, VR::IS, "7"),
            decimals(tags::IMAGE_POSITION_PATIENT, &[-10.0, 20.5, 3.0]),
            decimals(tags::IMAGE_ORIENTATION_PATIENT, &[0.0, 1.0, 0.0, 0.0, 0.0, -1.0]),
            decimals(tags::PIXEL_SPACING, &[0.5, 0.75]),
            decimals(tags::SLICE_THICKNESS, &[2.0]),
            DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [4])),
            DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [6])),
        ]);

        let info = SliceInfo::from_dicom_object(&object);

        assert_eq!(info.kind, Some(DicomKind::Image));
        assert_eq!(info.series_uid.as_deref(), Some("1.2.3"));
        assert_eq!(info.instance_number, 7);
        assert_relative_eq!(info.position.y, 20.5);
        assert_relative_eq!(info.orientation.column.z, -1.0);
        assert_eq!(info.pixel_spacing, (0.5, 0.75));
        assert_eq!(info.slice_thickness, Some(2.0));
        assert_eq!((info.rows, info.columns), (4, 6));
        assert!(info.has_patient_geometry);
    }

    #[test]
    fn missing_attributes_fall_back_to_defaults() {
        let object = InMemDicomObject::from_element_iter([element(tags::MODALITY, VR::CS, "MR")]);

        let info = SliceInfo::from_dicom_object(&object);

        assert_eq!(info.kind, Some(DicomKind::Image));
        assert_eq!(info.pixel_spacing, (1.0, 1.0));
        assert_eq!(info.slice_thickness, None);
        assert_eq!(info.position, Point3::origin());
        assert_eq!(info.orientation, ImageOrientation::default());
        assert_eq!(info.instance_number, 0);
        assert!(!info.has_patient_geometry);
    }

    #[test]
    fn malformed_orientation_is_replaced_by_identity() {
        let object = InMemDicomObject::from_element_iter([decimals(
            tags::IMAGE_ORIENTATION_PATIENT,
            &[1.0, 0.0, 0.0, 0.0],
        )]);

        let info = SliceInfo::from_dicom_object(&object);

        assert_eq!(info.kind, None);
        assert_eq!(info.orientation, ImageOrientation::default());
    }
}
