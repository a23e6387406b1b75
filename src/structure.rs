use crate::{
    enums::DicomKind,
    metadata::{SliceInfo, int_attr, items, multi_float_attr, string_attr},
};

use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use log::debug;
use nalgebra::{Point3, Vector3};
use std::collections::{HashMap, HashSet};

/// A closed planar polygon in patient space (mm).
#[derive(Clone, Debug, PartialEq)]
pub struct ContourPolygon {
    points: Vec<Point3<f64>>,
}

impl ContourPolygon {
    pub const MIN_POINTS: usize = 3;

    /// Returns `None` for polygons with fewer than three points or with
    /// non-finite coordinates.
    pub fn new(points: Vec<Point3<f64>>) -> Option<Self> {
        if points.len() < Self::MIN_POINTS
            || points.iter().any(|p| !p.coords.iter().all(|v| v.is_finite()))
        {
            return None;
        }
        Some(Self { points })
    }

    /// Build a polygon from flattened `x, y, z` triplets as stored in
    /// ContourData. Malformed encodings (length not divisible by three) are
    /// rejected.
    pub fn from_flat(data: &[f64]) -> Option<Self> {
        if data.len() % 3 != 0 {
            return None;
        }
        let points = data
            .chunks_exact(3)
            .map(|xyz| Point3::new(xyz[0], xyz[1], xyz[2]))
            .collect();
        Self::new(points)
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Edge vectors, including the closing edge back to the first point.
    pub fn edges(&self) -> impl Iterator<Item = Vector3<f64>> + '_ {
        self.points
            .iter()
            .zip(self.points.iter().cycle().skip(1))
            .map(|(from, to)| to - from)
    }

    /// Mean of the points projected on `axis`.
    pub fn mean_projection(&self, axis: &Vector3<f64>) -> f64 {
        self.points.iter().map(|p| p.coords.dot(axis)).sum::<f64>() / self.points.len() as f64
    }
}

/// One region of interest with its valid contours.
#[derive(Clone, Debug, PartialEq)]
pub struct Roi {
    pub number: i32,
    pub name: String,
    pub contours: Vec<ContourPolygon>,
}

/// Decoded RT Structure Set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructureSet {
    pub frame_of_reference_uid: Option<String>,
    /// First SeriesInstanceUID listed under RTReferencedSeriesSequence
    pub referenced_series_uid: Option<String>,
    /// SOP Instance UIDs listed under ContourImageSequence
    pub referenced_sop_uids: HashSet<String>,
    pub rois: Vec<Roi>,
}

impl StructureSet {
    pub fn from_dicom_object(dicom_object: &InMemDicomObject) -> Self {
        let names: HashMap<i32, String> = items(dicom_object, tags::STRUCTURE_SET_ROI_SEQUENCE)
            .iter()
            .filter_map(|roi| {
                let number = int_attr(roi, tags::ROI_NUMBER)?;
                let name =
                    string_attr(roi, tags::ROI_NAME).unwrap_or_else(|| default_roi_name(number));
                Some((number, name))
            })
            .collect();

        let rois = items(dicom_object, tags::ROI_CONTOUR_SEQUENCE)
            .iter()
            .map(|roi_contour| {
                let number = int_attr(roi_contour, tags::REFERENCED_ROI_NUMBER).unwrap_or(-1);
                let name = names
                    .get(&number)
                    .cloned()
                    .unwrap_or_else(|| default_roi_name(number));
                let raw = items(roi_contour, tags::CONTOUR_SEQUENCE);
                let contours: Vec<_> = raw
                    .iter()
                    .filter_map(|contour| multi_float_attr(contour, tags::CONTOUR_DATA))
                    .filter_map(|data| ContourPolygon::from_flat(&data))
                    .collect();
                if contours.len() < raw.len() {
                    debug!(
                        "ROI {name}: skipped {} malformed contour(s)",
                        raw.len() - contours.len()
                    );
                }
                Roi {
                    number,
                    name,
                    contours,
                }
            })
            .collect();

        let (referenced_series_uid, referenced_sop_uids) = Self::references(dicom_object);

        Self {
            frame_of_reference_uid: Self::frame_uid(dicom_object),
            referenced_series_uid,
            referenced_sop_uids,
            rois,
        }
    }

    /// Every valid contour of every ROI.
    pub fn contours(&self) -> Vec<&ContourPolygon> {
        self.rois.iter().flat_map(|roi| roi.contours.iter()).collect()
    }

    /// Whether an image slice can serve as reference geometry for this set.
    pub fn is_reference_slice(&self, info: &SliceInfo) -> bool {
        if info.kind != Some(DicomKind::Image) || !info.has_patient_geometry {
            return false;
        }
        if let Some(series_uid) = &self.referenced_series_uid {
            if info.series_uid.as_ref() != Some(series_uid) {
                return false;
            }
        }
        match &info.sop_instance_uid {
            Some(sop_uid) if !self.referenced_sop_uids.is_empty() => {
                self.referenced_sop_uids.contains(sop_uid)
            }
            _ => true,
        }
    }

    fn frame_uid(dicom_object: &InMemDicomObject) -> Option<String> {
        string_attr(dicom_object, tags::FRAME_OF_REFERENCE_UID).or_else(|| {
            items(dicom_object, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE)
                .first()
                .and_then(|frame_ref| string_attr(frame_ref, tags::FRAME_OF_REFERENCE_UID))
        })
    }

    fn references(dicom_object: &InMemDicomObject) -> (Option<String>, HashSet<String>) {
        let mut series_uid = None;
        let mut sop_uids = HashSet::new();

        let series_refs = items(dicom_object, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE)
            .iter()
            .flat_map(|frame_ref| items(frame_ref, tags::RT_REFERENCED_STUDY_SEQUENCE))
            .flat_map(|study_ref| items(study_ref, tags::RT_REFERENCED_SERIES_SEQUENCE));

        for series_ref in series_refs {
            if series_uid.is_none() {
                series_uid = string_attr(series_ref, tags::SERIES_INSTANCE_UID);
            }
            sop_uids.extend(
                items(series_ref, tags::CONTOUR_IMAGE_SEQUENCE)
                    .iter()
                    .filter_map(|image| string_attr(image, tags::REFERENCED_SOP_INSTANCE_UID)),
            );
        }

        (series_uid, sop_uids)
    }
}

fn default_roi_name(number: i32) -> String {
    format!("ROI_{number}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::{decimals, element};
    use dicom::core::{DataElement, VR, value::DataSetSequence};

    fn sequence(
        tag: dicom::core::Tag,
        items: Vec<InMemDicomObject>,
    ) -> dicom::object::mem::InMemElement {
        DataElement::new(tag, VR::SQ, DataSetSequence::from(items))
    }

    fn contour(data: &[f64]) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([decimals(tags::CONTOUR_DATA, data)])
    }

    fn structure_set() -> InMemDicomObject {
        let series_ref = InMemDicomObject::from_element_iter([
            element(tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.4"),
            sequence(
                tags::CONTOUR_IMAGE_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([element(
                    tags::REFERENCED_SOP_INSTANCE_UID,
                    VR::UI,
                    "1.2.3.4.1",
                )])],
            ),
        ]);
        let study_ref = InMemDicomObject::from_element_iter([sequence(
            tags::RT_REFERENCED_SERIES_SEQUENCE,
            vec![series_ref],
        )]);
        let frame_ref = InMemDicomObject::from_element_iter([
            element(tags::FRAME_OF_REFERENCE_UID, VR::UI, "9.8.7"),
            sequence(tags::RT_REFERENCED_STUDY_SEQUENCE, vec![study_ref]),
        ]);

        InMemDicomObject::from_element_iter([
            element(tags::MODALITY, VR::CS, "RTSTRUCT"),
            sequence(tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE, vec![frame_ref]),
            sequence(
                tags::STRUCTURE_SET_ROI_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([
                    element(tags::ROI_NUMBER, VR::IS, "1"),
                    element(tags::ROI_NAME, VR::LO, "PTV"),
                ])],
            ),
            sequence(
                tags::ROI_CONTOUR_SEQUENCE,
                vec![
                    InMemDicomObject::from_element_iter([
                        element(tags::REFERENCED_ROI_NUMBER, VR::IS, "1"),
                        sequence(
                            tags::CONTOUR_SEQUENCE,
                            vec![
                                contour(&[0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 4.0, 4.0, 0.0]),
                                contour(&[0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 4.0, 4.0]),
                            ],
                        ),
                    ]),
                    InMemDicomObject::from_element_iter([
                        element(tags::REFERENCED_ROI_NUMBER, VR::IS, "2"),
                        sequence(
                            tags::CONTOUR_SEQUENCE,
                            vec![contour(&[0.0, 0.0, 0.0, 1.0, 1.0, 0.0])],
                        ),
                    ]),
                ],
            ),
        ])
    }

    #[test]
    fn parses_rois_and_references() {
        let set = StructureSet::from_dicom_object(&structure_set());

        assert_eq!(set.frame_of_reference_uid.as_deref(), Some("9.8.7"));
        assert_eq!(set.referenced_series_uid.as_deref(), Some("1.2.3.4"));
        assert!(set.referenced_sop_uids.contains("1.2.3.4.1"));
        assert_eq!(set.rois.len(), 2);
        assert_eq!(set.rois[0].name, "PTV");
        assert_eq!(set.rois[0].contours.len(), 1);
        assert_eq!(set.rois[1].name, "ROI_2");
        assert!(set.rois[1].contours.is_empty());
        assert_eq!(set.contours().len(), 1);
    }

    #[test]
    fn flat_contour_data_must_hold_three_points() {
        assert!(ContourPolygon::from_flat(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0]).is_none());
        assert!(ContourPolygon::from_flat(&[0.0; 10]).is_none());
        let triangle = ContourPolygon::from_flat(&[0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        assert_eq!(triangle.map(|t| t.len()), Some(3));
    }

    #[test]
    fn edges_close_the_polygon() {
        let triangle =
            ContourPolygon::from_flat(&[0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0, 0.0]).unwrap();
        let edges: Vec<_> = triangle.edges().collect();
        assert_eq!(edges.len(), 3);
        assert_eq!(edges[2], Vector3::new(0.0, -2.0, 0.0));
    }

    #[test]
    fn reference_slices_follow_listed_instances() {
        let set = StructureSet::from_dicom_object(&structure_set());
        let mut info = SliceInfo {
            kind: Some(DicomKind::Image),
            series_uid: Some("1.2.3.4".to_string()),
            sop_instance_uid: Some("1.2.3.4.1".to_string()),
            has_patient_geometry: true,
            ..SliceInfo::default()
        };
        assert!(set.is_reference_slice(&info));

        info.sop_instance_uid = Some("1.2.3.4.2".to_string());
        assert!(!set.is_reference_slice(&info));

        info.sop_instance_uid = Some("1.2.3.4.1".to_string());
        info.series_uid = Some("5.6".to_string());
        assert!(!set.is_reference_slice(&info));

        info.series_uid = Some("1.2.3.4".to_string());
        info.has_patient_geometry = false;
        assert!(!set.is_reference_slice(&info));
    }
}
