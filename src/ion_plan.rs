use crate::{
    metadata::{float_attr, items, multi_float_attr, string_attr},
    output::{PointSet, WorldTransform},
};

use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use nalgebra::{Point3, Rotation3, Vector3};

/// One pencil-beam scanning spot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Spot {
    /// Position in the beam's eye view plane, metres
    pub x: f64,
    pub y: f64,
    /// Nominal beam energy in MeV
    pub energy: f64,
    pub weight: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IonBeam {
    pub index: usize,
    pub name: Option<String>,
    /// Gantry angle of the first control point, degrees
    pub gantry_angle: f64,
    /// Isocenter of the first control point, mm
    pub isocenter: Point3<f64>,
    pub spots: Vec<Spot>,
}

impl IonBeam {
    fn from_item(index: usize, beam: &InMemDicomObject) -> Self {
        let control_points = items(beam, tags::ION_CONTROL_POINT_SEQUENCE);

        // Spot layers are encoded as pairs of control points; the second of
        // each pair repeats the map with zero cumulative weight.
        let spots = control_points
            .iter()
            .step_by(2)
            .flat_map(|control_point| {
                let positions = multi_float_attr(control_point, tags::SCAN_SPOT_POSITION_MAP)
                    .unwrap_or_default();
                let weights = multi_float_attr(control_point, tags::SCAN_SPOT_METERSET_WEIGHTS)
                    .unwrap_or_default();
                let energy = float_attr(control_point, tags::NOMINAL_BEAM_ENERGY).unwrap_or(0.0);

                positions
                    .chunks_exact(2)
                    .enumerate()
                    .map(|(i, xy)| Spot {
                        x: xy[0] / 1000.0,
                        y: xy[1] / 1000.0,
                        energy,
                        weight: weights.get(i).copied().unwrap_or(0.0),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let first = control_points.first();
        let isocenter = first
            .and_then(|cp| multi_float_attr(cp, tags::ISOCENTER_POSITION))
            .filter(|values| values.len() == 3)
            .map(|values| Point3::new(values[0], values[1], values[2]))
            .unwrap_or_else(Point3::origin);

        Self {
            index,
            name: string_attr(beam, tags::BEAM_NAME),
            gantry_angle: first
                .and_then(|cp| float_attr(cp, tags::GANTRY_ANGLE))
                .unwrap_or(0.0),
            isocenter,
            spots,
        }
    }

    /// Spots as points in the beam plane with `spot_x`, `spot_y`,
    /// `spot_E` and `spot_weight` attributes.
    pub fn to_point_set(&self) -> PointSet {
        let column = |f: fn(&Spot) -> f64| self.spots.iter().map(f).collect::<Vec<_>>();
        PointSet {
            positions: self
                .spots
                .iter()
                .map(|spot| Point3::new(spot.x, spot.y, 0.0))
                .collect(),
            attributes: vec![
                ("spot_x".to_string(), column(|s| s.x)),
                ("spot_y".to_string(), column(|s| s.y)),
                ("spot_E".to_string(), column(|s| s.energy)),
                ("spot_weight".to_string(), column(|s| s.weight)),
            ],
        }
    }

    /// Isocenter translation (metres) with the gantry rotation about the
    /// scene Y axis.
    pub fn transform(&self) -> WorldTransform {
        let rotation =
            Rotation3::from_axis_angle(&Vector3::y_axis(), self.gantry_angle.to_radians());
        WorldTransform::new(
            Point3::from(self.isocenter.coords / 1000.0),
            rotation.into_inner(),
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IonPlan {
    pub beams: Vec<IonBeam>,
}

impl IonPlan {
    /// Returns `None` when the object has no IonBeamSequence.
    pub fn from_dicom_object(dicom_object: &InMemDicomObject) -> Option<Self> {
        let beams = dicom_object
            .element(tags::ION_BEAM_SEQUENCE)
            .ok()?
            .items()?
            .iter()
            .enumerate()
            .map(|(index, beam)| IonBeam::from_item(index, beam))
            .collect();
        Some(Self { beams })
    }

    pub fn spot_count(&self) -> usize {
        self.beams.iter().map(|beam| beam.spots.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::{decimals, element};
    use approx::assert_relative_eq;
    use dicom::core::{DataElement, VR, value::DataSetSequence};

    fn control_point(positions: &[f64], weights: &[f64], energy: f64) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            decimals(tags::SCAN_SPOT_POSITION_MAP, positions),
            decimals(tags::SCAN_SPOT_METERSET_WEIGHTS, weights),
            decimals(tags::NOMINAL_BEAM_ENERGY, &[energy]),
            decimals(tags::GANTRY_ANGLE, &[90.0]),
            decimals(tags::ISOCENTER_POSITION, &[10.0, 20.0, 30.0]),
        ])
    }

    fn plan() -> InMemDicomObject {
        let beam = InMemDicomObject::from_element_iter([
            element(tags::BEAM_NAME, VR::LO, "G90"),
            DataElement::new(
                tags::ION_CONTROL_POINT_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![
                    control_point(&[0.0, 10.0, 20.0, -10.0], &[1.5, 2.5], 150.0),
                    control_point(&[0.0, 10.0, 20.0, -10.0], &[0.0, 0.0], 150.0),
                    control_point(&[5.0, 5.0], &[], 120.0),
                    control_point(&[5.0, 5.0], &[0.0], 120.0),
                ]),
            ),
        ]);
        let empty_beam =
            InMemDicomObject::from_element_iter([element(tags::BEAM_NAME, VR::LO, "empty")]);

        InMemDicomObject::from_element_iter([
            element(tags::MODALITY, VR::CS, "RTION"),
            DataElement::new(
                tags::ION_BEAM_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![beam, empty_beam]),
            ),
        ])
    }

    #[test]
    fn spots_are_read_from_every_other_control_point() {
        let plan = IonPlan::from_dicom_object(&plan()).unwrap();

        assert_eq!(plan.beams.len(), 2);
        assert_eq!(plan.spot_count(), 3);
        let beam = &plan.beams[0];
        assert_eq!(beam.name.as_deref(), Some("G90"));
        assert_eq!(
            beam.spots[1],
            Spot {
                x: 0.02,
                y: -0.01,
                energy: 150.0,
                weight: 2.5
            }
        );
        assert_eq!(beam.spots[2].weight, 0.0);
        assert_eq!(beam.spots[2].energy, 120.0);
        assert!(plan.beams[1].spots.is_empty());
    }

    #[test]
    fn beam_transform_applies_gantry_and_isocenter() {
        let plan = IonPlan::from_dicom_object(&plan()).unwrap();

        let transform = plan.beams[0].transform();

        assert_relative_eq!(transform.translation, Point3::new(0.01, 0.02, 0.03));
        assert_relative_eq!(
            transform.rotation * Vector3::x(),
            Vector3::new(0.0, 0.0, -1.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn point_set_carries_spot_attributes() {
        let plan = IonPlan::from_dicom_object(&plan()).unwrap();

        let points = plan.beams[0].to_point_set();

        assert_eq!(points.len(), 3);
        assert_eq!(points.attribute("spot_weight"), Some(&[1.5, 2.5, 0.0][..]));
        assert_eq!(points.attribute("spot_E").map(|e| e[2]), Some(120.0));
        assert!(points.attribute("spot_energy").is_none());
    }

    #[test]
    fn plan_without_beams_is_rejected() {
        let object =
            InMemDicomObject::from_element_iter([element(tags::MODALITY, VR::CS, "RTION")]);
        assert!(IonPlan::from_dicom_object(&object).is_none());
    }
}
