/// Kind of DICOM object, derived from the Modality attribute alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DicomKind {
    /// CT or MR image slice
    Image,
    /// RT Dose grid
    Dose,
    /// RT Structure Set
    Structure,
    /// RT Ion (proton) plan
    IonPlan,
}

impl DicomKind {
    /// Classify a Modality value. Matching is case-insensitive and ignores
    /// surrounding padding; unknown modalities are not an error.
    pub fn from_modality(modality: &str) -> Option<Self> {
        let modality = modality.trim().to_ascii_uppercase();
        match modality.as_str() {
            "CT" | "MR" => Some(Self::Image),
            "RTDOSE" => Some(Self::Dose),
            "RTSTRUCT" => Some(Self::Structure),
            "RTION" | "RTIONPLAN" | "ION" => Some(Self::IonPlan),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Image => "CT/MR image",
            Self::Dose => "RT Dose",
            Self::Structure => "RT Structure Set",
            Self::IonPlan => "RT Ion plan",
        }
    }
}

/// Ordering applied to image slices before the slice axis is flipped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    InstanceNumber,
    /// Ascending projection of ImagePositionPatient on the slice normal
    ImagePositionPatient,
    /// Keep encounter order
    None,
}

#[cfg(test)]
mod tests {
    use super::DicomKind;

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(DicomKind::from_modality("ct"), Some(DicomKind::Image));
        assert_eq!(DicomKind::from_modality("MR "), Some(DicomKind::Image));
        assert_eq!(DicomKind::from_modality("RTDose"), Some(DicomKind::Dose));
        assert_eq!(
            DicomKind::from_modality("rtstruct"),
            Some(DicomKind::Structure)
        );
        assert_eq!(DicomKind::from_modality("RTIon"), Some(DicomKind::IonPlan));
    }

    #[test]
    fn unknown_modality_is_unclassified() {
        assert_eq!(DicomKind::from_modality("PT"), None);
        assert_eq!(DicomKind::from_modality(""), None);
    }
}
