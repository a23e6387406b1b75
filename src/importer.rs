//! Import pipelines turning one user-selected DICOM file into stored,
//! placed scene objects.
//!
//! An import either produces every object it is responsible for or leaves
//! the sink and the frame registry untouched. Best-effort alignment never
//! fails an import: without a usable anchor, objects are placed in patient
//! space.

use crate::{
    dose::DoseGrid,
    enums::DicomKind,
    geometry::{GeometryError, PatientGeometry},
    ion_plan::IonPlan,
    metadata::{DecodeError, DicomFile, Slice, SliceInfo, classify, read_file},
    options::ImportOptions,
    output::{
        Handle, OutputAdapter, PointOutput, PointSink, SceneSink, StorageError, VolumeOutput,
        VolumeSink, WorldTransform,
    },
    rasterizer::ContourRasterizer,
    registry::{FrameAnchor, FrameRegistry},
    structure::StructureSet,
    volume_loader::{AssemblyError, VolumeLoader},
};

use log::{debug, error, info, warn};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(
        "Expected a {} file, found {}",
        .expected.label(),
        .found.as_ref().map_or("an unsupported modality", DicomKind::label)
    )]
    ClassificationMismatch {
        expected: DicomKind,
        found: Option<DicomKind>,
    },

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Ion plan contains no beams with scan spots")]
    MissingBeams,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImportError {
    /// One sentence suitable for an end user. Details go to the log.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Decode(_) => "The selected file could not be read as DICOM.",
            Self::ClassificationMismatch { .. } => {
                "The selected file is not of the expected DICOM type."
            }
            Self::Assembly(_) => "No consistent image series could be assembled.",
            Self::Geometry(_) => "Could not determine a valid patient geometry.",
            Self::Storage(_) => "The volume could not be stored in the scene.",
            Self::MissingBeams => "The plan does not contain any scanned ion beams.",
            Self::Io(_) => "The folder of the selected file could not be read.",
        }
    }
}

/// What an import produced.
#[derive(Clone, Debug, PartialEq)]
pub struct ImportReport {
    pub kind: DicomKind,
    pub handles: Vec<Handle>,
    pub frame_uid: Option<String>,
    /// Placed relative to (or registered as) a frame anchor
    pub anchored: bool,
}

/// Runs imports against a sink, sharing a frame registry across them.
pub struct Importer<S> {
    sink: S,
    registry: Arc<FrameRegistry>,
    options: ImportOptions,
}

impl<S> Importer<S>
where
    S: VolumeSink + PointSink + SceneSink,
{
    pub fn new(sink: S, registry: Arc<FrameRegistry>, options: ImportOptions) -> Self {
        Self {
            sink,
            registry,
            options,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn registry(&self) -> &Arc<FrameRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    /// Import the CT/MR series the selected slice belongs to. All slices of
    /// that series in the same folder are used.
    pub fn import_image_series(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<ImportReport, ImportError> {
        let path = path.as_ref();
        let result = self.image_series_from_file(path);
        log_failure("image series", path, result)
    }

    pub fn import_dose(&mut self, path: impl AsRef<Path>) -> Result<ImportReport, ImportError> {
        let path = path.as_ref();
        let result = read_entry(path, DicomKind::Dose)
            .and_then(|entry| {
                DoseGrid::from_dicom_object(&entry, self.options.rescale_dose)
                    .map_err(ImportError::from)
            })
            .and_then(|dose| self.import_dose_grid(dose, &object_name(path, "Dose")));
        log_failure("dose", path, result)
    }

    pub fn import_structures(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<ImportReport, ImportError> {
        let path = path.as_ref();
        let result = self.structures_from_file(path);
        log_failure("structure set", path, result)
    }

    pub fn import_ion_plan(&mut self, path: impl AsRef<Path>) -> Result<ImportReport, ImportError> {
        let path = path.as_ref();
        let result = read_entry(path, DicomKind::IonPlan).and_then(|entry| {
            let plan = IonPlan::from_dicom_object(&entry).ok_or(ImportError::MissingBeams)?;
            self.import_plan(&plan)
        });
        log_failure("ion plan", path, result)
    }

    fn image_series_from_file(&mut self, path: &Path) -> Result<ImportReport, ImportError> {
        let entry = read_entry(path, DicomKind::Image)?;
        let series_uid = SliceInfo::from_dicom_object(&entry)
            .series_uid
            .ok_or(AssemblyError::MissingSeriesUid)?;

        let dicom_objects = VolumeLoader::scan_directory(parent_directory(path), &self.options)?;
        let slices = VolumeLoader::decode_slices(&dicom_objects, &self.options, |info| {
            info.series_uid.as_deref() == Some(series_uid.as_str())
        })?;
        self.import_series_slices(slices, &series_uid)
    }

    fn structures_from_file(&mut self, path: &Path) -> Result<ImportReport, ImportError> {
        let entry = read_entry(path, DicomKind::Structure)?;
        let structure_set = StructureSet::from_dicom_object(&entry);

        let dicom_objects = VolumeLoader::scan_directory(parent_directory(path), &self.options)?;
        let reference = VolumeLoader::decode_slices(&dicom_objects, &self.options, |info| {
            structure_set.is_reference_slice(info)
        })?;
        self.import_structure_set(&structure_set, reference)
    }

    /// Assemble decoded slices, store the volume at the scene origin and
    /// register it as the anchor of its frame of reference.
    pub fn import_series_slices(
        &mut self,
        slices: Vec<Slice>,
        series_uid: &str,
    ) -> Result<ImportReport, ImportError> {
        let volume = VolumeLoader::assemble(slices, series_uid, self.options.sort_by)?;
        let geometry = PatientGeometry::from_series(&volume)?;
        let frame_uid = volume.frame_of_reference_uid().map(str::to_string);

        let output = VolumeOutput {
            name: series_uid.to_string(),
            voxels: volume.into_data(),
            spacing: *geometry.spacing(),
            transform: WorldTransform::identity(),
        };
        let handles = OutputAdapter::emit_volumes(&mut self.sink, std::slice::from_ref(&output))?;

        self.registry
            .register(FrameAnchor::from_geometry(&geometry, frame_uid.clone()));
        info!(
            "Imported series {series_uid} with dims {:?} as the anchor of frame {:?}",
            geometry.dims(),
            frame_uid
        );

        Ok(ImportReport {
            kind: DicomKind::Image,
            handles,
            frame_uid,
            anchored: true,
        })
    }

    pub fn import_dose_grid(
        &mut self,
        dose: DoseGrid,
        name: &str,
    ) -> Result<ImportReport, ImportError> {
        let geometry = dose.geometry()?;
        let frame_uid = dose.frame_of_reference_uid().map(str::to_string);
        let (transform, anchored) = self.placement(&geometry, frame_uid.as_deref());

        let output = VolumeOutput {
            name: name.to_string(),
            voxels: dose.data,
            spacing: *geometry.spacing(),
            transform,
        };
        let handles = OutputAdapter::emit_volumes(&mut self.sink, std::slice::from_ref(&output))?;
        info!("Imported dose grid {name} with dims {:?}", geometry.dims());

        Ok(ImportReport {
            kind: DicomKind::Dose,
            handles,
            frame_uid,
            anchored,
        })
    }

    /// Rasterize every ROI of `structure_set` on the grid of its reference
    /// slices, or on a grid fitted to the contours when there are none.
    pub fn import_structure_set(
        &mut self,
        structure_set: &StructureSet,
        reference: Vec<Slice>,
    ) -> Result<ImportReport, ImportError> {
        let geometry = self.structure_geometry(structure_set, reference)?;
        let masks =
            ContourRasterizer::rasterize_all(&structure_set.rois, &geometry, self.options.parallel);
        if masks.is_empty() {
            return Err(GeometryError::NoMasks.into());
        }

        let frame_uid = structure_set.frame_of_reference_uid.clone();
        let (transform, anchored) = self.placement(&geometry, frame_uid.as_deref());
        let outputs: Vec<_> = masks
            .iter()
            .map(|mask| VolumeOutput {
                name: mask.name.clone(),
                voxels: mask.to_density(),
                spacing: *geometry.spacing(),
                transform: transform.clone(),
            })
            .collect();
        let handles = OutputAdapter::emit_volumes(&mut self.sink, &outputs)?;
        info!(
            "Imported {} of {} ROI(s) on a {:?} grid",
            masks.len(),
            structure_set.rois.len(),
            geometry.dims()
        );

        Ok(ImportReport {
            kind: DicomKind::Structure,
            handles,
            frame_uid,
            anchored,
        })
    }

    /// Store one point set per beam that carries spots.
    pub fn import_plan(&mut self, plan: &IonPlan) -> Result<ImportReport, ImportError> {
        let outputs: Vec<_> = plan
            .beams
            .iter()
            .filter(|beam| {
                if beam.spots.is_empty() {
                    debug!("Beam {} has no scan spots, skipping", beam.index);
                }
                !beam.spots.is_empty()
            })
            .map(|beam| PointOutput {
                name: beam
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("Beam_{}", beam.index)),
                points: beam.to_point_set(),
                transform: beam.transform(),
            })
            .collect();
        if outputs.is_empty() {
            return Err(ImportError::MissingBeams);
        }

        let handles = OutputAdapter::emit_points(&mut self.sink, &outputs)?;
        info!(
            "Imported {} beam(s) with {} spot(s)",
            handles.len(),
            plan.spot_count()
        );

        Ok(ImportReport {
            kind: DicomKind::IonPlan,
            handles,
            frame_uid: None,
            anchored: false,
        })
    }

    fn structure_geometry(
        &self,
        structure_set: &StructureSet,
        reference: Vec<Slice>,
    ) -> Result<PatientGeometry, ImportError> {
        let series_uid = structure_set
            .referenced_series_uid
            .clone()
            .or_else(|| reference.iter().find_map(|slice| slice.info.series_uid.clone()));

        match series_uid {
            Some(series_uid) if !reference.is_empty() => {
                debug!(
                    "Using {} reference slice(s) of series {series_uid}",
                    reference.len()
                );
                let volume = VolumeLoader::assemble(reference, &series_uid, self.options.sort_by)?;
                Ok(PatientGeometry::from_series(&volume)?)
            }
            _ => {
                warn!("No reference images found, deriving the grid from the contours");
                Ok(PatientGeometry::from_contours(&structure_set.contours())?)
            }
        }
    }

    /// Placement relative to the registered anchor of `frame_uid`, or in
    /// patient space when no usable anchor exists.
    fn placement(
        &self,
        geometry: &PatientGeometry,
        frame_uid: Option<&str>,
    ) -> (WorldTransform, bool) {
        let Some(anchor) = self.registry.lookup(frame_uid) else {
            warn!("No image volume registered for frame {frame_uid:?}, placing in patient space");
            return (WorldTransform::from_geometry(geometry), false);
        };
        match anchor.relative_transform(geometry) {
            Some(transform) => (transform, true),
            None => {
                warn!("Anchor of frame {frame_uid:?} is degenerate, placing in patient space");
                (WorldTransform::from_geometry(geometry), false)
            }
        }
    }
}

/// Decode the user-selected file and check its modality.
fn read_entry(path: &Path, expected: DicomKind) -> Result<DicomFile, ImportError> {
    let entry = read_file(path)?;
    let found = classify(&entry);
    if found != Some(expected) {
        return Err(ImportError::ClassificationMismatch { expected, found });
    }
    Ok(entry)
}

fn parent_directory(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn object_name(path: &Path, fallback: &str) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

fn log_failure<T>(
    what: &str,
    path: &Path,
    result: Result<T, ImportError>,
) -> Result<T, ImportError> {
    result.inspect_err(|err| error!("Import of {what} from {} failed: {err:?}", path.display()))
}
