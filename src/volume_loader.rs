use crate::{
    enums::{DicomKind, SortBy},
    geometry::{EPSILON, PlaneAxes, median},
    metadata::{DecodeError, DicomFile, Slice, SliceInfo, read_file},
    options::ImportOptions,
    volume::SeriesVolume,
};

use log::{debug, error, info, warn};
use ndarray::{Array3, s};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("No image slices found for series {0}")]
    NoMatchingSlices(String),

    #[error("Selected image has no SeriesInstanceUID")]
    MissingSeriesUid,

    #[error(
        "Inconsistent image dimensions: expected {expected:?}, slice {instance_number} is {found:?}"
    )]
    InconsistentDimensions {
        expected: (usize, usize),
        found: (usize, usize),
        instance_number: i32,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Read every DICOM file of a directory whose extension matches the
    /// options. Files that fail to parse are skipped.
    pub fn scan_directory(
        path: impl AsRef<Path>,
        options: &ImportOptions,
    ) -> Result<Vec<(PathBuf, DicomFile)>, std::io::Error> {
        let mut paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && options.accepts_path(path))
            .collect();
        paths.sort();

        let read = |path: &PathBuf| match read_file(path) {
            Ok(dicom_object) => Some((path.clone(), dicom_object)),
            Err(err) => {
                warn!("Skipping {}: {err}", path.display());
                None
            }
        };
        let objects: Vec<_> = if options.parallel {
            paths.par_iter().filter_map(read).collect()
        } else {
            paths.iter().filter_map(read).collect()
        };

        info!(
            "Scanned {}: {} readable DICOM file(s)",
            path.as_ref().display(),
            objects.len()
        );
        Ok(objects)
    }

    /// Decode the image slices among `dicom_objects` that satisfy `keep`.
    ///
    /// # Errors
    ///
    /// Returns error if a kept slice has pixel data that cannot be decoded.
    pub fn decode_slices<F>(
        dicom_objects: &[(PathBuf, DicomFile)],
        options: &ImportOptions,
        keep: F,
    ) -> Result<Vec<Slice>, DecodeError>
    where
        F: Fn(&SliceInfo) -> bool + Sync,
    {
        let decode = |(path, dicom_object): &(PathBuf, DicomFile)| {
            let info = SliceInfo::from_dicom_object(dicom_object);
            if info.kind != Some(DicomKind::Image) || !keep(&info) {
                return None;
            }
            let slice = Slice::decode(dicom_object, info)
                .inspect_err(|err| error!("Failed to decode {}: {err}", path.display()));
            Some(slice)
        };

        if options.parallel {
            dicom_objects.par_iter().filter_map(decode).collect()
        } else {
            dicom_objects.iter().filter_map(decode).collect()
        }
    }

    /// Load one image series from a directory of DICOM files.
    pub fn load_series_from_directory(
        directory: impl AsRef<Path>,
        series_uid: &str,
        options: &ImportOptions,
    ) -> Result<SeriesVolume, AssemblyError> {
        let dicom_objects = Self::scan_directory(directory, options)?;
        let slices = Self::decode_slices(&dicom_objects, options, |info| {
            info.series_uid.as_deref() == Some(series_uid)
        })?;
        Self::assemble(slices, series_uid, options.sort_by)
    }

    /// Filter, sort and stack image slices into a volume.
    ///
    /// After sorting, the slice axis is reversed: array index 0 holds the last
    /// slice of the sorted order.
    ///
    /// # Errors
    ///
    /// Returns error if no image slice carries `series_uid` or the slice
    /// dimensions differ.
    pub fn assemble(
        slices: Vec<Slice>,
        series_uid: &str,
        sort_by: SortBy,
    ) -> Result<SeriesVolume, AssemblyError> {
        let mut slices: Vec<_> = slices
            .into_iter()
            .filter(|slice| {
                slice.info.kind == Some(DicomKind::Image)
                    && slice.info.series_uid.as_deref() == Some(series_uid)
            })
            .collect();

        if slices.is_empty() {
            return Err(AssemblyError::NoMatchingSlices(series_uid.to_string()));
        }

        Self::sort_slices(&mut slices, sort_by);
        slices.reverse();

        Self::validate_dimensions(&slices)?;

        let slice_spacing = Self::inter_slice_spacing(&slices);
        let volume_array = Self::build_volume_array(&slices);
        let infos = slices.into_iter().map(|slice| slice.info).collect();

        debug!(
            "Assembled series {series_uid}: dim {:?}, slice spacing {slice_spacing} mm",
            volume_array.dim()
        );
        Ok(SeriesVolume::new(
            series_uid.to_string(),
            volume_array,
            slice_spacing,
            infos,
        ))
    }

    fn sort_slices(slices: &mut [Slice], sort_by: SortBy) {
        match sort_by {
            SortBy::InstanceNumber => slices.sort_by_key(|slice| slice.info.instance_number),
            SortBy::ImagePositionPatient => {
                let normal = PlaneAxes::from_orientation(&slices[0].info.orientation).normal;
                slices.sort_by(|a, b| {
                    a.info
                        .position
                        .coords
                        .dot(&normal)
                        .total_cmp(&b.info.position.coords.dot(&normal))
                });
            }
            SortBy::None => {}
        }
    }

    fn validate_dimensions(slices: &[Slice]) -> Result<(), AssemblyError> {
        let expected = slices[0].dim();
        match slices.iter().find(|slice| slice.dim() != expected) {
            Some(slice) => Err(AssemblyError::InconsistentDimensions {
                expected,
                found: slice.dim(),
                instance_number: slice.info.instance_number,
            }),
            None => Ok(()),
        }
    }

    /// Median distance between adjacent slice planes along the normal,
    /// falling back to SliceThickness, then 1 mm.
    fn inter_slice_spacing(slices: &[Slice]) -> f64 {
        let normal = PlaneAxes::from_orientation(&slices[0].info.orientation).normal;
        let mut projections: Vec<f64> = slices
            .iter()
            .map(|slice| slice.info.position.coords.dot(&normal))
            .collect();
        projections.sort_by(f64::total_cmp);

        let deltas: Vec<f64> = projections
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).abs())
            .filter(|delta| *delta > EPSILON)
            .collect();

        let spacing = median(&deltas)
            .or(slices[0].info.slice_thickness)
            .unwrap_or(1.0);
        if spacing.is_finite() && spacing > 0.0 {
            spacing
        } else {
            1.0
        }
    }

    fn build_volume_array(slices: &[Slice]) -> Array3<f32> {
        let (height, width) = slices[0].dim();
        let depth = slices.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.pixels);
        }

        volume
    }
}
