//! # DICOM-RT scene library
//!
//! This crate turns radiotherapy DICOM data into geometry ready to be placed
//! in a 3D scene. It builds on the dicom-rs ecosystem for decoding and
//! handles:
//!  - CT/MR image series, assembled into a volume with its patient-space
//!    geometry
//!  - RT Dose grids
//!  - RT Structure Sets, rasterized into one voxel mask per ROI
//!  - RT Ion plans, reduced to pencil-beam spot point sets
//!
//! Image series are assembled from every DICOM file in the folder of the
//! selected slice. If the environment supports it, files are decoded in
//! parallel using rayon. Slices are sorted by InstanceNumber and the slice
//! axis is then flipped, so array index 0 holds the highest instance number.
//!
//! Every imported image volume is placed at the scene origin and registered
//! under its Frame of Reference UID. Dose grids and structure masks sharing
//! that frame are placed relative to it; otherwise they are placed in
//! patient space, converted to metres.
//!
//! Storage and placement go through the [`output::VolumeSink`],
//! [`output::PointSink`] and [`output::SceneSink`] traits.
//! [`output::MemorySink`] keeps everything in memory.
//!
//! Index vectors are `[slice, row, col]` throughout.
//!
//! # Examples
//!
//! ## Importing a CT series and its structures
//!
//! ```no_run
//! # use dicom_rt_scene::{FrameRegistry, ImportOptions, Importer, MemorySink};
//! # use std::sync::Arc;
//! let mut importer = Importer::new(
//!     MemorySink::new(),
//!     Arc::new(FrameRegistry::new()),
//!     ImportOptions::default(),
//! );
//! importer
//!     .import_image_series("patient/CT.1.dcm")
//!     .expect("should have imported the CT series");
//! let report = importer
//!     .import_structures("patient/RS.dcm")
//!     .expect("should have rasterized the structures");
//! assert!(report.anchored);
//! ```

pub mod dose;
pub mod enums;
pub mod geometry;
pub mod importer;
pub mod ion_plan;
pub mod metadata;
pub mod options;
pub mod output;
pub mod rasterizer;
pub mod registry;
pub mod structure;
pub mod volume;
pub mod volume_loader;

pub use enums::{DicomKind, SortBy};
pub use geometry::PatientGeometry;
pub use importer::{ImportError, ImportReport, Importer};
pub use options::ImportOptions;
pub use output::{MemorySink, WorldTransform};
pub use registry::{FrameAnchor, FrameRegistry};
pub use volume_loader::VolumeLoader;
