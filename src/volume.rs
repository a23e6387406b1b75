use crate::metadata::SliceInfo;

use ndarray::{Array3, ArrayView2, s};

/// Stack of slices from one series, slice-major, in array order.
#[derive(Clone, Debug)]
pub struct SeriesVolume {
    series_uid: String,
    data: Array3<f32>,
    slice_spacing: f64,
    slices: Vec<SliceInfo>,
}

impl SeriesVolume {
    pub(crate) fn new(
        series_uid: String,
        data: Array3<f32>,
        slice_spacing: f64,
        slices: Vec<SliceInfo>,
    ) -> Self {
        debug_assert_eq!(data.dim().0, slices.len());
        Self {
            series_uid,
            data,
            slice_spacing,
            slices,
        }
    }

    pub fn series_uid(&self) -> &str {
        &self.series_uid
    }

    /// Get the dimensions of the volume (slices, rows, columns)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    /// Distance between adjacent slices in mm, always positive.
    pub fn slice_spacing(&self) -> f64 {
        self.slice_spacing
    }

    /// Slice attributes, index `i` describing `data[i, .., ..]`.
    pub fn slices(&self) -> &[SliceInfo] {
        &self.slices
    }

    pub fn frame_of_reference_uid(&self) -> Option<&str> {
        self.slices
            .iter()
            .find_map(|slice| slice.frame_of_reference_uid.as_deref())
    }

    pub fn get_slice(&self, index: usize) -> Option<ArrayView2<'_, f32>> {
        (index < self.slices.len()).then(|| self.data.slice(s![index, .., ..]))
    }
}
