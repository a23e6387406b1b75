use crate::enums::SortBy;

use std::path::Path;

/// Settings shared by every import of a session.
#[derive(Clone, Debug, PartialEq)]
pub struct ImportOptions {
    /// File extensions considered during directory scans, compared
    /// case-insensitively. An empty list accepts every file.
    pub extensions: Vec<String>,
    pub sort_by: SortBy,
    /// Decode files in parallel using rayon
    pub parallel: bool,
    /// Multiply RT Dose samples by DoseGridScaling
    pub rescale_dose: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            extensions: vec!["dcm".to_string()],
            sort_by: SortBy::default(),
            parallel: true,
            rescale_dose: true,
        }
    }
}

impl ImportOptions {
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sort_by(mut self, sort_by: SortBy) -> Self {
        self.sort_by = sort_by;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_rescale_dose(mut self, rescale_dose: bool) -> Self {
        self.rescale_dose = rescale_dose;
        self
    }

    pub fn accepts_path(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|accepted| ext.eq_ignore_ascii_case(accepted))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter_is_case_insensitive() {
        let options = ImportOptions::default();
        assert!(options.accepts_path(Path::new("dir/CT.1.DCM")));
        assert!(!options.accepts_path(Path::new("dir/notes.txt")));
        assert!(!options.accepts_path(Path::new("dir/DICOMDIR")));
    }

    #[test]
    fn empty_extension_list_accepts_everything() {
        let options = ImportOptions::default().with_extensions(Vec::<String>::new());
        assert!(options.accepts_path(Path::new("dir/DICOMDIR")));
    }
}
