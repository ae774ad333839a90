//! Frame loaders for whitespace-delimited line records.
//!
//! Fields are separated by any run of spaces or tabs.
//!
//! Each frame file holds one observed line segment per row, without a header:
//!
//! | column | content                                             |
//! |--------|-----------------------------------------------------|
//! | 0      | path of the virtual camera image for the line       |
//! | 1..=14 | start, end, start normal, end normal, two open flags |
//! | 15     | instance label (frame local)                        |
//! | 16     | reserved, ignored                                   |
//! | 17     | semantic class id                                   |
//!
//! A file without data rows is a valid, empty frame.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use log::info;
use rayon::prelude::*;
use thiserror::Error;

/// Number of geometry values stored per line in a frame file.
pub const GEOMETRY_WIDTH: usize = 14;

/// Number of geometry values per line once the length column is appended.
pub const FEATURE_WIDTH: usize = GEOMETRY_WIDTH + 1;

/// Start point columns.
pub const START: Range<usize> = 0..3;
/// End point columns.
pub const END: Range<usize> = 3..6;
/// Start normal columns.
pub const START_NORMAL: Range<usize> = 6..9;
/// End normal columns.
pub const END_NORMAL: Range<usize> = 9..12;
/// Openness flag of the start point.
pub const OPEN_START: usize = 12;
/// Openness flag of the end point.
pub const OPEN_END: usize = 13;
/// Segment length, present after `add_length`.
pub const LENGTH: usize = 14;

const IMAGE_COLUMN: usize = 0;
const GEOMETRY_COLUMNS: Range<usize> = 1..1 + GEOMETRY_WIDTH;
const LABEL_COLUMN: usize = 15;
const CLASS_COLUMN: usize = 17;
const MIN_COLUMNS: usize = CLASS_COLUMN + 1;

/// Errors that can occur while loading frames.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("{path}, row {row}: expected at least {expected} columns, found {found}")]
    MissingColumns {
        path: PathBuf,
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("{path}, row {row}, column {column}: cannot parse '{value}'")]
    Parse {
        path: PathBuf,
        row: usize,
        column: usize,
        value: String,
    },
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Row-major matrix of line geometries with a fixed row width.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryMatrix {
    data: Vec<f64>,
    width: usize,
}

impl GeometryMatrix {
    /// Creates an empty matrix with the given row width.
    pub fn new(width: usize) -> Self {
        Self {
            data: Vec::new(),
            width,
        }
    }

    /// Creates an empty matrix with room for `rows` rows.
    pub fn with_capacity(rows: usize, width: usize) -> Self {
        Self {
            data: Vec::with_capacity(rows * width),
            width,
        }
    }

    /// Creates a zero-filled matrix.
    pub fn zeros(rows: usize, width: usize) -> Self {
        Self {
            data: vec![0.0; rows * width],
            width,
        }
    }

    /// Wraps row-major data; `None` if the length is not a multiple of `width`.
    pub fn from_row_major(data: Vec<f64>, width: usize) -> Option<Self> {
        if width == 0 || data.len() % width != 0 {
            return None;
        }
        Some(Self { data, width })
    }

    /// Builds a matrix from equally sized rows.
    pub fn from_rows<const W: usize>(rows: &[[f64; W]]) -> Self {
        let mut matrix = Self::with_capacity(rows.len(), W);
        for row in rows {
            matrix.push_row(row);
        }
        matrix
    }

    /// Appends a row. Panics if the row width does not match.
    pub fn push_row(&mut self, row: &[f64]) {
        assert_eq!(row.len(), self.width, "row width mismatch");
        self.data.extend_from_slice(row);
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.width..(index + 1) * self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, index: usize) -> &mut [f64] {
        &mut self.data[index * self.width..(index + 1) * self.width]
    }

    #[inline]
    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.data[row * self.width + column]
    }

    pub fn iter_rows(&self) -> std::slice::ChunksExact<'_, f64> {
        self.data.chunks_exact(self.width.max(1))
    }

    pub fn iter_rows_mut(&mut self) -> std::slice::ChunksExactMut<'_, f64> {
        self.data.chunks_exact_mut(self.width.max(1))
    }

    /// Row-major view of all values.
    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// New matrix holding the given rows in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut out = Self::with_capacity(indices.len(), self.width);
        for &index in indices {
            out.data.extend_from_slice(self.row(index));
        }
        out
    }
}

/// One scene capture: the line records of a single frame file.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Source file path.
    pub path: PathBuf,
    /// Geometry rows, `GEOMETRY_WIDTH` wide.
    pub geometries: GeometryMatrix,
    /// Instance label of each line.
    pub labels: Vec<i64>,
    /// Semantic class id of each line.
    pub class_ids: Vec<i64>,
    /// Virtual camera image of each line.
    pub image_paths: Vec<PathBuf>,
}

impl Frame {
    /// A frame without lines.
    pub fn empty<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            geometries: GeometryMatrix::new(GEOMETRY_WIDTH),
            labels: Vec::new(),
            class_ids: Vec::new(),
            image_paths: Vec::new(),
        }
    }

    /// Number of lines in the frame.
    #[inline]
    pub fn line_count(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

fn parse_float(path: &Path, row: usize, column: usize, value: &str) -> Result<f64> {
    value.trim().parse::<f64>().map_err(|_| LoaderError::Parse {
        path: path.to_path_buf(),
        row,
        column,
        value: value.to_string(),
    })
}

/// Labels and class ids are written either as integers or as integral floats.
fn parse_integer(path: &Path, row: usize, column: usize, value: &str) -> Result<i64> {
    let trimmed = value.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return Ok(v);
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 => Ok(v as i64),
        _ => Err(LoaderError::Parse {
            path: path.to_path_buf(),
            row,
            column,
            value: value.to_string(),
        }),
    }
}

/// Load one frame file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, a row has fewer than 18
/// columns, or a numeric field cannot be parsed. A file without rows is not
/// an error and yields an empty frame.
pub fn load_frame<P: AsRef<Path>>(path: P) -> Result<Frame> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;

    // Fields may be separated by any run of spaces or tabs.
    let normalized: String = content
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");

    let mut reader = ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .flexible(true)
        .from_reader(normalized.as_bytes());

    let mut frame = Frame::empty(path);
    let mut geometry_row = [0.0f64; GEOMETRY_WIDTH];

    for (row, result) in reader.records().enumerate() {
        let record = result.map_err(|source| LoaderError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

        // Lines holding only whitespace carry no record.
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }

        if record.len() < MIN_COLUMNS {
            return Err(LoaderError::MissingColumns {
                path: path.to_path_buf(),
                row,
                expected: MIN_COLUMNS,
                found: record.len(),
            });
        }

        for (slot, column) in geometry_row.iter_mut().zip(GEOMETRY_COLUMNS) {
            *slot = parse_float(path, row, column, &record[column])?;
        }

        frame.geometries.push_row(&geometry_row);
        frame.labels.push(parse_integer(path, row, LABEL_COLUMN, &record[LABEL_COLUMN])?);
        frame
            .class_ids
            .push(parse_integer(path, row, CLASS_COLUMN, &record[CLASS_COLUMN])?);
        frame.image_paths.push(PathBuf::from(&record[IMAGE_COLUMN]));
    }

    Ok(frame)
}

/// List the frame files of a directory in sorted filename order.
pub fn list_frame_files(directory: &Path) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        return Err(LoaderError::DirectoryNotFound(directory.to_path_buf()));
    }

    let mut files: Vec<PathBuf> = fs::read_dir(directory)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();

    files.sort();
    Ok(files)
}

/// Load every frame of a directory, in sorted filename order.
///
/// Files are parsed in parallel; the first failure is returned.
pub fn load_frames(directory: &Path) -> Result<Vec<Frame>> {
    let files = list_frame_files(directory)?;

    let frames = files
        .par_iter()
        .map(load_frame)
        .collect::<Result<Vec<Frame>>>()?;

    let total_lines: usize = frames.iter().map(Frame::line_count).sum();
    info!(
        "Loaded {} frames ({} lines) from {}",
        frames.len(),
        total_lines,
        directory.display()
    );

    Ok(frames)
}

/// Mean of all start and end points over a set of frames.
///
/// Returns `None` when the frames contain no lines.
pub fn endpoint_mean(frames: &[Frame]) -> Option<[f64; 3]> {
    let mut sum = [0.0f64; 3];
    let mut count = 0usize;

    for frame in frames {
        count += frame.line_count();
        for row in frame.geometries.iter_rows() {
            for axis in 0..3 {
                sum[axis] += row[START.start + axis] / 2.0 + row[END.start + axis] / 2.0;
            }
        }
    }

    if count == 0 {
        return None;
    }

    Some(sum.map(|s| s / count as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn record_line(image: &str, geometry: [f64; GEOMETRY_WIDTH], label: i64, class_id: i64) -> String {
        let mut fields = vec![image.to_string()];
        fields.extend(geometry.iter().map(|v| v.to_string()));
        fields.push(label.to_string());
        fields.push("0".to_string());
        fields.push(class_id.to_string());
        fields.join(" ")
    }

    fn geometry(start: [f64; 3], end: [f64; 3]) -> [f64; GEOMETRY_WIDTH] {
        let mut g = [0.0; GEOMETRY_WIDTH];
        g[START].copy_from_slice(&start);
        g[END].copy_from_slice(&end);
        g[START_NORMAL].copy_from_slice(&[0.0, 0.0, 1.0]);
        g[END_NORMAL].copy_from_slice(&[0.0, 1.0, 0.0]);
        g[OPEN_START] = 1.0;
        g
    }

    #[test]
    fn test_load_frame_columns() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", record_line("img/a.png", geometry([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]), 3, 7)).unwrap();
        writeln!(file, "{}", record_line("img/b.png", geometry([0.0, 0.0, 0.0], [1.0, 0.0, 0.0]), 4, 0)).unwrap();
        file.flush().unwrap();

        let frame = load_frame(file.path())?;
        assert_eq!(frame.line_count(), 2);
        assert_eq!(frame.geometries.width(), GEOMETRY_WIDTH);
        assert_eq!(frame.geometries.rows(), 2);
        assert_eq!(&frame.geometries.row(0)[START], &[1.0, 2.0, 3.0]);
        assert_eq!(&frame.geometries.row(0)[END], &[4.0, 5.0, 6.0]);
        assert_eq!(frame.geometries.get(0, OPEN_START), 1.0);
        assert_eq!(frame.labels, vec![3, 4]);
        assert_eq!(frame.class_ids, vec![7, 0]);
        assert_eq!(frame.image_paths[1], PathBuf::from("img/b.png"));

        Ok(())
    }

    #[test]
    fn test_load_frame_float_labels() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        let mut fields = vec!["img.png".to_string()];
        fields.extend((0..GEOMETRY_WIDTH).map(|i| format!("{}.5", i)));
        fields.extend(["2.0".to_string(), "0".to_string(), "11.0".to_string()]);
        writeln!(file, "{}", fields.join(" ")).unwrap();
        file.flush().unwrap();

        let frame = load_frame(file.path())?;
        assert_eq!(frame.labels, vec![2]);
        assert_eq!(frame.class_ids, vec![11]);
        assert_eq!(frame.geometries.get(0, 13), 13.5);

        Ok(())
    }

    #[test]
    fn test_load_empty_frame() -> Result<()> {
        let file = NamedTempFile::new().unwrap();

        let frame = load_frame(file.path())?;
        assert!(frame.is_empty());
        assert_eq!(frame.line_count(), 0);
        assert_eq!(frame.geometries.rows(), 0);
        assert!(frame.image_paths.is_empty());

        Ok(())
    }

    #[test]
    fn test_load_frame_mixed_whitespace() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        let line = record_line("img/a.png", geometry([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]), 3, 7);
        writeln!(file, "{}", line.replace(' ', "\t")).unwrap();
        writeln!(file, "   ").unwrap();
        writeln!(file, "  {}  ", line.replace(' ', "   ")).unwrap();
        file.flush().unwrap();

        let frame = load_frame(file.path())?;
        assert_eq!(frame.line_count(), 2);
        for row in 0..2 {
            assert_eq!(&frame.geometries.row(row)[END], &[4.0, 5.0, 6.0]);
        }
        assert_eq!(frame.labels, vec![3, 3]);
        assert_eq!(frame.class_ids, vec![7, 7]);
        assert_eq!(frame.image_paths[1], PathBuf::from("img/a.png"));

        Ok(())
    }

    #[test]
    fn test_load_frame_missing_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "img.png 1 2 3").unwrap();
        file.flush().unwrap();

        match load_frame(file.path()) {
            Err(LoaderError::MissingColumns { row, found, .. }) => {
                assert_eq!(row, 0);
                assert_eq!(found, 4);
            }
            other => panic!("Expected MissingColumns, got {:?}", other),
        }
    }

    #[test]
    fn test_load_frame_bad_number() {
        let mut file = NamedTempFile::new().unwrap();
        let line = record_line("img.png", geometry([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]), 1, 1)
            .replacen("2", "two", 1);
        writeln!(file, "{}", line).unwrap();
        file.flush().unwrap();

        assert!(matches!(
            load_frame(file.path()),
            Err(LoaderError::Parse { column: 2, .. })
        ));
    }

    #[test]
    fn test_load_frames_sorted() -> Result<()> {
        let dir = tempdir().unwrap();
        for (name, x) in [("frame_2.txt", 2.0), ("frame_0.txt", 0.0), ("frame_1.txt", 1.0)] {
            let line = record_line("img.png", geometry([x, 0.0, 0.0], [x, 1.0, 0.0]), 1, 1);
            fs::write(dir.path().join(name), format!("{}\n", line)).unwrap();
        }
        fs::create_dir(dir.path().join("nested")).unwrap();

        let frames = load_frames(dir.path())?;
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.geometries.get(0, 0), i as f64);
        }

        Ok(())
    }

    #[test]
    fn test_list_missing_directory() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            list_frame_files(&missing),
            Err(LoaderError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn test_endpoint_mean() {
        let mut frame = Frame::empty("a");
        for (start, end) in [([0.0, 0.0, 0.0], [2.0, 2.0, 2.0]), ([4.0, 0.0, 2.0], [4.0, 0.0, 4.0])] {
            frame.geometries.push_row(&geometry(start, end));
            frame.labels.push(0);
            frame.class_ids.push(0);
            frame.image_paths.push(PathBuf::new());
        }

        let mean = endpoint_mean(&[frame, Frame::empty("b")]).unwrap();
        assert!((mean[0] - 2.5).abs() < 1e-12);
        assert!((mean[1] - 0.5).abs() < 1e-12);
        assert!((mean[2] - 2.0).abs() < 1e-12);

        assert!(endpoint_mean(&[Frame::empty("c")]).is_none());
    }

    #[test]
    fn test_geometry_matrix_select_rows() {
        let matrix = GeometryMatrix::from_rows(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let selected = matrix.select_rows(&[2, 0]);

        assert_eq!(selected.rows(), 2);
        assert_eq!(selected.row(0), &[5.0, 6.0]);
        assert_eq!(selected.row(1), &[1.0, 2.0]);
        assert!(GeometryMatrix::from_row_major(vec![1.0, 2.0, 3.0], 2).is_none());
    }
}
