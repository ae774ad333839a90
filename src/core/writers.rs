//! Writers for epoch statistics and assembled batches.
//!
//! - Epoch line and cluster counts as 1-D `.npy` arrays
//! - Valid rows of a batch as CSV for inspection

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use npyz::WriterBuilder;
use thiserror::Error;

use crate::processors::batching::Batch;

/// File stem of the persisted cluster counts.
pub const CLUSTER_COUNT_FILE: &str = "cluster_counts.npy";

/// File stem of the persisted line counts.
pub const LINE_COUNT_FILE: &str = "line_counts.npy";

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to read back a previously written array.
    #[error("failed to read array '{path}': {source}")]
    ReadArray {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Write integer counts as a 1-D `.npy` array, replacing any existing file.
pub fn write_counts_npy(path: &Path, values: &[i64]) -> Result<()> {
    ensure_parent_dirs(path)?;

    let path_str = path.display().to_string();
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path_str.clone(),
        source: e,
    })?;

    let write_err = |e: std::io::Error| WriteError::WriteFile {
        path: path_str.clone(),
        source: e,
    };

    let mut writer = npyz::WriteOptions::<i64>::new()
        .default_dtype()
        .writer(BufWriter::new(file))
        .begin_1d()
        .map_err(write_err)?;
    writer.extend(values.iter().copied()).map_err(write_err)?;
    writer.finish().map_err(write_err)?;

    Ok(())
}

/// Read a 1-D `.npy` array of integer counts.
pub fn read_counts_npy(path: &Path) -> Result<Vec<i64>> {
    let read_err = |e: std::io::Error| WriteError::ReadArray {
        path: path.display().to_string(),
        source: e,
    };

    let file = File::open(path).map_err(read_err)?;
    let npy = npyz::NpyFile::new(BufReader::new(file)).map_err(read_err)?;
    npy.into_vec::<i64>().map_err(read_err)
}

/// Persist the line and cluster counts of one epoch into `directory`.
///
/// # Returns
///
/// Paths of the written (cluster counts, line counts) files.
pub fn write_epoch_counts(
    directory: &Path,
    line_counts: &[i64],
    cluster_counts: &[i64],
) -> Result<(PathBuf, PathBuf)> {
    let cluster_path = directory.join(CLUSTER_COUNT_FILE);
    let line_path = directory.join(LINE_COUNT_FILE);

    write_counts_npy(&cluster_path, cluster_counts)?;
    write_counts_npy(&line_path, line_counts)?;

    Ok((cluster_path, line_path))
}

/// Write the valid rows of a batch to CSV.
///
/// Columns are `index,label,class_id,background,f0..fN` where `f*` are the
/// geometry features of the row.
pub fn write_batch_csv(path: &Path, batch: &Batch) -> Result<()> {
    ensure_parent_dirs(path)?;

    let path_str = path.display().to_string();
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path_str.clone(),
        source: e,
    })?;
    let mut csv_writer = csv::Writer::from_writer(BufWriter::new(file));

    let mut header = vec![
        "index".to_string(),
        "label".to_string(),
        "class_id".to_string(),
        "background".to_string(),
    ];
    header.extend((0..batch.geometries.width()).map(|i| format!("f{}", i)));
    csv_writer
        .write_record(&header)
        .map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;

    for i in 0..batch.line_count {
        let mut record = vec![
            i.to_string(),
            batch.labels[i].to_string(),
            batch.class_ids[i].to_string(),
            u8::from(batch.background_mask[i]).to_string(),
        ];
        record.extend(batch.geometries.row(i).iter().map(|v| format!("{:.6}", v)));

        csv_writer
            .write_record(&record)
            .map_err(|e| WriteError::CsvError {
                path: path_str.clone(),
                source: e,
            })?;
    }

    csv_writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loaders::{GeometryMatrix, FEATURE_WIDTH};
    use tempfile::tempdir;

    #[test]
    fn test_counts_npy_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.npy");
        let values = vec![20i64, 0, 31, 5, 5];

        write_counts_npy(&path, &values).unwrap();
        assert_eq!(read_counts_npy(&path).unwrap(), values);
    }

    #[test]
    fn test_counts_npy_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("counts.npy");

        write_counts_npy(&path, &[1, 2, 3, 4]).unwrap();
        write_counts_npy(&path, &[9]).unwrap();
        assert_eq!(read_counts_npy(&path).unwrap(), vec![9]);

        write_counts_npy(&path, &[]).unwrap();
        assert!(read_counts_npy(&path).unwrap().is_empty());
    }

    #[test]
    fn test_write_epoch_counts() {
        let dir = tempdir().unwrap();
        let (cluster_path, line_path) =
            write_epoch_counts(dir.path(), &[20, 3], &[5, 0]).unwrap();

        assert_eq!(cluster_path.file_name().unwrap(), CLUSTER_COUNT_FILE);
        assert_eq!(read_counts_npy(&line_path).unwrap(), vec![20, 3]);
        assert_eq!(read_counts_npy(&cluster_path).unwrap(), vec![5, 0]);
    }

    #[test]
    fn test_read_missing_counts() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            read_counts_npy(&dir.path().join("missing.npy")),
            Err(WriteError::ReadArray { .. })
        ));
    }

    #[test]
    fn test_write_batch_csv_valid_rows_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("batch.csv");

        let mut geometries = GeometryMatrix::zeros(4, FEATURE_WIDTH);
        geometries.row_mut(1)[0] = 2.5;
        let batch = Batch {
            line_count: 2,
            geometries,
            labels: vec![3, 4, 0, 0],
            class_ids: vec![1, 9, 0, 0],
            valid_mask: vec![true, true, false, false],
            background_mask: vec![false, true, false, false],
            images: None,
            cluster_count: 1,
            cluster_one_hot: {
                let mut one_hot = [0.0f32; crate::processors::batching::CLUSTER_ONE_HOT_WIDTH];
                one_hot[1] = 1.0;
                one_hot
            },
        };

        write_batch_csv(&path, &batch).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("index,label,class_id,background,f0,"));
        assert!(lines[0].ends_with(",f14"));
        assert!(lines[2].starts_with("1,4,9,1,2.500000,"));
    }
}
