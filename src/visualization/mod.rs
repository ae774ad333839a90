//! Histogram plots of per-epoch line and cluster counts.
//!
//! Plots are drawn as bars only (no axis text) so no font backend is needed.

use std::collections::BTreeMap;
use std::path::Path;

use plotters::prelude::*;
use plotters_bitmap::BitMapBackend;
use thiserror::Error;

/// Errors that can occur during visualization.
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plotting error: {0}")]
    PlottingError(String),

    #[error("No counts to plot")]
    EmptyCounts,
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VisualizationError>;

/// Default plot width in pixels.
const DEFAULT_WIDTH: u32 = 1600;

/// Default plot height in pixels.
const DEFAULT_HEIGHT: u32 = 600;

const LINE_COLOR: RGBColor = RGBColor(55, 126, 184);
const CLUSTER_COLOR: RGBColor = RGBColor(228, 26, 28);

/// Occurrences of every distinct count, in ascending count order.
pub fn count_histogram(counts: &[i64]) -> Vec<(i64, usize)> {
    let mut bins = BTreeMap::new();
    for &count in counts {
        *bins.entry(count).or_insert(0usize) += 1;
    }
    bins.into_iter().collect()
}

fn plotting_error<E: std::fmt::Display>(e: E) -> VisualizationError {
    VisualizationError::PlottingError(e.to_string())
}

fn draw_histogram<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    counts: &[i64],
    color: RGBColor,
) -> Result<()> {
    let bins = count_histogram(counts);
    let (Some(&(lo, _)), Some(&(hi, _))) = (bins.first(), bins.last()) else {
        return Ok(());
    };
    let peak = bins.iter().map(|&(_, n)| n).max().unwrap_or(1);

    let mut chart = ChartBuilder::on(area)
        .margin(20)
        .build_cartesian_2d(lo..hi + 1, 0usize..peak + 1)
        .map_err(plotting_error)?;

    chart
        .draw_series(bins.iter().map(|&(value, n)| {
            Rectangle::new([(value, 0), (value + 1, n)], color.filled())
        }))
        .map_err(plotting_error)?;

    Ok(())
}

/// Plot line counts (left) and cluster counts (right) side by side as PNG.
pub fn plot_epoch_statistics(
    output_path: &Path,
    line_counts: &[i64],
    cluster_counts: &[i64],
) -> Result<()> {
    if line_counts.is_empty() && cluster_counts.is_empty() {
        return Err(VisualizationError::EmptyCounts);
    }

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let root = BitMapBackend::new(output_path, (DEFAULT_WIDTH, DEFAULT_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plotting_error)?;

    let (left, right) = root.split_horizontally(DEFAULT_WIDTH / 2);
    draw_histogram(&left, line_counts, LINE_COLOR)?;
    draw_histogram(&right, cluster_counts, CLUSTER_COLOR)?;

    root.present().map_err(plotting_error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_count_histogram() {
        let bins = count_histogram(&[20, 3, 20, 0, 3, 3]);
        assert_eq!(bins, vec![(0, 1), (3, 3), (20, 2)]);
        assert!(count_histogram(&[]).is_empty());
    }

    #[test]
    fn test_plot_epoch_statistics_writes_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plots").join("epoch.png");

        plot_epoch_statistics(&path, &[20, 18, 20, 4], &[5, 5, 0, 1]).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_plot_empty_counts() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            plot_epoch_statistics(&dir.path().join("x.png"), &[], &[]),
            Err(VisualizationError::EmptyCounts)
        ));
    }
}
