//! QC report pages: image grids, statistics tables and page merging.

mod colormap;
mod merge;
mod pdf;
mod volume;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Local;
use serde::Serialize;

pub use colormap::Colormap;
pub use merge::{PdfPages, ghostscript_args, merge_pdfs};
pub use volume::{Orientation, Slice, Volume, orientation_matrix, reorient, reoriented_path, swapdim_args};

use crate::error::SpiderError;
use crate::timed::{TimedWriter, announce};
use pdf::{PAGE_HEIGHT, PAGE_WIDTH, PageBuilder, Raster};

const MARGIN: f32 = 36.0;
const TITLE_BAND: f32 = 40.0;
const FOOTER_BAND: f32 = 36.0;
const PANEL_TITLE: f32 = 12.0;
const ROW_LABEL: f32 = 12.0;
const PANEL_GAP: f32 = 6.0;

const STATS_FONT: f32 = 6.0;
const STATS_LINE: f32 = 9.0;
const KEY_HEADER_COLOR: [f32; 3] = [0.8, 0.4, 0.4];
const VALUE_HEADER_COLOR: [f32; 3] = [1.0, 1.0, 0.4];

/// One page of image rows.
#[derive(Debug, Clone)]
pub struct ImagesPage {
    pub pdf_path: PathBuf,
    pub page_index: u32,
    pub title: String,
    pub images: Vec<PathBuf>,
    /// Row labels keyed by image index; `Line <i>` when absent.
    pub labels: BTreeMap<usize, String>,
    /// Slice indices keyed by image index. `None` shows the three mid-slices.
    pub slices: Option<BTreeMap<usize, Vec<usize>>>,
    pub orient: Orientation,
    pub cmap: Colormap,
    pub cmaps: BTreeMap<usize, Colormap>,
    pub vmins: BTreeMap<usize, f32>,
    pub vmaxs: BTreeMap<usize, f32>,
    pub volume_index: Option<usize>,
}

impl ImagesPage {
    pub fn new(
        pdf_path: impl Into<PathBuf>,
        page_index: u32,
        title: impl Into<String>,
        images: Vec<PathBuf>,
    ) -> Self {
        Self {
            pdf_path: pdf_path.into(),
            page_index,
            title: title.into(),
            images,
            labels: BTreeMap::new(),
            slices: None,
            orient: Orientation::default(),
            cmap: Colormap::default(),
            cmaps: BTreeMap::new(),
            vmins: BTreeMap::new(),
            vmaxs: BTreeMap::new(),
            volume_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRow {
    pub label: String,
    pub panels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImagesPageSummary {
    pub path: PathBuf,
    pub page_index: u32,
    pub rows: Vec<ImageRow>,
}

/// One page of key/value tables.
#[derive(Debug, Clone)]
pub struct StatsPage {
    pub pdf_path: PathBuf,
    pub page_index: u32,
    pub title: String,
    pub stats: Vec<(String, String)>,
    pub tables_number: usize,
    pub columns_header: [String; 2],
    pub limit_size_text_column1: usize,
    pub limit_size_text_column2: usize,
}

impl StatsPage {
    pub fn new<K, V>(
        pdf_path: impl Into<PathBuf>,
        page_index: u32,
        title: impl Into<String>,
        stats: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: ToString,
    {
        Self {
            pdf_path: pdf_path.into(),
            page_index,
            title: title.into(),
            stats: stats
                .into_iter()
                .map(|(key, value)| (key.into(), value.to_string()))
                .collect(),
            tables_number: 3,
            columns_header: ["Header".to_string(), "Value".to_string()],
            limit_size_text_column1: 30,
            limit_size_text_column2: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsTable {
    pub rows: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsPageSummary {
    pub path: PathBuf,
    pub page_index: u32,
    pub tables: Vec<StatsTable>,
}

/// Shortens `text` to `size` characters followed (or, with `keep_end`,
/// preceded) by `...`.
pub fn smaller_str(text: &str, size: usize, keep_end: bool) -> String {
    let count = text.chars().count();
    if count <= size {
        return text.to_string();
    }
    if keep_end {
        let tail = text.chars().skip(count - size).collect::<String>();
        format!("...{tail}")
    } else {
        let head = text.chars().take(size).collect::<String>();
        format!("{head}...")
    }
}

pub fn plot_images(
    request: &ImagesPage,
    writer: Option<&TimedWriter>,
) -> Result<ImagesPageSummary, SpiderError> {
    announce(
        writer,
        &format!("INFO: generating pdf page {} with images.", request.page_index),
    );
    if request.images.is_empty() {
        return Err(SpiderError::Report("no images to plot".to_string()));
    }
    if request.slices.is_some() {
        announce(writer, "INFO: showing different slices.");
    } else {
        announce(
            writer,
            "INFO: display different plan view (ax/sag/cor) of the mid slice.",
        );
    }

    let mut rows = Vec::with_capacity(request.images.len());
    for (index, image) in request.images.iter().enumerate() {
        let source = reorient(image, writer)?.unwrap_or_else(|| image.clone());
        let volume = Volume::load(&source, request.volume_index)?;
        let label = request
            .labels
            .get(&index)
            .cloned()
            .unwrap_or_else(|| format!("Line {index}"));
        let panels = match &request.slices {
            Some(slices) => {
                let axis = request.orient.axis();
                let indices = slices
                    .get(&index)
                    .cloned()
                    .unwrap_or_else(|| volume.default_slices(axis));
                indices
                    .into_iter()
                    .map(|slice| Ok((format!("Slice {slice}"), volume.slice(axis, slice)?)))
                    .collect::<Result<Vec<_>, SpiderError>>()?
            }
            None => vec![
                ("Axial".to_string(), volume.middle_slice(2)?),
                ("Coronal".to_string(), volume.middle_slice(1)?),
                ("Sagittal".to_string(), volume.middle_slice(0)?),
            ],
        };
        rows.push((label, index, panels));
    }

    let mut page = PageBuilder::new();
    page_frame(&mut page, &request.title, request.page_index);

    let row_count = rows.len() as f32;
    let area_top = PAGE_HEIGHT - TITLE_BAND;
    let row_height = (PAGE_HEIGHT - TITLE_BAND - FOOTER_BAND) / row_count;
    let mut summary_rows = Vec::with_capacity(rows.len());
    for (row, (label, index, panels)) in rows.into_iter().enumerate() {
        let top = area_top - row as f32 * row_height;
        page.text(MARGIN, top - ROW_LABEL + 3.0, 9.0, &label);

        let columns = panels.len().max(1) as f32;
        let cell_width = (PAGE_WIDTH - 2.0 * MARGIN) / columns;
        let side = (cell_width - PANEL_GAP)
            .min(row_height - ROW_LABEL - PANEL_TITLE - PANEL_GAP)
            .max(1.0);
        let cmap = request.cmaps.get(&index).copied().unwrap_or(request.cmap);
        let vmin = request.vmins.get(&index).copied();
        let vmax = request.vmaxs.get(&index).copied();

        let mut titles = Vec::with_capacity(panels.len());
        for (column, (title, slice)) in panels.into_iter().enumerate() {
            let x = MARGIN + column as f32 * cell_width;
            let title_y = top - ROW_LABEL - PANEL_TITLE + 3.0;
            page.centered_text(x + cell_width / 2.0, title_y, 7.0, &title);
            let image_y = title_y - 3.0 - side;
            page.image(
                rasterize(&slice, cmap, vmin, vmax),
                x + (cell_width - side) / 2.0,
                image_y,
                side,
                side,
            );
            titles.push(title);
        }
        summary_rows.push(ImageRow {
            label,
            panels: titles,
        });
    }

    page.save(&request.pdf_path)?;
    Ok(ImagesPageSummary {
        path: request.pdf_path.clone(),
        page_index: request.page_index,
        rows: summary_rows,
    })
}

pub fn plot_stats(
    request: &StatsPage,
    writer: Option<&TimedWriter>,
) -> Result<StatsPageSummary, SpiderError> {
    announce(
        writer,
        &format!("INFO: generating pdf page {} with stats.", request.page_index),
    );
    if request.tables_number == 0 {
        return Err(SpiderError::Report("tables_number must be at least 1".to_string()));
    }

    let cells = request
        .stats
        .iter()
        .map(|(key, value)| {
            (
                smaller_str(
                    &key.trim().replace('"', ""),
                    request.limit_size_text_column1,
                    false,
                ),
                smaller_str(value, request.limit_size_text_column2, false),
            )
        })
        .collect::<Vec<_>>();
    let chunk = cells.len().div_ceil(request.tables_number).max(1);
    let mut tables = cells
        .chunks(chunk)
        .map(|rows| StatsTable {
            rows: rows.to_vec(),
        })
        .collect::<Vec<_>>();
    tables.resize_with(request.tables_number, || StatsTable { rows: Vec::new() });

    let mut page = PageBuilder::new();
    page_frame(&mut page, &request.title, request.page_index);

    let table_width = (PAGE_WIDTH - 2.0 * MARGIN) / request.tables_number as f32;
    let key_width = (table_width - PANEL_GAP) * 0.7;
    let value_width = (table_width - PANEL_GAP) - key_width;
    let [key_header, value_header] = &request.columns_header;
    for (column, table) in tables.iter().enumerate() {
        let x = MARGIN + column as f32 * table_width;
        let height = STATS_LINE * (table.rows.len() + 1) as f32;
        let mut y = (PAGE_HEIGHT + height) / 2.0 - STATS_LINE;

        page.fill_rect(x, y - 2.0, key_width, STATS_LINE, KEY_HEADER_COLOR);
        page.fill_rect(x + key_width, y - 2.0, value_width, STATS_LINE, VALUE_HEADER_COLOR);
        page.text(x + 1.0, y, STATS_FONT, key_header);
        page.text(x + key_width + 1.0, y, STATS_FONT, value_header);
        for (key, value) in &table.rows {
            page.stroke_line((x, y - 2.0), (x + key_width + value_width, y - 2.0));
            y -= STATS_LINE;
            page.text(x + 1.0, y, STATS_FONT, key);
            page.text(x + key_width + 1.0, y, STATS_FONT, value);
        }
        page.stroke_line((x, y - 2.0), (x + key_width + value_width, y - 2.0));
    }

    page.save(&request.pdf_path)?;
    Ok(StatsPageSummary {
        path: request.pdf_path.clone(),
        page_index: request.page_index,
        tables,
    })
}

fn page_frame(page: &mut PageBuilder, title: &str, page_index: u32) {
    page.centered_text(
        PAGE_WIDTH / 2.0,
        PAGE_HEIGHT - 22.0,
        12.0,
        &format!("-- {title} PDF report --"),
    );
    let date = Local::now().format("%Y-%m-%d %H:%M:%S");
    page.centered_text(
        PAGE_WIDTH / 2.0,
        14.0,
        8.0,
        &format!("Date: {date} -- page {page_index}"),
    );
}

fn rasterize(slice: &Slice, cmap: Colormap, vmin: Option<f32>, vmax: Option<f32>) -> Raster {
    let (lo, hi) = slice.range();
    let lo = vmin.unwrap_or(lo);
    let hi = vmax.unwrap_or(hi);
    let span = if hi > lo { hi - lo } else { 1.0 };
    let (width, height) = (slice.width(), slice.height());
    let channels = if cmap.is_gray() { 1 } else { 3 };
    let mut pixels = Vec::with_capacity(width * height * channels);
    for row in 0..height {
        for col in 0..width {
            let t = (slice.display_at(row, col) - lo) / span;
            if cmap.is_gray() {
                pixels.push(Colormap::gray(t));
            } else {
                pixels.extend(cmap.rgb(t));
            }
        }
    }
    Raster {
        width,
        height,
        rgb: !cmap.is_gray(),
        pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smaller_str_truncates() {
        assert_eq!(smaller_str("short", 10, false), "short");
        assert_eq!(smaller_str("abcdefghijkl", 4, false), "abcd...");
        assert_eq!(smaller_str("abcdefghijkl", 4, true), "...ijkl");
    }

    #[test]
    fn stats_split_evenly() {
        let temp = tempfile::tempdir().unwrap();
        let stats = (0..9).map(|i| (format!("measure_{i}"), i as f64 * 1.5));
        let request = StatsPage::new(temp.path().join("stats.pdf"), 2, "Test", stats);
        let summary = plot_stats(&request, None).unwrap();
        assert!(summary.path.is_file());
        assert_eq!(summary.tables.len(), 3);
        assert!(summary.tables.iter().all(|table| table.rows.len() == 3));
        assert_eq!(summary.tables[1].rows[0], ("measure_3".to_string(), "4.5".to_string()));
    }

    #[test]
    fn stats_uneven_and_truncated() {
        let temp = tempfile::tempdir().unwrap();
        let mut request = StatsPage::new(
            temp.path().join("stats.pdf"),
            1,
            "Test",
            [
                ("\"a very long header name that goes on\"", "0.123456789012"),
                ("b", "2"),
                ("c", "3"),
                ("d", "4"),
            ],
        );
        request.tables_number = 3;
        let summary = plot_stats(&request, None).unwrap();
        let sizes = summary
            .tables
            .iter()
            .map(|table| table.rows.len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![2, 2, 0]);
        assert_eq!(summary.tables[0].rows[0].0, "a very long header name that g...");
        assert_eq!(summary.tables[0].rows[0].1, "0.12345678...");
    }

    #[test]
    fn rasterize_applies_window() {
        let volume = Volume::from_data([2, 1, 1], vec![0.0, 10.0]).unwrap();
        let slice = volume.slice(2, 0).unwrap();
        let raster = rasterize(&slice, Colormap::Gray, None, None);
        // display flips the first axis
        assert_eq!(raster.pixels, vec![255, 0]);
        let clipped = rasterize(&slice, Colormap::Hot, Some(0.0), Some(5.0));
        assert!(clipped.rgb);
        assert_eq!(&clipped.pixels[0..3], &[255, 255, 255]);
    }
}
