//! Player count chart rendering.

use std::io::Cursor;
use std::path::Path;

use chrono::Local;
use plotters::prelude::*;
use plotters::style::{Color as _, FontStyle};
use thiserror::Error;

use crate::config::Color;
use crate::history::HistoryBucket;

const WIDTH: u32 = 800;
const HEIGHT: u32 = 400;
const BACKGROUND: RGBColor = RGBColor(0x2f, 0x31, 0x36);
const GRID: RGBColor = RGBColor(0x66, 0x66, 0x66);
const FONT_FAMILY: &str = "sans-serif";

/// DejaVu Sans, used for axis labels unless `chartFont` overrides it.
static BUNDLED_FONT: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

/// Chart error types.
#[derive(Error, Debug)]
pub enum ChartError {
    #[error("need at least 2 buckets to draw a line, got {0}")]
    NotEnoughData(usize),
    #[error("drawing failed: {0}")]
    Draw(String),
    #[error("PNG encoding failed: {0}")]
    Encode(String),
    #[error("font error: {0}")]
    Font(String),
}

/// Renders a history as an image.
pub trait ChartRenderer: Send + Sync {
    fn render(&self, history: &[HistoryBucket], accent: Color) -> Result<Vec<u8>, ChartError>;
}

/// Register the bundled label font.
pub fn register_bundled_font() -> Result<(), ChartError> {
    plotters::style::register_font(FONT_FAMILY, FontStyle::Normal, BUNDLED_FONT)
        .map_err(|_| ChartError::Font("bundled font is not usable".to_string()))
}

/// Register a font file for axis labels, replacing the bundled one.
pub fn load_chart_font(path: &Path) -> Result<(), ChartError> {
    let bytes = std::fs::read(path).map_err(|e| ChartError::Font(format!("{}: {}", path.display(), e)))?;
    // The backend keeps the font for the rest of the process
    let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
    plotters::style::register_font(FONT_FAMILY, FontStyle::Normal, bytes)
        .map_err(|_| ChartError::Font(format!("{}: not a usable TTF/OTF font", path.display())))
}

/// Line chart drawn with plotters into an in-memory PNG.
#[derive(Debug, Clone)]
pub struct PlottersChart {
    labels: bool,
}

impl PlottersChart {
    /// `labels` needs a font registered via [`register_bundled_font`] or
    /// [`load_chart_font`].
    pub fn new(labels: bool) -> Self {
        Self { labels }
    }

    fn draw(&self, history: &[HistoryBucket], accent: Color, labels: bool) -> Result<Vec<u8>, ChartError> {
        let mut pixels = vec![0u8; (WIDTH * HEIGHT * 3) as usize];
        {
            let root = BitMapBackend::with_buffer(&mut pixels, (WIDTH, HEIGHT)).into_drawing_area();
            root.fill(&BACKGROUND).map_err(draw_err)?;

            let (r, g, b) = accent.rgb();
            let accent = RGBColor(r, g, b);
            let points: Vec<(usize, u32)> = history.iter().enumerate().map(|(i, b)| (i, b.value)).collect();
            let peak = history.iter().map(|b| b.value).max().unwrap_or(0).max(1);
            let y_top = peak + (peak / 10).max(1);

            let mut builder = ChartBuilder::on(&root);
            builder.margin(20);
            if labels {
                builder
                    .caption("Player count", (FONT_FAMILY, 16).into_font().color(&WHITE))
                    .x_label_area_size(50)
                    .y_label_area_size(40);
            }
            let mut chart = builder
                .build_cartesian_2d(0..history.len() - 1, 0..y_top)
                .map_err(draw_err)?;

            if labels {
                let times: Vec<String> = history
                    .iter()
                    .map(|b| b.bucket_start.with_timezone(&Local).format("%H:%M").to_string())
                    .collect();
                chart
                    .configure_mesh()
                    .bold_line_style(GRID.stroke_width(1))
                    .light_line_style(GRID.mix(0.2).stroke_width(1))
                    .axis_style(GRID.stroke_width(1))
                    .x_labels(history.len())
                    .x_label_formatter(&|i| times.get(*i).cloned().unwrap_or_default())
                    .label_style((FONT_FAMILY, 12).into_font().color(&WHITE))
                    .draw()
                    .map_err(draw_err)?;
            }

            chart
                .draw_series(
                    AreaSeries::new(points.iter().copied(), 0, accent.mix(0.2).filled())
                        .border_style(accent.stroke_width(2)),
                )
                .map_err(draw_err)?;
            chart
                .draw_series(points.iter().map(|&p| Circle::new(p, 4, accent.filled())))
                .map_err(draw_err)?;

            root.present().map_err(draw_err)?;
        }

        encode_png(pixels)
    }
}

impl ChartRenderer for PlottersChart {
    fn render(&self, history: &[HistoryBucket], accent: Color) -> Result<Vec<u8>, ChartError> {
        if history.len() < 2 {
            return Err(ChartError::NotEnoughData(history.len()));
        }

        match self.draw(history, accent, self.labels) {
            Err(e) if self.labels => {
                tracing::warn!("Chart labels unavailable, drawing without them: {}", e);
                self.draw(history, accent, false)
            }
            result => result,
        }
    }
}

fn draw_err(e: impl std::fmt::Display) -> ChartError {
    ChartError::Draw(e.to_string())
}

fn encode_png(pixels: Vec<u8>) -> Result<Vec<u8>, ChartError> {
    let img = image::RgbImage::from_raw(WIDTH, HEIGHT, pixels)
        .ok_or_else(|| ChartError::Encode("pixel buffer size mismatch".to_string()))?;
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| ChartError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    fn history(values: &[u32]) -> Vec<HistoryBucket> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| HistoryBucket {
                bucket_start: t0 + ChronoDuration::hours(i as i64),
                value,
            })
            .collect()
    }

    #[test]
    fn test_render_produces_png() {
        let bytes = PlottersChart::new(false)
            .render(&history(&[3, 9, 4, 0]), Color(0x3498db))
            .unwrap();
        assert_eq!(&bytes[..8], &PNG_MAGIC);
    }

    #[test]
    fn test_render_flat_zero_history() {
        let bytes = PlottersChart::new(false).render(&history(&[0, 0]), Color(0xff0000)).unwrap();
        assert_eq!(&bytes[..8], &PNG_MAGIC);
    }

    #[test]
    fn test_render_needs_two_points() {
        let err = PlottersChart::new(false).render(&history(&[5]), Color(0)).unwrap_err();
        assert!(matches!(err, ChartError::NotEnoughData(1)));
    }

    #[test]
    fn test_render_with_bundled_font_labels() {
        register_bundled_font().unwrap();
        let bytes = PlottersChart::new(true)
            .render(&history(&[1, 4, 2]), Color(0x3498db))
            .unwrap();
        assert_eq!(&bytes[..8], &PNG_MAGIC);
    }

    #[test]
    fn test_labelled_render_differs_from_unlabelled() {
        register_bundled_font().unwrap();
        let h = history(&[2, 6, 3]);
        let labelled = PlottersChart::new(true).render(&h, Color(0x3498db)).unwrap();
        let plain = PlottersChart::new(false).render(&h, Color(0x3498db)).unwrap();
        assert_ne!(labelled, plain);
    }

    #[test]
    fn test_load_missing_font() {
        let err = load_chart_font(Path::new("/nonexistent/font.ttf")).unwrap_err();
        assert!(matches!(err, ChartError::Font(_)));
    }
}
