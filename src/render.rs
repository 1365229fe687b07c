use crate::config::StyleConfig;
use crate::error::{PipelineError, Result};
use crate::types::{PolygonDataset, Scalar, ScalarKey};
use geo::{BoundingRect, MultiPolygon, Rect};
use image::{ImageBuffer, Rgba, RgbaImage};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Fill used when no column is styled.
pub const DEFAULT_FILL: Rgba<u8> = Rgba([0x1f, 0x77, 0xb4, 255]);
const FRAME: Rgba<u8> = Rgba([0, 0, 0, 255]);
const TICKS: usize = 5;
const TICK_LEN: i64 = 6;

const BLUES: &[[u8; 3]] = &[
    [0xf7, 0xfb, 0xff], [0xde, 0xeb, 0xf7], [0xc6, 0xdb, 0xef], [0x9e, 0xca, 0xe1], [0x6b, 0xae, 0xd6],
    [0x42, 0x92, 0xc6], [0x21, 0x71, 0xb5], [0x08, 0x51, 0x9c], [0x08, 0x30, 0x6b],
];
const REDS: &[[u8; 3]] = &[
    [0xff, 0xf5, 0xf0], [0xfe, 0xe0, 0xd2], [0xfc, 0xbb, 0xa1], [0xfc, 0x92, 0x72], [0xfb, 0x6a, 0x4a],
    [0xef, 0x3b, 0x2c], [0xcb, 0x18, 0x1d], [0xa5, 0x0f, 0x15], [0x67, 0x00, 0x0d],
];
const GREENS: &[[u8; 3]] = &[
    [0xf7, 0xfc, 0xf5], [0xe5, 0xf5, 0xe0], [0xc7, 0xe9, 0xc0], [0xa1, 0xd9, 0x9b], [0x74, 0xc4, 0x76],
    [0x41, 0xab, 0x5d], [0x23, 0x8b, 0x45], [0x00, 0x6d, 0x2c], [0x00, 0x44, 0x1b],
];
const GREYS: &[[u8; 3]] = &[
    [0xff, 0xff, 0xff], [0xf0, 0xf0, 0xf0], [0xd9, 0xd9, 0xd9], [0xbd, 0xbd, 0xbd], [0x96, 0x96, 0x96],
    [0x73, 0x73, 0x73], [0x52, 0x52, 0x52], [0x25, 0x25, 0x25], [0x00, 0x00, 0x00],
];
const ORANGES: &[[u8; 3]] = &[
    [0xff, 0xf5, 0xeb], [0xfe, 0xe6, 0xce], [0xfd, 0xd0, 0xa2], [0xfd, 0xae, 0x6b], [0xfd, 0x8d, 0x3c],
    [0xf1, 0x69, 0x13], [0xd9, 0x48, 0x01], [0xa6, 0x36, 0x03], [0x7f, 0x27, 0x04],
];
const PURPLES: &[[u8; 3]] = &[
    [0xfc, 0xfb, 0xfd], [0xef, 0xed, 0xf5], [0xda, 0xda, 0xeb], [0xbc, 0xbd, 0xdc], [0x9e, 0x9a, 0xc8],
    [0x80, 0x7d, 0xba], [0x6a, 0x51, 0xa3], [0x54, 0x27, 0x8f], [0x3f, 0x00, 0x7d],
];
const VIRIDIS: &[[u8; 3]] = &[
    [0x44, 0x01, 0x54], [0x48, 0x28, 0x78], [0x3e, 0x49, 0x89], [0x31, 0x68, 0x8e], [0x26, 0x82, 0x8e],
    [0x1f, 0x9e, 0x89], [0x35, 0xb7, 0x79], [0x6e, 0xce, 0x58], [0xb5, 0xde, 0x2b], [0xfd, 0xe7, 0x25],
];

/// A named palette, linearly interpolated between its stops.
#[derive(Debug, Clone, Copy)]
pub struct Colormap {
    stops: &'static [[u8; 3]],
    reversed: bool,
}

impl Colormap {
    /// Looks up a palette by name. A `_r` suffix reverses it.
    pub fn from_name(name: &str) -> Result<Self> {
        let (base, reversed) = match name.strip_suffix("_r") {
            Some(base) => (base, true),
            None => (name, false),
        };
        let stops = match base {
            "Blues" => BLUES,
            "Reds" => REDS,
            "Greens" => GREENS,
            "Greys" | "Grays" => GREYS,
            "Oranges" => ORANGES,
            "Purples" => PURPLES,
            "viridis" => VIRIDIS,
            _ => return Err(PipelineError::Style(format!("unknown colormap '{}'", name))),
        };
        Ok(Colormap { stops, reversed })
    }

    pub fn sample(&self, t: f64) -> Rgba<u8> {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        let t = if self.reversed { 1.0 - t } else { t };
        let last = self.stops.len() - 1;
        let pos = t * last as f64;
        let i = pos.floor() as usize;
        if i >= last {
            let [r, g, b] = self.stops[last];
            return Rgba([r, g, b, 255]);
        }
        let frac = pos - i as f64;
        let (a, b) = (self.stops[i], self.stops[i + 1]);
        let lerp = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * frac).round() as u8;
        Rgba([lerp(a[0], b[0]), lerp(a[1], b[1]), lerp(a[2], b[2]), 255])
    }
}

/// Parses a colour: `none`, `#rrggbb`, `#rrggbbaa`, a grey level such as
/// `"0.8"`, or one of a few names. `none` yields `Ok(None)`.
pub fn parse_color(spec: &str) -> Result<Option<Rgba<u8>>> {
    let spec = spec.trim();
    let invalid = || PipelineError::Style(format!("invalid colour '{}'", spec));

    if spec.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    if let Some(hex) = spec.strip_prefix('#') {
        if !(hex.len() == 6 || hex.len() == 8) || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
        let alpha = if hex.len() == 8 { channel(6)? } else { 255 };
        return Ok(Some(Rgba([channel(0)?, channel(2)?, channel(4)?, alpha])));
    }
    if let Ok(level) = spec.parse::<f64>() {
        if !(0.0..=1.0).contains(&level) {
            return Err(invalid());
        }
        let v = (level * 255.0).round() as u8;
        return Ok(Some(Rgba([v, v, v, 255])));
    }
    let named = match spec.to_ascii_lowercase().as_str() {
        "black" | "k" => [0, 0, 0],
        "white" | "w" => [255, 255, 255],
        "red" | "r" => [255, 0, 0],
        "green" | "g" => [0, 128, 0],
        "blue" | "b" => [0, 0, 255],
        "gray" | "grey" => [128, 128, 128],
        "c0" => [DEFAULT_FILL[0], DEFAULT_FILL[1], DEFAULT_FILL[2]],
        _ => return Err(invalid()),
    };
    Ok(Some(Rgba([named[0], named[1], named[2], 255])))
}

/// How values were mapped to colours.
#[derive(Debug, Clone, PartialEq)]
pub enum Legend {
    Continuous { min: f64, max: f64, colormap: String },
    Categorical(Vec<(Scalar, Rgba<u8>)>),
}

pub struct Figure {
    pub image: RgbaImage,
    pub legend: Option<Legend>,
}

impl Figure {
    /// Writes the image; the format follows the file extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        self.image.save(path)?;
        info!("Saved figure to {:?}", path);
        Ok(())
    }
}

/// Per-record fill colours and the legend describing them.
fn assign_colors(
    dataset: &PolygonDataset,
    style: &StyleConfig,
    missing: Option<Rgba<u8>>,
) -> Result<(Vec<Option<Rgba<u8>>>, Option<Legend>)> {
    let column = match &style.column {
        Some(column) => column,
        None => return Ok((vec![Some(DEFAULT_FILL); dataset.len()], None)),
    };
    let idx = dataset
        .column_index(column)
        .ok_or_else(|| PipelineError::column_not_found(column, &dataset.columns))?;
    let colormap = Colormap::from_name(&style.colormap)?;

    let values: Vec<&Scalar> = dataset.records.iter().map(|r| &r.values[idx]).collect();
    let present: Vec<&Scalar> = values.iter().copied().filter(|v| !v.is_null()).collect();
    if present.is_empty() {
        return Ok((vec![missing; dataset.len()], None));
    }

    if present.iter().all(|v| v.as_f64().is_some()) {
        let numbers = present.iter().filter_map(|v| v.as_f64());
        let (min, max) = numbers.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        let fills = values
            .iter()
            .map(|v| match v.as_f64() {
                Some(n) if max > min => Some(colormap.sample((n - min) / (max - min))),
                // Degenerate range maps to the low end
                Some(_) => Some(colormap.sample(0.0)),
                None => missing,
            })
            .collect();
        let legend = Legend::Continuous {
            min,
            max,
            colormap: style.colormap.clone(),
        };
        return Ok((fills, Some(legend)));
    }

    let mut categories: Vec<&Scalar> = Vec::new();
    for v in &present {
        if !categories.contains(v) {
            categories.push(*v);
        }
    }
    categories.sort_by_key(|v| v.to_string());
    let step = if categories.len() > 1 {
        1.0 / (categories.len() - 1) as f64
    } else {
        0.0
    };
    let entries: Vec<(Scalar, Rgba<u8>)> = categories
        .iter()
        .enumerate()
        .map(|(i, v)| ((*v).clone(), colormap.sample(i as f64 * step)))
        .collect();
    let lookup: HashMap<ScalarKey, Rgba<u8>> =
        entries.iter().map(|(v, c)| (v.key(), *c)).collect();
    let fills = values
        .iter()
        .map(|v| lookup.get(&v.key()).copied().or(missing))
        .collect();
    debug!("Coloured {} categories of '{}'", entries.len(), column);
    Ok((fills, Some(Legend::Categorical(entries))))
}

/// Pixel-space rectangle.
#[derive(Debug, Clone, Copy)]
struct Area {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

impl Area {
    fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    fn height(&self) -> f64 {
        self.y1 - self.y0
    }
}

/// Maps data coordinates into the plotting area with equal aspect.
struct Transform {
    min_x: f64,
    max_y: f64,
    scale: f64,
    offset_x: f64,
    offset_y: f64,
}

impl Transform {
    fn fit(bounds: Rect<f64>, area: Area) -> Self {
        let (dx, dy) = (bounds.width(), bounds.height());
        let scale = match (dx > 0.0, dy > 0.0) {
            (true, true) => (area.width() / dx).min(area.height() / dy),
            (true, false) => area.width() / dx,
            (false, true) => area.height() / dy,
            (false, false) => 1.0,
        };
        Transform {
            min_x: bounds.min().x,
            max_y: bounds.max().y,
            scale,
            offset_x: area.x0 + (area.width() - dx * scale) / 2.0,
            offset_y: area.y0 + (area.height() - dy * scale) / 2.0,
        }
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.offset_x + (x - self.min_x) * self.scale,
            self.offset_y + (self.max_y - y) * self.scale,
        )
    }
}

struct Shape {
    rings: Vec<Vec<(f64, f64)>>,
    fill: Option<Rgba<u8>>,
    y_min: f64,
    y_max: f64,
}

fn to_shape(geometry: &MultiPolygon<f64>, transform: &Transform, fill: Option<Rgba<u8>>) -> Shape {
    let mut rings = Vec::new();
    for polygon in geometry {
        for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
            rings.push(ring.coords().map(|c| transform.apply(c.x, c.y)).collect::<Vec<_>>());
        }
    }
    let (y_min, y_max) = rings
        .iter()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p.1), hi.max(p.1)));
    Shape {
        rings,
        fill,
        y_min,
        y_max,
    }
}

fn dataset_bounds(dataset: &PolygonDataset) -> Option<Rect<f64>> {
    dataset
        .records
        .iter()
        .filter_map(|r| r.geometry.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                geo::coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                geo::coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
            )
        })
}

pub fn render(dataset: &PolygonDataset, style: &StyleConfig) -> Result<Figure> {
    let background = parse_color(&style.background)?.unwrap_or(Rgba([255, 255, 255, 255]));
    let edge = parse_color(&style.edge_color)?;
    let missing = match &style.missing_color {
        Some(spec) => parse_color(spec)?,
        None => None,
    };

    let (fills, legend) = assign_colors(dataset, style, missing)?;

    let (width, height) = (style.width as f64, style.height as f64);
    let show_legend = style.legend && legend.is_some();
    let legend_width = if show_legend { (width * 0.12).max(40.0).min(width / 2.0) } else { 0.0 };
    let margin = width.min(height) * if style.axes { 0.08 } else { 0.03 };
    let plot = Area {
        x0: margin,
        y0: margin,
        x1: (width - legend_width - margin).max(margin + 1.0),
        y1: (height - margin).max(margin + 1.0),
    };

    let mut image: RgbaImage = ImageBuffer::from_pixel(style.width, style.height, background);

    if let Some(bounds) = dataset_bounds(dataset) {
        let transform = Transform::fit(bounds, plot);
        let shapes: Vec<Shape> = dataset
            .records
            .iter()
            .zip(&fills)
            .map(|(record, fill)| to_shape(&record.geometry, &transform, *fill))
            .collect();

        fill_shapes(&mut image, &shapes);

        if let Some(color) = edge {
            let radius = (style.line_width as f64 / 2.0).max(0.0);
            if style.line_width > 0.0 {
                for ring in shapes.iter().flat_map(|s| &s.rings) {
                    for seg in ring.windows(2) {
                        draw_line(&mut image, seg[0], seg[1], radius, color);
                    }
                }
            }
        }
    }

    if style.axes {
        draw_frame(&mut image, plot);
    }
    if let (true, Some(legend)) = (show_legend, &legend) {
        let strip = Area {
            x0: width - legend_width,
            y0: plot.y0,
            x1: width - margin.min(legend_width * 0.25),
            y1: plot.y1,
        };
        draw_legend(&mut image, legend, strip)?;
    }

    info!(
        "Rendered {} polygons into {}x{} figure",
        dataset.len(),
        style.width,
        style.height
    );
    Ok(Figure { image, legend })
}

/// Even-odd scanline fill, one image row per rayon task.
fn fill_shapes(image: &mut RgbaImage, shapes: &[Shape]) {
    let width = image.width() as usize;
    if width == 0 {
        return;
    }
    let raw: &mut [u8] = image;
    raw.par_chunks_mut(width * 4).enumerate().for_each(|(y, row)| {
        let yc = y as f64 + 0.5;
        let mut crossings: Vec<f64> = Vec::new();
        for shape in shapes {
            let fill = match shape.fill {
                Some(fill) => fill,
                None => continue,
            };
            if yc < shape.y_min || yc > shape.y_max {
                continue;
            }
            crossings.clear();
            for ring in &shape.rings {
                for i in 0..ring.len() {
                    let a = ring[i];
                    let b = ring[(i + 1) % ring.len()];
                    if (a.1 <= yc) != (b.1 <= yc) {
                        crossings.push(a.0 + (yc - a.1) * (b.0 - a.0) / (b.1 - a.1));
                    }
                }
            }
            crossings.sort_by(|a, b| a.total_cmp(b));
            for pair in crossings.chunks_exact(2) {
                let start = (pair[0] - 0.5).ceil().max(0.0);
                let end = (pair[1] - 0.5).floor().min(width as f64 - 1.0);
                if end < start {
                    continue;
                }
                for x in start as usize..=end as usize {
                    row[x * 4..x * 4 + 4].copy_from_slice(&fill.0);
                }
            }
        }
    });
}

fn put(image: &mut RgbaImage, x: i64, y: i64, color: Rgba<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_line(image: &mut RgbaImage, a: (f64, f64), b: (f64, f64), radius: f64, color: Rgba<u8>) {
    let length = ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt();
    let steps = (length * 2.0).ceil().max(1.0) as usize;
    let r = radius.ceil() as i64;
    for s in 0..=steps {
        let t = s as f64 / steps as f64;
        let (px, py) = (a.0 + (b.0 - a.0) * t, a.1 + (b.1 - a.1) * t);
        if radius <= 0.5 {
            put(image, px.floor() as i64, py.floor() as i64, color);
            continue;
        }
        for dy in -r..=r {
            for dx in -r..=r {
                if ((dx * dx + dy * dy) as f64) <= radius * radius {
                    put(image, px.floor() as i64 + dx, py.floor() as i64 + dy, color);
                }
            }
        }
    }
}

fn fill_rect(image: &mut RgbaImage, area: Area, color: Rgba<u8>) {
    for y in area.y0.round() as i64..area.y1.round() as i64 {
        for x in area.x0.round() as i64..area.x1.round() as i64 {
            put(image, x, y, color);
        }
    }
}

fn outline_rect(image: &mut RgbaImage, area: Area) {
    let (x0, y0) = (area.x0.round() as i64, area.y0.round() as i64);
    let (x1, y1) = (area.x1.round() as i64, area.y1.round() as i64);
    for x in x0..=x1 {
        put(image, x, y0, FRAME);
        put(image, x, y1, FRAME);
    }
    for y in y0..=y1 {
        put(image, x0, y, FRAME);
        put(image, x1, y, FRAME);
    }
}

fn draw_frame(image: &mut RgbaImage, plot: Area) {
    outline_rect(image, plot);
    let (x0, y1) = (plot.x0.round() as i64, plot.y1.round() as i64);
    for i in 0..TICKS {
        let t = i as f64 / (TICKS - 1) as f64;
        let tx = (plot.x0 + plot.width() * t).round() as i64;
        let ty = (plot.y0 + plot.height() * t).round() as i64;
        for d in 1..=TICK_LEN {
            put(image, tx, y1 + d, FRAME);
            put(image, x0 - d, ty, FRAME);
        }
    }
}

fn draw_legend(image: &mut RgbaImage, legend: &Legend, strip: Area) -> Result<()> {
    match legend {
        Legend::Continuous { colormap, .. } => {
            let colormap = Colormap::from_name(colormap)?;
            let bar = Area {
                x0: strip.x0 + strip.width() * 0.25,
                y0: strip.y0,
                x1: strip.x0 + strip.width() * 0.55,
                y1: strip.y1,
            };
            let (top, bottom) = (bar.y0.round() as i64, bar.y1.round() as i64);
            for y in top..bottom {
                let t = 1.0 - (y - top) as f64 / (bottom - top).max(1) as f64;
                let row = Area { y0: y as f64, y1: y as f64 + 1.0, ..bar };
                fill_rect(image, row, colormap.sample(t));
            }
            outline_rect(image, bar);
            let x1 = bar.x1.round() as i64;
            for i in 0..TICKS {
                let ty = (bar.y0 + bar.height() * i as f64 / (TICKS - 1) as f64).round() as i64;
                for d in 1..=TICK_LEN {
                    put(image, x1 + d, ty, FRAME);
                }
            }
        }
        Legend::Categorical(entries) => {
            let size = (strip.width() * 0.4).min(strip.height() / (entries.len() as f64 * 1.25));
            for (i, (_, color)) in entries.iter().enumerate() {
                let y0 = strip.y0 + i as f64 * size * 1.25;
                let swatch = Area {
                    x0: strip.x0 + strip.width() * 0.25,
                    y0,
                    x1: strip.x0 + strip.width() * 0.25 + size,
                    y1: y0 + size,
                };
                fill_rect(image, swatch, *color);
                outline_rect(image, swatch);
            }
        }
    }
    Ok(())
}
