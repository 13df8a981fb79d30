use std::cmp::Ordering;
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use country_refresh_core::{format_rfc3339, CountryRecord};
use time::OffsetDateTime;

const TOP_COUNT: usize = 5;
const WIDTH: u32 = 640;
const BAR_MAX_WIDTH: f64 = 360.0;

/// Renders a summary of the whole store as of one refresh.
pub trait ArtifactRenderer {
    #[allow(clippy::missing_errors_doc)]
    fn render(&self, snapshot: &[CountryRecord], as_of: OffsetDateTime) -> Result<Vec<u8>>;
}

/// SVG card with the total count, the five largest estimated GDPs, and the
/// refresh instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvgSummaryRenderer;

impl ArtifactRenderer for SvgSummaryRenderer {
    fn render(&self, snapshot: &[CountryRecord], as_of: OffsetDateTime) -> Result<Vec<u8>> {
        let as_of = format_rfc3339(as_of).map_err(|err| anyhow!(err.to_string()))?;
        let top = top_by_estimated_gdp(snapshot, TOP_COUNT);
        let max_gdp = top.first().and_then(|c| c.estimated_gdp).unwrap_or(0.0);

        let row_height = 36_u32;
        let top_rows = u32::try_from(top.len()).unwrap_or(0);
        let height = 180 + row_height * top_rows;

        let mut svg = String::new();
        writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{height}" viewBox="0 0 {WIDTH} {height}">"#
        )?;
        writeln!(svg, r##"  <rect width="100%" height="100%" fill="#ffffff"/>"##)?;
        writeln!(
            svg,
            r##"  <text x="24" y="44" font-family="sans-serif" font-size="24" fill="#111111">Country Summary</text>"##
        )?;
        writeln!(
            svg,
            r##"  <text x="24" y="80" font-family="sans-serif" font-size="16" fill="#333333">Total countries: {}</text>"##,
            snapshot.len()
        )?;
        writeln!(
            svg,
            r##"  <text x="24" y="112" font-family="sans-serif" font-size="16" fill="#333333">Top {TOP_COUNT} by estimated GDP</text>"##
        )?;

        for (index, country) in top.iter().enumerate() {
            let gdp = country.estimated_gdp.unwrap_or(0.0);
            let bar = if max_gdp > 0.0 {
                (gdp / max_gdp * BAR_MAX_WIDTH).max(1.0)
            } else {
                1.0
            };
            let offset = u32::try_from(index).unwrap_or(0) * row_height;
            let y = 140 + offset;
            writeln!(
                svg,
                r##"  <text x="24" y="{y}" font-family="sans-serif" font-size="14" fill="#111111">{}. {}</text>"##,
                index + 1,
                escape_xml(&country.name)
            )?;
            writeln!(
                svg,
                r##"  <rect x="24" y="{}" width="{bar:.1}" height="10" fill="#3b82f6"/>"##,
                y + 6
            )?;
            writeln!(
                svg,
                r##"  <text x="{:.1}" y="{}" font-family="sans-serif" font-size="12" fill="#555555">{gdp:.2}</text>"##,
                32.0 + bar,
                y + 15
            )?;
        }

        writeln!(
            svg,
            r##"  <text x="24" y="{}" font-family="sans-serif" font-size="12" fill="#777777">Last refreshed: {as_of}</text>"##,
            height - 24
        )?;
        svg.push_str("</svg>\n");

        Ok(svg.into_bytes())
    }
}

/// Countries with an estimate, largest first; ties keep snapshot order.
#[must_use]
pub fn top_by_estimated_gdp(snapshot: &[CountryRecord], limit: usize) -> Vec<&CountryRecord> {
    let mut ranked: Vec<&CountryRecord> = snapshot
        .iter()
        .filter(|country| country.estimated_gdp.is_some())
        .collect();
    ranked.sort_by(|lhs, rhs| {
        rhs.estimated_gdp
            .partial_cmp(&lhs.estimated_gdp)
            .unwrap_or(Ordering::Equal)
    });
    ranked.truncate(limit);
    ranked
}

/// Renders `snapshot` and writes it to `path`, replacing any previous file.
///
/// The bytes go to a sibling temp file first so readers never observe a
/// partial artifact.
///
/// # Errors
/// Returns an error when rendering fails or the file cannot be written.
pub fn write_artifact(
    renderer: &dyn ArtifactRenderer,
    snapshot: &[CountryRecord],
    as_of: OffsetDateTime,
    path: &Path,
) -> Result<usize> {
    let bytes = renderer.render(snapshot, as_of)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create artifact directory {}", parent.display()))?;
    }

    let staging = staging_path(path);
    fs::write(&staging, &bytes)
        .with_context(|| format!("failed to write artifact staging file {}", staging.display()))?;
    if let Err(err) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(err).with_context(|| format!("failed to move artifact into {}", path.display()));
    }

    Ok(bytes.len())
}

/// Reads a previously written artifact; `Ok(None)` when none exists yet.
///
/// # Errors
/// Returns an error for any I/O failure other than a missing file.
pub fn read_artifact(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read artifact at {}", path.display()))
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn escape_xml(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
