//! Theme generation: concatenates the storefront LESS tree into the three
//! sources OCC compiles and pushes them to the configured theme.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;
use walkdir::WalkDir;

use crate::config::Settings;
use crate::request::{OccApi, RequestSpec};

const VARIABLES_DIR: &str = "variables";
const ADDITIONAL_STYLES_DIR: &str = "additionalStyles";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeSources {
    pub styles: String,
    pub variables: String,
    pub additional_styles: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateReport {
    pub theme_id: String,
    pub output_dir: PathBuf,
    pub style_files: usize,
    pub variable_files: usize,
    pub additional_style_files: usize,
}

/// `.less` files one level below `less/<dir>/`, sorted by path.
fn less_files(less_root: &Path, dir: Option<&str>) -> Vec<PathBuf> {
    let mut files = WalkDir::new(less_root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "less"))
        .filter(|path| {
            let parent = path
                .parent()
                .and_then(Path::file_name)
                .and_then(|name| name.to_str())
                .unwrap_or_default();
            match dir {
                Some(dir) => parent == dir,
                None => parent != VARIABLES_DIR && parent != ADDITIONAL_STYLES_DIR,
            }
        })
        .collect::<Vec<_>>();
    files.sort();
    files
}

fn concat(files: &[PathBuf]) -> Result<String> {
    let contents = files
        .iter()
        .map(|path| fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display())))
        .collect::<Result<Vec<_>>>()?;
    Ok(contents.join("\n"))
}

/// Concatenate `<storefront>/less` into styles, variables and additional styles.
pub fn collect_sources(storefront_root: &Path) -> Result<(ThemeSources, [usize; 3])> {
    let less_root = storefront_root.join("less");
    if !less_root.is_dir() {
        bail!("theme sources not found: {} does not exist", less_root.display());
    }
    let styles = less_files(&less_root, None);
    let variables = less_files(&less_root, Some(VARIABLES_DIR));
    let additional = less_files(&less_root, Some(ADDITIONAL_STYLES_DIR));
    let sources = ThemeSources {
        styles: concat(&styles)?,
        variables: concat(&variables)?,
        additional_styles: concat(&additional)?,
    };
    Ok((sources, [styles.len(), variables.len(), additional.len()]))
}

/// Build the theme sources, keep a local copy under `themes/<name>_<id>` and push them.
pub fn generate(api: &dyn OccApi, settings: &Settings) -> Result<GenerateReport> {
    let (Some(theme_name), Some(theme_id)) = (&settings.theme_name, &settings.theme_id) else {
        bail!("theme name and id must be configured to generate the theme");
    };
    info!("Generating theme {theme_name} ({theme_id})...");
    let (sources, [style_files, variable_files, additional_style_files]) =
        collect_sources(&settings.storefront_root)?;

    let output_dir = settings
        .storefront_root
        .join("themes")
        .join(format!("{theme_name}_{theme_id}"));
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    for (file, content) in [
        ("styles.less", &sources.styles),
        ("variables.less", &sources.variables),
        ("additionalStyles.less", &sources.additional_styles),
    ] {
        let path = output_dir.join(file);
        fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
    }

    info!("Uploading theme sources...");
    api.request(RequestSpec::put(format!("themes/{theme_id}/source")).json(serde_json::to_value(&sources)?))
        .with_context(|| format!("failed to upload theme {theme_name}"))?;
    info!("Theme {theme_name} generated");
    Ok(GenerateReport {
        theme_id: theme_id.clone(),
        output_dir,
        style_files,
        variable_files,
        additional_style_files,
    })
}
