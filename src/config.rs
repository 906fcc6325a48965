//! Runtime configuration and source list loading.
//!
//! Every tunable has a default, so an absent config file is a valid setup.
//! A YAML file may override any subset of fields; command-line flags are
//! layered on top by [`Config::apply_cli`].
//!
//! Per-origin tables (retention caps, category overrides, boilerplate rules)
//! are keyed by the origin identifier, see [`crate::origin::Origin::name`].

use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::cli::Cli;
use crate::error::{Error, Result};
use crate::models::Source;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Tighter retention for origins that publish far more than the rest.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetentionRule {
    /// Lookback for this origin; the common lookback when absent.
    #[serde(default)]
    pub lookback_hours: Option<f64>,
    /// Keep only this many of the origin's newest records.
    pub max_items: usize,
}

/// Boilerplate removal rules for one origin.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BoilerplateRules {
    /// Elements whose `class` contains any of these are removed.
    pub class_fragments: Vec<String>,
    /// Elements whose own text contains any of these are removed.
    pub phrases: Vec<String>,
    /// Short "related articles" style headers. When one sits in the latter
    /// part of the document it is removed together with everything after it.
    pub tail_markers: Vec<String>,
    /// Regexes; short elements whose text matches are removed.
    pub line_patterns: Vec<String>,
    /// Image URLs containing any of these are dropped.
    pub noise_images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Simultaneous network operations across the whole run.
    pub concurrency: usize,
    pub user_agent: String,
    pub page_timeout_secs: u64,
    pub image_timeout_secs: u64,
    pub fulltext_ttl_hours: f64,
    pub image_ttl_hours: f64,
    pub cache_gc_days: f64,
    pub lookback_hours: f64,
    pub max_items: usize,
    /// Offset of the reference timezone from UTC.
    pub tz_offset_hours: i32,
    pub localize_images: bool,
    pub data_dir: PathBuf,
    pub image_dir: PathBuf,
    pub output: PathBuf,
    pub high_volume: BTreeMap<String, RetentionRule>,
    pub category_overrides: BTreeMap<String, String>,
    /// Keyed by origin name; `default` applies to origins without an entry.
    pub boilerplate: BTreeMap<String, BoilerplateRules>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            page_timeout_secs: 18,
            image_timeout_secs: 15,
            fulltext_ttl_hours: 6.0,
            image_ttl_hours: 24.0,
            cache_gc_days: 7.0,
            lookback_hours: 6.0,
            max_items: 200,
            tz_offset_hours: 8,
            localize_images: true,
            data_dir: PathBuf::from("data"),
            image_dir: PathBuf::from("site/images"),
            output: PathBuf::from("site/snapshot.json"),
            high_volume: default_high_volume(),
            category_overrides: BTreeMap::new(),
            boilerplate: default_boilerplate(),
        }
    }
}

fn rule(lookback_hours: Option<f64>, max_items: usize) -> RetentionRule {
    RetentionRule {
        lookback_hours,
        max_items,
    }
}

fn default_high_volume() -> BTreeMap<String, RetentionRule> {
    BTreeMap::from([
        ("cnbeta".to_string(), rule(Some(3.0), 20)),
        ("hk01".to_string(), rule(None, 20)),
        ("oncc".to_string(), rule(None, 30)),
        ("thewitness".to_string(), rule(None, 20)),
    ])
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const COMMON_CLASS_FRAGMENTS: &[&str] = &["related", "keyword", "share", "social", "breadcrumb"];

fn default_boilerplate() -> BTreeMap<String, BoilerplateRules> {
    let common = strings(COMMON_CLASS_FRAGMENTS);
    let with_common = |extra: &[&str]| {
        let mut fragments = common.clone();
        fragments.extend(strings(extra));
        fragments
    };

    let rthk = BoilerplateRules {
        class_fragments: with_common(&["facebook", "twitter"]),
        phrases: strings(&["分享工具", "列印"]),
        line_patterns: strings(&[r"\d{4}-\d{2}-\d{2}\s+HKT\s+\d{2}:\d{2}"]),
        ..Default::default()
    };
    let mingpao = BoilerplateRules {
        class_fragments: common.clone(),
        phrases: strings(&["相關字詞", "報道詳情", "編輯推介", "熱門HOTPICK", "其他報道"]),
        ..Default::default()
    };
    let singtao = BoilerplateRules {
        class_fragments: with_common(&[
            "article-title",
            "time",
            "hit-articles",
            "hit-block",
            "hit-img",
            "recommend",
        ]),
        phrases: strings(&[
            "同場加映",
            "星島頭條App",
            "即睇減息部署",
            "立即下載",
            "相關閱讀",
            "相關閲讀",
            "延伸閱讀",
            "來源網址",
            "相關新聞",
            "相關文章",
            "最Hit",
            "更新時間",
            "發佈時間",
            "上車驗樓",
        ]),
        noise_images: strings(&[
            "sthlstatic.com/sthl/assets/icons",
            "sthlstatic.com/sthl/assets/images/logo",
        ]),
        ..Default::default()
    };
    let cnbeta = BoilerplateRules {
        class_fragments: with_common(&["cnbeta-item"]),
        tail_markers: strings(&[
            "相关文章", "相關文章", "访问:", "訪問:", "访问：", "訪問：", "來源：", "来源：",
            "话题：", "話題：", "更多：", "更多:", "分享到：", "分享到:", "相关连结", "相關連結",
            "相關新聞", "相关新闻", "延伸閱讀", "延伸阅读", "相關閲讀", "相关阅读",
        ]),
        noise_images: strings(&["recommend", "thumb", "logo", "icon", "ads", "avatar"]),
        ..Default::default()
    };
    let default = BoilerplateRules {
        class_fragments: common,
        ..Default::default()
    };

    BTreeMap::from([
        ("rthk".to_string(), rthk),
        ("mingpao".to_string(), mingpao),
        ("singtao".to_string(), singtao),
        ("cnbeta".to_string(), cnbeta),
        ("default".to_string(), default),
    ])
}

impl Config {
    /// Load configuration from a YAML file, or defaults when `path` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse, or if
    /// the resulting values are out of range.
    #[instrument(level = "info", skip_all)]
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
                let config: Config = serde_yaml::from_str(&raw)?;
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Layer command-line overrides on top of the file configuration.
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<()> {
        if let Some(dir) = &cli.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(dir) = &cli.image_dir {
            self.image_dir = dir.clone();
        }
        if let Some(output) = &cli.output {
            self.output = output.clone();
        }
        if let Some(n) = cli.concurrency {
            self.concurrency = n;
        }
        if let Some(hours) = cli.lookback_hours {
            self.lookback_hours = hours;
        }
        if let Some(n) = cli.max_items {
            self.max_items = n;
        }
        if cli.no_localize {
            self.localize_images = false;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if !(self.lookback_hours > 0.0) {
            return Err(Error::Config("lookback_hours must be positive".into()));
        }
        if self.tz_offset_hours.abs() > 14 {
            return Err(Error::Config(format!(
                "tz_offset_hours out of range: {}",
                self.tz_offset_hours
            )));
        }
        Ok(())
    }

    /// The reference timezone.
    pub fn tz(&self) -> FixedOffset {
        FixedOffset::east_opt(self.tz_offset_hours * 3600).unwrap_or(Utc.fix())
    }

    pub fn lookback(&self) -> Duration {
        hours(self.lookback_hours)
    }

    /// Boilerplate rules for an origin, falling back to the `default` entry.
    pub fn boilerplate_for(&self, origin: &str) -> BoilerplateRules {
        self.boilerplate
            .get(origin)
            .or_else(|| self.boilerplate.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

/// Fractional hours as a chrono duration.
pub fn hours(value: f64) -> Duration {
    Duration::seconds((value * 3600.0) as i64)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceSpec {
    Url(String),
    Full(Source),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceFile {
    List(Vec<SourceSpec>),
    Wrapped { feeds: Vec<SourceSpec> },
}

/// Parse a source list from JSON or YAML text.
///
/// Accepted shapes: a list of URLs, a list of `{url, name?, category?}`
/// objects (mixed freely), or either wrapped as `{feeds: [...]}`. Blank
/// URLs are skipped.
pub fn parse_sources(raw: &str) -> Result<Vec<Source>> {
    // YAML is a superset of JSON, so one parser covers both.
    let file: SourceFile = serde_yaml::from_str(raw)?;
    let specs = match file {
        SourceFile::List(specs) | SourceFile::Wrapped { feeds: specs } => specs,
    };
    Ok(specs
        .into_iter()
        .map(|spec| match spec {
            SourceSpec::Url(url) => Source::new(url.trim()),
            SourceSpec::Full(mut source) => {
                source.url = source.url.trim().to_string();
                source
            }
        })
        .filter(|source| !source.url.is_empty())
        .collect())
}

/// Read and parse the source list file.
///
/// # Errors
///
/// An unreadable or unparsable source list is terminal for the run.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn load_sources(path: &Path) -> Result<Vec<Source>> {
    let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let sources = parse_sources(&raw)?;
    if sources.is_empty() {
        return Err(Error::Config(format!(
            "source list {} contains no sources",
            path.display()
        )));
    }
    info!(count = sources.len(), "Loaded source list");
    Ok(sources)
}
