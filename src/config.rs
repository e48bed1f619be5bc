use color_eyre::eyre::eyre;
use color_eyre::Result;
use ratatui::style::Color;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use supports_color::Stream;

use dyntable_cli::Args;

use crate::layout::{LayoutCalculator, PAGE_SIZE_OPTIONS};
use crate::query::AggregateFunction;
use crate::refresh::{ColumnTyping, RefreshSettings};
use crate::render_rule::{ChartDefaults, Rgba};
use crate::value_range::NumericDetection;

pub const CONFIG_FILE: &str = "config.toml";

/// Manages config directory and config file operations
#[derive(Clone)]
pub struct ConfigManager {
    pub(crate) config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a ConfigManager with a custom config directory (primarily for testing)
    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    pub fn new(app_name: &str) -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| eyre!("Could not determine config directory"))?
            .join(app_name);

        Ok(Self { config_dir })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self, path: &str) -> PathBuf {
        self.config_dir.join(path)
    }

    pub fn ensure_config_dir(&self) -> Result<()> {
        if !self.config_dir.exists() {
            std::fs::create_dir_all(&self.config_dir)?;
        }
        Ok(())
    }

    pub fn generate_default_config(&self) -> String {
        DEFAULT_CONFIG_TEMPLATE.to_string()
    }

    /// Write the commented default template to `config.toml`
    pub fn write_default_config(&self, force: bool) -> Result<PathBuf> {
        let config_path = self.config_path(CONFIG_FILE);

        if config_path.exists() && !force {
            return Err(eyre!(
                "Config file already exists at {}. Use --force to overwrite.",
                config_path.display()
            ));
        }

        self.ensure_config_dir()?;
        std::fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE)?;

        Ok(config_path)
    }

    /// Read `config.toml`; a missing file yields the defaults.
    pub fn read_config(&self) -> Result<AppConfig> {
        let config_path = self.config_path(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(AppConfig::default());
        }

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            eyre!(
                "Failed to read config file at {}: {}",
                config_path.display(),
                e
            )
        })?;

        toml::from_str(&content).map_err(|e| {
            eyre!(
                "Failed to parse config file at {}: {}",
                config_path.display(),
                e
            )
        })
    }
}

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Configuration format version
    pub version: String,
    pub display: DisplayConfig,
    pub transport: TransportConfig,
    pub query: QueryConfig,
    pub layout: LayoutConfig,
    pub performance: PerformanceConfig,
    pub theme: ThemeConfig,
    pub debug: DebugConfig,
}

/// Chart-wide display defaults; form data and CLI flags override them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub align_positive_negative: bool,
    pub color_positive_negative: bool,
    pub show_cell_bars: bool,
    pub emit_cross_filters: bool,
    pub sort_desc: bool,
    pub allow_rearrange_columns: bool,
    pub page_size: usize,
    pub numeric_detection: NumericDetection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub protocol: String,
    pub host: String,
    pub endpoint: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Display name or code of the initial aggregate ("Sum", "COUNT_DISTINCT", ...)
    pub default_aggregate: String,
    pub column_typing: ColumnTyping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub scrollbar_size: u16,
    pub padding: u16,
    pub control_height: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub event_poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub color_mode: String,
    pub colors: ColorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub primary: String,
    pub secondary: String,
    pub error: String,
    pub dimmed: String,
    pub background: String,
    pub controls_bg: String,
    pub text_primary: String,
    pub text_secondary: String,
    pub table_header: String,
    pub table_border: String,
    pub table_selected: String,
    pub bar_positive: String,
    pub bar_negative: String,
    pub active_filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub enabled: bool,
    pub show_query: bool,
    pub show_generation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: "0.1".to_string(),
            display: DisplayConfig::default(),
            transport: TransportConfig::default(),
            query: QueryConfig::default(),
            layout: LayoutConfig::default(),
            performance: PerformanceConfig::default(),
            theme: ThemeConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            align_positive_negative: false,
            color_positive_negative: false,
            show_cell_bars: true,
            emit_cross_filters: true,
            sort_desc: false,
            allow_rearrange_columns: false,
            page_size: 0,
            numeric_detection: NumericDetection::FirstRow,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost:8088".to_string(),
            endpoint: crate::transport::CHART_DATA_ENDPOINT.to_string(),
            timeout_secs: 60,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_aggregate: "Sum".to_string(),
            column_typing: ColumnTyping::Coarse,
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        let calc = LayoutCalculator::default();
        Self {
            scrollbar_size: calc.scrollbar_size,
            padding: calc.padding,
            control_height: calc.control_height,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            event_poll_interval_ms: 25,
        }
    }
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            color_mode: "auto".to_string(),
            colors: ColorConfig::default(),
        }
    }
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            primary: "cyan".to_string(),
            secondary: "yellow".to_string(),
            error: "red".to_string(),
            dimmed: "dark_gray".to_string(),
            background: "black".to_string(),
            controls_bg: "indexed(236)".to_string(),
            text_primary: "white".to_string(),
            text_secondary: "dark_gray".to_string(),
            table_header: "white".to_string(),
            table_border: "cyan".to_string(),
            table_selected: "reversed".to_string(),
            bar_positive: "indexed(238)".to_string(),
            bar_negative: "#962020".to_string(),
            active_filter: "yellow".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            show_query: true,
            show_generation: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from all layers (default → user)
    pub fn load(app_name: &str) -> Result<Self> {
        let manager = ConfigManager::new(app_name)?;
        Self::load_with(&manager)
    }

    pub fn load_with(manager: &ConfigManager) -> Result<Self> {
        let mut config = AppConfig::default();
        config.merge(manager.read_config()?);
        config.validate()?;
        Ok(config)
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: AppConfig) {
        if other.version != AppConfig::default().version {
            self.version = other.version;
        }
        self.display.merge(other.display);
        self.transport.merge(other.transport);
        self.query.merge(other.query);
        self.layout.merge(other.layout);
        self.performance.merge(other.performance);
        self.theme.merge(other.theme);
        self.debug.merge(other.debug);
    }

    /// Apply command-line overrides, the last configuration layer
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = &args.host {
            self.transport.host = host.clone();
        }
        if let Some(protocol) = &args.protocol {
            self.transport.protocol = protocol.clone();
        }
        if let Some(endpoint) = &args.endpoint {
            self.transport.endpoint = endpoint.clone();
        }
        if let Some(timeout) = args.timeout_secs {
            self.transport.timeout_secs = timeout;
        }
        if let Some(aggregate) = args.aggregate {
            self.query.default_aggregate = aggregate.display_name().to_string();
        }
        if let Some(v) = args.align_positive_negative {
            self.display.align_positive_negative = v;
        }
        if let Some(v) = args.color_positive_negative {
            self.display.color_positive_negative = v;
        }
        if let Some(v) = args.show_cell_bars {
            self.display.show_cell_bars = v;
        }
        if let Some(v) = args.emit_cross_filters {
            self.display.emit_cross_filters = v;
        }
        if let Some(page_size) = args.page_size {
            self.display.page_size = page_size;
        }
        if args.debug {
            self.debug.enabled = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.version.starts_with("0.1") {
            return Err(eyre!(
                "Unsupported config version: {}. Expected 0.1.x",
                self.version
            ));
        }

        match self.transport.protocol.as_str() {
            "http" | "https" => {}
            other => {
                return Err(eyre!(
                    "Invalid protocol: {}. Must be 'http' or 'https'",
                    other
                ))
            }
        }
        if self.transport.host.trim().is_empty() {
            return Err(eyre!("transport.host must not be empty"));
        }
        if self.transport.timeout_secs == 0 {
            return Err(eyre!("timeout_secs must be greater than 0"));
        }

        self.default_aggregate()?;

        if !PAGE_SIZE_OPTIONS.contains(&self.display.page_size) {
            return Err(eyre!(
                "Invalid page_size: {}. Must be one of {:?}",
                self.display.page_size,
                PAGE_SIZE_OPTIONS
            ));
        }

        if self.performance.event_poll_interval_ms == 0 {
            return Err(eyre!("event_poll_interval_ms must be greater than 0"));
        }

        match self.theme.color_mode.as_str() {
            "light" | "dark" | "auto" => {}
            _ => {
                return Err(eyre!(
                    "Invalid color_mode: {}. Must be 'light', 'dark', or 'auto'",
                    self.theme.color_mode
                ))
            }
        }

        let parser = ColorParser::new();
        self.theme.colors.validate(&parser)?;

        Ok(())
    }

    pub fn default_aggregate(&self) -> Result<AggregateFunction> {
        self.query
            .default_aggregate
            .parse()
            .map_err(|e: String| eyre!("Invalid default_aggregate: {}", e))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.transport.timeout_secs)
    }

    pub fn chart_defaults(&self) -> ChartDefaults {
        let d = &self.display;
        ChartDefaults {
            align_positive_negative: d.align_positive_negative,
            color_positive_negative: d.color_positive_negative,
            show_cell_bars: d.show_cell_bars,
            emit_cross_filters: d.emit_cross_filters,
            is_raw_records: false,
            sort_desc: d.sort_desc,
            allow_rearrange_columns: d.allow_rearrange_columns,
            numeric_detection: d.numeric_detection,
        }
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            endpoint: self.transport.endpoint.clone(),
            chart_defaults: self.chart_defaults(),
            column_typing: self.query.column_typing,
            layout: LayoutCalculator {
                scrollbar_size: self.layout.scrollbar_size,
                padding: self.layout.padding,
                control_height: self.layout.control_height,
            },
            page_size: self.display.page_size,
        }
    }
}

impl DisplayConfig {
    pub fn merge(&mut self, other: Self) {
        let default = DisplayConfig::default();
        if other.align_positive_negative != default.align_positive_negative {
            self.align_positive_negative = other.align_positive_negative;
        }
        if other.color_positive_negative != default.color_positive_negative {
            self.color_positive_negative = other.color_positive_negative;
        }
        if other.show_cell_bars != default.show_cell_bars {
            self.show_cell_bars = other.show_cell_bars;
        }
        if other.emit_cross_filters != default.emit_cross_filters {
            self.emit_cross_filters = other.emit_cross_filters;
        }
        if other.sort_desc != default.sort_desc {
            self.sort_desc = other.sort_desc;
        }
        if other.allow_rearrange_columns != default.allow_rearrange_columns {
            self.allow_rearrange_columns = other.allow_rearrange_columns;
        }
        if other.page_size != default.page_size {
            self.page_size = other.page_size;
        }
        if other.numeric_detection != default.numeric_detection {
            self.numeric_detection = other.numeric_detection;
        }
    }
}

impl TransportConfig {
    pub fn merge(&mut self, other: Self) {
        let default = TransportConfig::default();
        if other.protocol != default.protocol {
            self.protocol = other.protocol;
        }
        if other.host != default.host {
            self.host = other.host;
        }
        if other.endpoint != default.endpoint {
            self.endpoint = other.endpoint;
        }
        if other.timeout_secs != default.timeout_secs {
            self.timeout_secs = other.timeout_secs;
        }
    }
}

impl QueryConfig {
    pub fn merge(&mut self, other: Self) {
        let default = QueryConfig::default();
        if other.default_aggregate != default.default_aggregate {
            self.default_aggregate = other.default_aggregate;
        }
        if other.column_typing != default.column_typing {
            self.column_typing = other.column_typing;
        }
    }
}

impl LayoutConfig {
    pub fn merge(&mut self, other: Self) {
        let default = LayoutConfig::default();
        if other.scrollbar_size != default.scrollbar_size {
            self.scrollbar_size = other.scrollbar_size;
        }
        if other.padding != default.padding {
            self.padding = other.padding;
        }
        if other.control_height != default.control_height {
            self.control_height = other.control_height;
        }
    }
}

impl PerformanceConfig {
    pub fn merge(&mut self, other: Self) {
        let default = PerformanceConfig::default();
        if other.event_poll_interval_ms != default.event_poll_interval_ms {
            self.event_poll_interval_ms = other.event_poll_interval_ms;
        }
    }
}

impl ThemeConfig {
    pub fn merge(&mut self, other: Self) {
        let default = ThemeConfig::default();
        if other.color_mode != default.color_mode {
            self.color_mode = other.color_mode;
        }
        self.colors.merge(other.colors);
    }
}

/// Visits every (name, value) color pair of a `ColorConfig`
macro_rules! color_fields {
    ($mac:ident, $($arg:tt),*) => {
        $mac!(
            $($arg),*;
            primary,
            secondary,
            error,
            dimmed,
            background,
            controls_bg,
            text_primary,
            text_secondary,
            table_header,
            table_border,
            table_selected,
            bar_positive,
            bar_negative,
            active_filter
        )
    };
}

impl ColorConfig {
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        macro_rules! list {
            ($c:tt; $($field:ident),*) => {
                vec![$((stringify!($field), $c.$field.as_str())),*]
            };
        }
        color_fields!(list, self)
    }

    fn validate(&self, parser: &ColorParser) -> Result<()> {
        for (name, value) in self.entries() {
            parser
                .parse(value)
                .map_err(|e| eyre!("Invalid color value for '{}': {}", name, e))?;
        }
        Ok(())
    }

    pub fn merge(&mut self, other: Self) {
        let default = ColorConfig::default();
        macro_rules! merge_fields {
            ($s:tt, $o:tt, $d:tt; $($field:ident),*) => {
                $(
                    if $o.$field != $d.$field {
                        $s.$field = $o.$field;
                    }
                )*
            };
        }
        color_fields!(merge_fields, self, other, default);
    }
}

impl DebugConfig {
    pub fn merge(&mut self, other: Self) {
        let default = DebugConfig::default();
        if other.enabled != default.enabled {
            self.enabled = other.enabled;
        }
        if other.show_query != default.show_query {
            self.show_query = other.show_query;
        }
        if other.show_generation != default.show_generation {
            self.show_generation = other.show_generation;
        }
    }
}

const NAMED_COLORS: &[(&[&str], Color)] = &[
    (&["black"], Color::Black),
    (&["red"], Color::Red),
    (&["green"], Color::Green),
    (&["yellow"], Color::Yellow),
    (&["blue"], Color::Blue),
    (&["magenta"], Color::Magenta),
    (&["cyan"], Color::Cyan),
    (&["white"], Color::White),
    (&["bright_black", "gray", "grey"], Color::Indexed(8)),
    (&["bright_red"], Color::Indexed(9)),
    (&["bright_green"], Color::Indexed(10)),
    (&["bright_yellow"], Color::Indexed(11)),
    (&["bright_blue"], Color::Indexed(12)),
    (&["bright_magenta"], Color::Indexed(13)),
    (&["bright_cyan"], Color::Indexed(14)),
    (&["bright_white"], Color::Indexed(15)),
    (&["dark_gray", "dark_grey"], Color::Indexed(8)),
    (&["light_gray", "light_grey"], Color::Indexed(7)),
    (&["reset", "reversed"], Color::Reset),
];

/// Color parser with terminal capability detection
pub struct ColorParser {
    supports_true_color: bool,
    supports_256: bool,
    no_color: bool,
}

impl ColorParser {
    /// Create a new ColorParser with automatic terminal capability detection
    pub fn new() -> Self {
        let no_color = std::env::var("NO_COLOR").is_ok();
        let support = supports_color::on(Stream::Stdout);

        Self {
            supports_true_color: support.as_ref().map(|s| s.has_16m).unwrap_or(false),
            supports_256: support.as_ref().map(|s| s.has_256).unwrap_or(false),
            no_color,
        }
    }

    /// Parser with fixed capabilities, independent of the environment
    pub fn with_capabilities(true_color: bool, has_256: bool) -> Self {
        Self {
            supports_true_color: true_color,
            supports_256: has_256,
            no_color: false,
        }
    }

    /// Parse a named color, `indexed(n)`, `#rrggbb` or `rgb(...)`/`rgba(...)`.
    pub fn parse(&self, s: &str) -> Result<Color> {
        if self.no_color {
            return Ok(Color::Reset);
        }

        let trimmed = s.trim();
        let lower = trimmed.to_lowercase();

        if trimmed.starts_with('#') || lower.starts_with("rgb") {
            let rgba: Rgba = trimmed.parse().map_err(|e: String| eyre!(e))?;
            return Ok(self.rgb(rgba.r, rgba.g, rgba.b));
        }

        if let Some(inner) = lower
            .strip_prefix("indexed(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let num = inner.trim().parse::<u8>().map_err(|_| {
                eyre!(
                    "Invalid indexed color: '{}'. Expected format: indexed(0-255)",
                    trimmed
                )
            })?;
            return Ok(Color::Indexed(num));
        }

        let key = lower.replace(' ', "_");
        NAMED_COLORS
            .iter()
            .find(|(names, _)| names.contains(&key.as_str()))
            .map(|(_, color)| *color)
            .ok_or_else(|| {
                eyre!(
                    "Unknown color name: '{}'. Supported: basic ANSI colors (red, blue, etc.), \
                     bright variants (bright_red, etc.), indexed(n), or hex colors (#ff0000)",
                    trimmed
                )
            })
    }

    /// Terminal color for a translucent web color composited over a background.
    pub fn blend(&self, color: &Rgba, background: (u8, u8, u8)) -> Color {
        if self.no_color {
            return Color::Reset;
        }
        let a = color.a.clamp(0.0, 1.0);
        let mix = |fg: u8, bg: u8| (f64::from(fg) * a + f64::from(bg) * (1.0 - a)).round() as u8;
        self.rgb(
            mix(color.r, background.0),
            mix(color.g, background.1),
            mix(color.b, background.2),
        )
    }

    fn rgb(&self, r: u8, g: u8, b: u8) -> Color {
        if self.supports_true_color {
            Color::Rgb(r, g, b)
        } else if self.supports_256 {
            Color::Indexed(rgb_to_256_color(r, g, b))
        } else {
            rgb_to_basic_ansi(r, g, b)
        }
    }
}

impl Default for ColorParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest index in the xterm 256-color palette
pub fn rgb_to_256_color(r: u8, g: u8, b: u8) -> u8 {
    let spread = i16::from(r.max(g).max(b)) - i16::from(r.min(g).min(b));
    if spread < 10 {
        let gray = (u16::from(r) + u16::from(g) + u16::from(b)) / 3;
        return match gray {
            0..=7 => 16,
            248.. => 231,
            _ => 232 + ((gray - 8) * 24 / 240) as u8,
        };
    }
    let level = |c: u8| (u16::from(c) * 5 / 255) as u8;
    16 + 36 * level(r) + 6 * level(g) + level(b)
}

/// Nearest of the 8 basic ANSI colors
pub fn rgb_to_basic_ansi(r: u8, g: u8, b: u8) -> Color {
    let spread = i16::from(r.max(g).max(b)) - i16::from(r.min(g).min(b));
    if spread < 30 {
        let avg = (u16::from(r) + u16::from(g) + u16::from(b)) / 3;
        return if avg < 64 { Color::Black } else { Color::White };
    }
    match (r > 128, g > 128, b > 128) {
        (false, false, false) => Color::Black,
        (true, false, false) => Color::Red,
        (false, true, false) => Color::Green,
        (true, true, false) => Color::Yellow,
        (false, false, true) => Color::Blue,
        (true, false, true) => Color::Magenta,
        (false, true, true) => Color::Cyan,
        (true, true, true) => Color::White,
    }
}

/// Parsed theme colors, looked up by config key
#[derive(Debug, Clone)]
pub struct Theme {
    pub colors: HashMap<String, Color>,
}

impl Theme {
    pub fn from_config(config: &ThemeConfig) -> Result<Self> {
        let parser = ColorParser::new();
        let colors = config
            .colors
            .entries()
            .into_iter()
            .map(|(name, value)| -> Result<(String, Color)> {
                Ok((name.to_string(), parser.parse(value)?))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { colors })
    }

    /// Color by name, `Reset` when unknown
    pub fn get(&self, name: &str) -> Color {
        self.colors.get(name).copied().unwrap_or(Color::Reset)
    }

    pub fn get_optional(&self, name: &str) -> Option<Color> {
        self.colors.get(name).copied()
    }
}

impl Default for Theme {
    fn default() -> Self {
        Self::from_config(&ThemeConfig::default()).unwrap_or_else(|_| Self {
            colors: HashMap::new(),
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../config/default.toml");
