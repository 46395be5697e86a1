//! YAML configuration and hot reload.

use crate::orchestrator::FallbackMode;
use anyhow::{anyhow, Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use tracing::{debug, error, info, warn};

/// Everything the binary reads from `--config`. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `.slangp` preset to load. No preset means the passthrough only.
    pub preset: Option<PathBuf>,
    pub shaders_enabled: bool,
    pub fallback: FallbackMode,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Family used by the demo scene.
    pub font_family: String,
    /// Extra font files registered next to the system fonts.
    pub font_files: Vec<PathBuf>,
    /// Preset parameter overrides.
    pub parameters: BTreeMap<String, f32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preset: None,
            shaders_enabled: true,
            fallback: FallbackMode::Passthrough,
            width: 960,
            height: 720,
            fps: 60,
            font_family: "monospace".to_string(),
            font_files: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        Ok(config.sanitized())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        Self::from_yaml(&text).with_context(|| format!("Failed to parse config {:?}", path))
    }

    /// Relative paths in the file are taken relative to the file itself.
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        let resolve = |p: &PathBuf| if p.is_relative() { base.join(p) } else { p.clone() };
        self.preset = self.preset.as_ref().map(resolve);
        self.font_files = self.font_files.iter().map(resolve).collect();
        self
    }

    fn sanitized(mut self) -> Self {
        self.width = self.width.max(1);
        self.height = self.height.max(1);
        self.fps = self.fps.clamp(1, 240);
        self
    }
}

/// How a reloaded config differs from the running one, field by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    /// The new preset, `Some(None)` when the preset was removed.
    pub preset: Option<Option<PathBuf>>,
    pub shaders_enabled: Option<bool>,
    pub fallback: Option<FallbackMode>,
    /// Added or changed parameters. Removed keys keep their last value.
    pub parameters: Vec<(String, f32)>,
    pub canvas_size: Option<(u32, u32)>,
    pub fps: Option<u32>,
    pub font_family: Option<String>,
    pub font_files: bool,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Config {
    /// Changes needed to go from `self` to `next`.
    pub fn diff(&self, next: &Config) -> ConfigDiff {
        fn changed<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
            (old != new).then(|| new.clone())
        }
        ConfigDiff {
            preset: changed(&self.preset, &next.preset),
            shaders_enabled: changed(&self.shaders_enabled, &next.shaders_enabled),
            fallback: changed(&self.fallback, &next.fallback),
            parameters: next
                .parameters
                .iter()
                .filter(|(name, value)| self.parameters.get(*name) != Some(*value))
                .map(|(name, value)| (name.clone(), *value))
                .collect(),
            canvas_size: changed(&(self.width, self.height), &(next.width, next.height)),
            fps: changed(&self.fps, &next.fps),
            font_family: changed(&self.font_family, &next.font_family),
            font_files: self.font_files != next.font_files,
        }
    }
}

/// Reloads a config file when it is saved.
///
/// The parent directory is watched, since editors often save by writing a
/// temporary file and renaming it over the original.
pub struct ConfigWatcher {
    file: PathBuf,
    current: Config,
    events: Receiver<notify::Result<Event>>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Load `file` and start watching it.
    pub fn new(file: &Path) -> Result<Self> {
        let file = file
            .canonicalize()
            .with_context(|| format!("Config file {:?} does not exist", file))?;
        let dir = file
            .parent()
            .ok_or_else(|| anyhow!("Config file {:?} has no parent directory", file))?;
        let current = Config::load(&file)?.resolve_paths(dir);

        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(tx).context("Failed to create config watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", dir))?;
        info!("Watching {:?} for changes", file);

        Ok(Self {
            file,
            current,
            events,
            _watcher: watcher,
        })
    }

    /// The last config read from the file, paths resolved.
    pub fn current(&self) -> &Config {
        &self.current
    }

    /// Drain pending file events and reload if one of them touched the file.
    ///
    /// Returns the new config only when it parses and differs from the last one.
    pub fn poll(&mut self) -> Option<Config> {
        let mut touched = false;
        for event in self.events.try_iter() {
            match event {
                Ok(event) => touched |= touches(&event, &self.file),
                Err(e) => warn!("Config watcher error: {}", e),
            }
        }
        if touched {
            self.reload()
        } else {
            None
        }
    }

    fn reload(&mut self) -> Option<Config> {
        let base = self.file.parent().unwrap_or(Path::new("."));
        let next = match Config::load(&self.file) {
            Ok(config) => config.resolve_paths(base),
            Err(e) => {
                error!("{:#}, keeping the running config", e);
                return None;
            }
        };
        if self.current.diff(&next).is_empty() {
            debug!("Config saved without changes");
            return None;
        }
        info!("Config file changed");
        self.current = next.clone();
        Some(next)
    }
}

/// Whether `event` may have changed `file`'s contents.
fn touches(event: &Event, file: &Path) -> bool {
    !matches!(event.kind, EventKind::Access(_)) && event.paths.iter().any(|path| path == file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_file_parses() {
        let config = Config::from_yaml(
            r#"
preset: shaders/crt-bezel-4.slangp
shaders_enabled: false
fallback: blank
width: 640
height: 480
fps: 30
font_family: "Press Start 2P"
font_files: [fonts/arcade.ttf]
parameters:
  SCANLINE_STRENGTH: 0.6
"#,
        )
        .unwrap();

        assert_eq!(config.preset, Some(PathBuf::from("shaders/crt-bezel-4.slangp")));
        assert!(!config.shaders_enabled);
        assert_eq!(config.fallback, FallbackMode::Blank);
        assert_eq!((config.width, config.height, config.fps), (640, 480, 30));
        assert_eq!(config.font_family, "Press Start 2P");
        assert_eq!(config.parameters.get("SCANLINE_STRENGTH"), Some(&0.6));
    }

    #[test]
    fn missing_keys_use_defaults() {
        let config = Config::from_yaml("fps: 0\n").unwrap();
        assert_eq!(config.fps, 1);
        assert!(config.shaders_enabled);
        assert_eq!(config.fallback, FallbackMode::Passthrough);
        assert!(config.preset.is_none());
    }

    #[test]
    fn unknown_fallback_is_an_error() {
        assert!(Config::from_yaml("fallback: sparkles\n").is_err());
    }

    #[test]
    fn relative_paths_follow_the_file() {
        let config = Config::from_yaml("preset: crt.slangp\nfont_files: [/abs/font.ttf]\n")
            .unwrap()
            .resolve_paths(Path::new("/etc/scanline"));
        assert_eq!(config.preset, Some(PathBuf::from("/etc/scanline/crt.slangp")));
        assert_eq!(config.font_files, vec![PathBuf::from("/abs/font.ttf")]);
    }

    #[test]
    fn diff_lists_only_what_changed() {
        let old = Config::from_yaml("preset: a.slangp\nparameters: {GLOW: 0.5, MASK: 1.0}\n").unwrap();
        assert!(old.diff(&old.clone()).is_empty());

        let new = Config::from_yaml(
            "preset: b.slangp\nfallback: blank\nwidth: 640\nparameters: {GLOW: 0.5, MASK: 2.0, CURVE: 0.1}\n",
        )
        .unwrap();
        let diff = old.diff(&new);
        assert_eq!(diff.preset, Some(Some(PathBuf::from("b.slangp"))));
        assert_eq!(diff.fallback, Some(FallbackMode::Blank));
        assert_eq!(diff.canvas_size, Some((640, 720)));
        assert_eq!(
            diff.parameters,
            vec![("CURVE".to_string(), 0.1), ("MASK".to_string(), 2.0)]
        );
        assert_eq!(diff.shaders_enabled, None);
        assert_eq!(diff.fps, None);
        assert!(!diff.font_files);

        let unset = new.diff(&Config::default());
        assert_eq!(unset.preset, Some(None));
        assert!(unset.parameters.is_empty());
    }

    #[test]
    fn only_writes_to_the_watched_file_count() {
        let file = Path::new("/etc/scanline/config.yaml");
        let write = Event::new(EventKind::Modify(notify::event::ModifyKind::Any)).add_path(file.to_path_buf());
        let rename = Event::new(EventKind::Create(notify::event::CreateKind::File)).add_path(file.to_path_buf());
        let read = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(file.to_path_buf());
        let other = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(PathBuf::from("/etc/scanline/other.yaml"));
        assert!(touches(&write, file));
        assert!(touches(&rename, file));
        assert!(!touches(&read, file));
        assert!(!touches(&other, file));
    }

    #[test]
    fn reload_keeps_the_running_config_on_bad_or_unchanged_saves() {
        let dir = std::env::temp_dir().join(format!("scanline-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("config.yaml");
        fs::write(&file, "fps: 30\n").unwrap();
        let mut watcher = ConfigWatcher::new(&file).unwrap();
        assert_eq!(watcher.current().fps, 30);

        fs::write(&file, "fps: 30\n").unwrap();
        assert_eq!(watcher.reload(), None);

        fs::write(&file, "fps: [not a number\n").unwrap();
        assert_eq!(watcher.reload(), None);
        assert_eq!(watcher.current().fps, 30);

        fs::write(&file, "fps: 50\npreset: crt.slangp\n").unwrap();
        let reloaded = watcher.reload().unwrap();
        assert_eq!(reloaded.fps, 50);
        assert_eq!(reloaded.preset, Some(watcher.file.with_file_name("crt.slangp")));

        fs::remove_dir_all(&dir).unwrap();
    }
}
