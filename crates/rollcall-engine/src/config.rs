use rollcall_core::{MatchPolicy, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming an optional TOML configuration file.
pub const CONFIG_FILE_VAR: &str = "ROLLCALL_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration.
///
/// Values come from defaults, then the TOML file named by `ROLLCALL_CONFIG`
/// (if set), then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory of reference images.
    pub known_faces_dir: PathBuf,
    /// Attendance CSV file.
    pub attendance_file: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    ///
    /// For the unit-length ArcFace vectors produced by the bundled extractor,
    /// distance `d` corresponds to cosine similarity `1 - d²/2`, so the
    /// default 0.6 only accepts pairs with cosine ≥ 0.82. That is stricter
    /// than the usual ArcFace operating point (cosine around 0.4 to 0.5,
    /// i.e. distance 1.0 to 1.1); raise it if enrolled people come back as
    /// unknown. Must be finite and non-negative.
    pub match_threshold: f32,
    pub match_policy: MatchPolicy,
    /// V4L2 device path for `watch`.
    pub camera_device: String,
    /// Frames discarded after the camera starts streaming.
    pub warmup_frames: usize,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

/// Keys accepted in the TOML file. All optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    known_faces_dir: Option<PathBuf>,
    attendance_file: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    match_policy: Option<MatchPolicy>,
    camera_device: Option<String>,
    warmup_frames: Option<usize>,
    intra_threads: Option<usize>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` in place of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from(lookup("HOME").unwrap_or_else(|| "/tmp".to_string()))
                    .join(".local/share")
            })
            .join("rollcall");

        let mut config = Self {
            known_faces_dir: data_dir.join("known_faces"),
            attendance_file: data_dir.join("attendance.csv"),
            model_dir: PathBuf::from("/usr/share/rollcall/models"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            match_policy: MatchPolicy::default(),
            camera_device: "/dev/video0".to_string(),
            warmup_frames: 4,
            intra_threads: 2,
        };

        if let Some(path) = lookup(CONFIG_FILE_VAR) {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(&lookup);
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), "config file loaded");

        if let Some(v) = file.known_faces_dir {
            self.known_faces_dir = v;
        }
        if let Some(v) = file.attendance_file {
            self.attendance_file = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.match_threshold {
            self.set_threshold(v, "match_threshold");
        }
        if let Some(v) = file.match_policy {
            self.match_policy = v;
        }
        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        if let Some(v) = file.intra_threads {
            self.intra_threads = v;
        }
        Ok(())
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_KNOWN_FACES_DIR") {
            self.known_faces_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_ATTENDANCE_FILE") {
            self.attendance_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        let mut threshold = self.match_threshold;
        parse_into(lookup, "ROLLCALL_MATCH_THRESHOLD", &mut threshold);
        self.set_threshold(threshold, "ROLLCALL_MATCH_THRESHOLD");
        parse_into(lookup, "ROLLCALL_MATCH_POLICY", &mut self.match_policy);
        parse_into(lookup, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        parse_into(lookup, "ROLLCALL_INTRA_THREADS", &mut self.intra_threads);
    }

    /// NaN or a negative threshold would make every face unknown.
    fn set_threshold(&mut self, value: f32, key: &str) {
        if value.is_finite() && value >= 0.0 {
            self.match_threshold = value;
        } else {
            tracing::warn!(key, value, "ignoring invalid match threshold");
        }
    }
}

/// Overwrite `slot` with the parsed value of `key`; unparsable values are
/// ignored with a warning.
fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable config value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("HOME", "/home/ann")]).unwrap();
        assert_eq!(
            config.known_faces_dir,
            PathBuf::from("/home/ann/.local/share/rollcall/known_faces")
        );
        assert_eq!(
            config.attendance_file,
            PathBuf::from("/home/ann/.local/share/rollcall/attendance.csv")
        );
        assert_eq!(config.model_dir, PathBuf::from("/usr/share/rollcall/models"));
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.match_policy, MatchPolicy::First);
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.warmup_frames, 4);
        assert_eq!(config.intra_threads, 2);
    }

    #[test]
    fn test_xdg_data_home() {
        let config = load(&[("XDG_DATA_HOME", "/data")]).unwrap();
        assert_eq!(config.known_faces_dir, PathBuf::from("/data/rollcall/known_faces"));
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            ("ROLLCALL_MATCH_THRESHOLD", "0.45"),
            ("ROLLCALL_MATCH_POLICY", "nearest"),
            ("ROLLCALL_ATTENDANCE_FILE", "/srv/att.csv"),
            ("ROLLCALL_INTRA_THREADS", "lots"),
        ])
        .unwrap();
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.match_policy, MatchPolicy::Nearest);
        assert_eq!(config.attendance_file, PathBuf::from("/srv/att.csv"));
        // Unparsable value keeps the default.
        assert_eq!(config.intra_threads, 2);
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            "match_threshold = 0.5\nmatch_policy = \"nearest\"\ncamera_device = \"/dev/video2\"\n",
        )
        .unwrap();

        let config = load(&[
            (CONFIG_FILE_VAR, path.to_str().unwrap()),
            ("ROLLCALL_CAMERA_DEVICE", "/dev/video4"),
        ])
        .unwrap();
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.match_policy, MatchPolicy::Nearest);
        assert_eq!(config.camera_device, "/dev/video4");
    }

    #[test]
    fn test_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            load(&[(CONFIG_FILE_VAR, missing.to_str().unwrap())]),
            Err(ConfigError::Read { .. })
        ));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "threshold = 0.5\n").unwrap();
        assert!(matches!(
            load(&[(CONFIG_FILE_VAR, bad.to_str().unwrap())]),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        for bad in ["nan", "NaN", "-0.2", "inf"] {
            let config = load(&[("ROLLCALL_MATCH_THRESHOLD", bad)]).unwrap();
            assert_eq!(config.match_threshold, 0.6, "accepted {bad}");
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "match_threshold = -1.0\n").unwrap();
        let config = load(&[
            (CONFIG_FILE_VAR, path.to_str().unwrap()),
            ("ROLLCALL_WARMUP_FRAMES", "0"),
        ])
        .unwrap();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.warmup_frames, 0);
    }
}
