use std::env;
use std::path::PathBuf;

/// Server configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_workers: usize,
    pub results_dir: PathBuf,
    pub mock_build_handler: bool,
    pub data_path: PathBuf,
    pub dataset_path: PathBuf,
    pub archives_root: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let data_path = env_path("DATA_PATH", "data");

        let dataset_path = env::var("DATASET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_path.join("dataset.json"));

        let archives_root = env::var("ARCHIVES_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_path.join("archives"));

        Config {
            port: env_parsed("PORT", 45003),
            max_workers: env_parsed("MAX_WORKERS", 5),
            results_dir: env_path("RESULTS_DIR", "submission_results"),
            mock_build_handler: env_bool("MOCK_BUILD_HANDLER", false),
            data_path,
            dataset_path,
            archives_root,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 45003,
            max_workers: 5,
            results_dir: PathBuf::from("submission_results"),
            mock_build_handler: false,
            data_path: PathBuf::from("data"),
            dataset_path: PathBuf::from("data/dataset.json"),
            archives_root: PathBuf::from("data/archives"),
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 45003);
        assert_eq!(cfg.max_workers, 5);
        assert_eq!(cfg.results_dir, PathBuf::from("submission_results"));
        assert!(!cfg.mock_build_handler);
    }

    #[test]
    fn env_bool_accepts_common_truthy_spellings() {
        assert!(matches!("true".to_lowercase().as_str(), "1" | "true" | "yes" | "on"));
        assert!(matches!("YES".to_lowercase().as_str(), "1" | "true" | "yes" | "on"));
    }
}
