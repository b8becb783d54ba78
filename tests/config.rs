mod util;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use listing_search::ListingError;
use listing_search::config::{CONFIG_FILE, Config, ConfigOverrides, EmbedderKind};
use serial_test::serial;
use tempfile::TempDir;

use util::EnvGuard;

const VARS: &[&str] = &[
    "LISTINGS_DATA_DIR",
    "LISTINGS_DB",
    "LISTINGS_SNAPSHOT",
    "LISTINGS_EMBED_URL",
    "LISTINGS_EMBEDDER",
    "LISTINGS_EMBED_TIMEOUT_MS",
    "LISTINGS_EMBED_DIM",
    "LISTINGS_OVERSAMPLE",
];

fn clean_env() -> Vec<EnvGuard> {
    VARS.iter().map(|k| EnvGuard::unset(k)).collect()
}

fn in_dir(dir: &TempDir) -> ConfigOverrides {
    ConfigOverrides {
        data_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    }
}

#[test]
#[serial]
fn defaults_apply_without_file_or_env() {
    let _env = clean_env();
    let dir = TempDir::new().unwrap();
    let cfg = Config::load(&in_dir(&dir)).unwrap();
    assert_eq!(cfg.embedder, EmbedderKind::Http);
    assert_eq!(cfg.embed_dimension, 384);
    assert_eq!(cfg.default_k, 5);
    assert_eq!(cfg.db_path(), dir.path().join("listings.db"));
}

#[test]
#[serial]
fn data_dir_comes_from_env_when_not_on_command_line() {
    let _env = clean_env();
    let dir = TempDir::new().unwrap();
    let _dir_var = EnvGuard::set("LISTINGS_DATA_DIR", dir.path().to_string_lossy());
    let cfg = Config::load(&ConfigOverrides::default()).unwrap();
    assert_eq!(cfg.data_dir, dir.path());
}

#[test]
#[serial]
fn env_overrides_file_and_cli_overrides_env() {
    let _env = clean_env();
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(CONFIG_FILE),
        "embedder = \"hash\"\nembed_url = \"http://file:1\"\nembed_dimension = 64\noversample_factor = 3\n",
    )
    .unwrap();

    let cfg = Config::load(&in_dir(&dir)).unwrap();
    assert_eq!(cfg.embed_url, "http://file:1");
    assert_eq!(cfg.oversample_factor, 3);

    let _url = EnvGuard::set("LISTINGS_EMBED_URL", "http://env:2");
    let _dim = EnvGuard::set("LISTINGS_EMBED_DIM", "128");
    let _timeout = EnvGuard::set("LISTINGS_EMBED_TIMEOUT_MS", "750");
    let cfg = Config::load(&in_dir(&dir)).unwrap();
    assert_eq!(cfg.embed_url, "http://env:2");
    assert_eq!(cfg.embed_dimension, 128);
    assert_eq!(cfg.embed_timeout, Duration::from_millis(750));
    assert_eq!(cfg.embedder, EmbedderKind::Hash);

    let cfg = Config::load(&ConfigOverrides {
        embed_url: Some("http://cli:3".into()),
        db_path: Some(PathBuf::from("/tmp/elsewhere.db")),
        ..in_dir(&dir)
    })
    .unwrap();
    assert_eq!(cfg.embed_url, "http://cli:3");
    assert_eq!(cfg.db_path(), PathBuf::from("/tmp/elsewhere.db"));
}

#[test]
#[serial]
fn invalid_env_values_are_validation_errors() {
    let _env = clean_env();
    let dir = TempDir::new().unwrap();

    let bad_dim = EnvGuard::set("LISTINGS_EMBED_DIM", "lots");
    assert!(matches!(
        Config::load(&in_dir(&dir)),
        Err(ListingError::Validation(_))
    ));
    drop(bad_dim);

    let _zero = EnvGuard::set("LISTINGS_OVERSAMPLE", "0");
    assert!(matches!(
        Config::load(&in_dir(&dir)),
        Err(ListingError::Validation(_))
    ));
}

#[test]
#[serial]
fn unknown_embedder_in_env_is_rejected() {
    let _env = clean_env();
    let dir = TempDir::new().unwrap();
    let _kind = EnvGuard::set("LISTINGS_EMBEDDER", "onnx");
    let err = Config::load(&in_dir(&dir)).unwrap_err();
    assert!(err.to_string().contains("onnx"), "{err}");
}
