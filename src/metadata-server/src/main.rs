use std::path::PathBuf;
use std::sync::Arc;

use dino_lib::{expand_env, DinoError, DinoResult};
use dino_metadata::Server;
use dino_store::{SqliteStore, VersionedWrapper};
use log::{error, info};
use serde::Deserialize;

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:6660";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Options {
    name: String,
    metadata_server: String,
    debug: bool,
}

fn default_config_path() -> PathBuf {
    PathBuf::from(expand_env("$HOME/lib/dino/metadataserver.config"))
}

fn usage() -> String {
    format!(
        "usage: metadata-server [--config <path>]\ndefault config: {}",
        default_config_path().display()
    )
}

fn parse_args() -> Result<PathBuf, String> {
    let args = std::env::args().skip(1).collect::<Vec<String>>();
    let mut config_path = default_config_path();
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("missing value for --config\n{}", usage()))?;
                config_path = PathBuf::from(value);
            }
            other => return Err(format!("unknown argument: {}\n{}", other, usage())),
        }
        i += 1;
    }
    Ok(config_path)
}

fn load_options(path: &PathBuf) -> DinoResult<Options> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DinoError::IoError(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| DinoError::InvalidParam(format!("parse {}: {}", path.display(), e)))
}

async fn run(opts: Options) -> DinoResult<()> {
    let dir = PathBuf::from(expand_env("$HOME/lib/dino"));
    std::fs::create_dir_all(&dir)
        .map_err(|e| DinoError::IoError(format!("create {}: {}", dir.display(), e)))?;

    let name = if opts.name.is_empty() {
        "dino".to_string()
    } else {
        opts.name.clone()
    };
    let db_path = dir.join(format!("storage-{}.db", name));
    let store = SqliteStore::open(&db_path)?;
    info!("using a sqlite backend storing data at {}", db_path.display());
    let metadata_store = Arc::new(VersionedWrapper::new(Arc::new(store)));

    let server = Server::new(metadata_store);
    let address = if opts.metadata_server.is_empty() {
        DEFAULT_LISTEN_ADDRESS.to_string()
    } else {
        opts.metadata_server.clone()
    };
    let addr = server.listen(&address).await?;
    info!("listening on {}", addr);

    // serve() returns only after shutdown(), so install the signal handler
    // before blocking on it.
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down server");
            shutdown_server.shutdown().await;
        }
    });

    server.serve().await
}

#[tokio::main]
async fn main() {
    let config_path = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };
    let opts = match load_options(&config_path) {
        Ok(v) => v,
        Err(err) => {
            eprintln!(
                "loading configuration from {}: {}",
                config_path.display(),
                err
            );
            std::process::exit(1);
        }
    };
    let mut builder = env_logger::Builder::from_default_env();
    if opts.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    let _ = builder.try_init();

    if let Err(err) = run(opts).await {
        error!("run metadata-server failed: {}", err);
        std::process::exit(1);
    }
}
