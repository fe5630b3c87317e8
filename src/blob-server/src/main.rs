use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use dino_lib::{expand_env, DinoError, DinoResult};
use dino_store::{DiskStore, Store};
use log::{debug, error, info, warn};
use serde::Deserialize;
use warp::http::{Response, StatusCode};
use warp::hyper::body::Bytes;
use warp::Filter;

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:6661";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Options {
    blob_server: String,
    debug: bool,
}

fn default_config_path() -> PathBuf {
    PathBuf::from(expand_env("$HOME/lib/dino/blobserver.config"))
}

fn usage() -> String {
    format!(
        "usage: blob-server [--config <path>]\ndefault config: {}",
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

fn response(status: StatusCode, body: Vec<u8>) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_default()
}

fn decode_key(hex_key: &str) -> Result<Vec<u8>, Response<Vec<u8>>> {
    hex::decode(hex_key).map_err(|_| {
        warn!("bad request: {:?}", hex_key);
        response(
            StatusCode::BAD_REQUEST,
            format!("{:?}: not a valid path, expecting hex key only", hex_key).into_bytes(),
        )
    })
}

async fn handle_get(store: Arc<DiskStore>, hex_key: String) -> Response<Vec<u8>> {
    let key = match decode_key(&hex_key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    match store.get(&key).await {
        Ok(value) => {
            debug!("GET {}: success", hex_key);
            response(StatusCode::OK, value)
        }
        Err(err) if err.is_not_found() => {
            debug!("GET {}: not found", hex_key);
            response(StatusCode::NOT_FOUND, Vec::new())
        }
        Err(err) => {
            error!("GET {}: {}", hex_key, err);
            response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{:?}: {}", hex_key, err).into_bytes(),
            )
        }
    }
}

async fn handle_put(store: Arc<DiskStore>, hex_key: String, body: Bytes) -> Response<Vec<u8>> {
    let key = match decode_key(&hex_key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    match store.put(&key, &body).await {
        Ok(()) => {
            debug!("PUT {}: success", hex_key);
            response(StatusCode::OK, Vec::new())
        }
        Err(err) => {
            error!("PUT {}: {}", hex_key, err);
            response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{:?}: {}", hex_key, err).into_bytes(),
            )
        }
    }
}

async fn run(opts: Options) -> DinoResult<()> {
    let dir = PathBuf::from(expand_env("$HOME/lib/dino"));
    std::fs::create_dir_all(&dir)
        .map_err(|e| DinoError::IoError(format!("create {}: {}", dir.display(), e)))?;
    let data_dir = dir.join("data");
    let store = Arc::new(DiskStore::new(&data_dir));
    info!(
        "using a disk-based backend storing data at {}",
        data_dir.display()
    );

    let get_store = store.clone();
    let get = warp::get()
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .then(move |hex_key: String| handle_get(get_store.clone(), hex_key));
    let put_store = store.clone();
    let put = warp::put()
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::body::bytes())
        .then(move |hex_key: String, body: Bytes| handle_put(put_store.clone(), hex_key, body));

    let address = if opts.blob_server.is_empty() {
        DEFAULT_LISTEN_ADDRESS.to_string()
    } else {
        opts.blob_server.clone()
    };
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| DinoError::InvalidParam(format!("listen address {}: {}", address, e)))?;
    info!("listening on {}", addr);
    warp::serve(get.or(put)).run(addr).await;
    Ok(())
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
        error!("run blob-server failed: {}", err);
        std::process::exit(1);
    }
}
