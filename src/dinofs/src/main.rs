use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use dino_lib::{DinoError, DinoResult, Message};
use dino_metadata::{ChangeListener, Client, RemoteVersionedStore};
use dino_store::{BlobStore, DiskStore, HttpStore, Paired};
use dinofs::{
    default_config_path, expand_env, load_config, Config, DinoFs, NodeFactory, ROOT_KEY,
};
use fuser::MountOption;
use log::{error, info};
use tokio::runtime::Runtime;

fn usage() -> String {
    format!(
        "usage: dinofs [--config <path>]\ndefault config: {}",
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

fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::from_default_env();
    if config.debug || config.debug_fuse {
        builder.filter_level(log::LevelFilter::Debug);
    }
    let log_path = expand_env(&config.log_path);
    if !log_path.is_empty() {
        let path = PathBuf::from(&log_path);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!("could not open log file {}: {}", log_path, err),
        }
    }
    let _ = builder.try_init();
}

fn run(config: Config) -> DinoResult<()> {
    let runtime =
        Runtime::new().map_err(|e| DinoError::IoError(format!("start runtime: {}", e)))?;

    let client = Arc::new(Client::new(config.metadata_server.clone()));
    runtime.block_on(client.connect())?;

    // The change listener needs the factory, which needs the remote store,
    // which carries the listener; the slot unties the knot.
    let factory_slot: Arc<OnceLock<Arc<NodeFactory>>> = Arc::new(OnceLock::new());
    let listener: ChangeListener = {
        let slot = factory_slot.clone();
        Arc::new(move |mutation: Message| {
            let slot = slot.clone();
            Box::pin(async move {
                if let Some(factory) = slot.get() {
                    factory.invalidate_cache(mutation).await;
                }
            })
        })
    };
    let remote = Arc::new(RemoteVersionedStore::new(client).with_change_listener(listener));

    let factory = runtime.block_on(async {
        remote.start();
        let data_dir = expand_env(&config.data_path);
        let paired = Paired::new(
            Arc::new(DiskStore::new(data_dir)),
            Arc::new(HttpStore::new(config.blob_server.clone())),
        );
        let blobs = Arc::new(BlobStore::new(Arc::new(paired)));
        let factory = NodeFactory::new(remote.clone(), blobs);
        let _ = factory_slot.set(factory.clone());

        let root = factory.existing_node("root", ROOT_KEY);
        match root.load(ROOT_KEY).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                info!("serving an empty file system (no metadata found for root node)");
                root.bootstrap_empty_dir().await;
            }
            Err(err) => {
                return Err(DinoError::StorageError(format!(
                    "could not load root node metadata: {}",
                    err
                )))
            }
        }
        factory.adopt_root(&root);
        Ok(factory)
    })?;

    let mountpoint = PathBuf::from(expand_env(&config.mountpoint));
    std::fs::create_dir_all(&mountpoint).map_err(|e| {
        DinoError::IoError(format!(
            "create mountpoint {}: {}",
            mountpoint.display(),
            e
        ))
    })?;

    let mount_options = vec![MountOption::FSName(config.name.clone())];
    #[cfg(not(target_os = "macos"))]
    let mut mount_options = mount_options;
    #[cfg(not(target_os = "macos"))]
    mount_options.push(MountOption::AutoUnmount);

    info!("mounting {} at {}", config.name, mountpoint.display());
    let filesystem = DinoFs::new(runtime, factory);
    // Returns when the filesystem is unmounted, e.g. with
    // "fusermount -u /n/dino".
    fuser::mount2(filesystem, &mountpoint, &mount_options)
        .map_err(|e| DinoError::IoError(format!("mount failed: {}", e)))
}

fn main() {
    let config_path = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };
    let mut config = match load_config(&config_path) {
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
    config.apply_defaults_for_missing_properties();
    init_logging(&config);

    if let Err(err) = run(config) {
        error!("run dinofs failed: {}", err);
        std::process::exit(1);
    }
}
