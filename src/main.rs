use std::env;
use std::sync::Arc;

use atlas_image_proxy::build_rocket;
use atlas_image_proxy::cache::{CacheStorage, DiskStorage, EvictionPolicy, ImageCache, MemoryStorage};
use atlas_image_proxy::config::{AppConfig, CacheBackend};
use atlas_image_proxy::images::{EncodeSettings, HttpFetcher, ImageCacheProxy};
use dotenv::dotenv;
use env_logger::Env;
use log::{error, info};
use rocket::{
    figment::{
        providers::{Format, Toml},
        Figment, Profile,
    },
    Build, Config, Rocket,
};

#[rocket::launch]
async fn rocket() -> Rocket<Build> {
    dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    // Load config
    let mut figment = Figment::from(Config::default())
        .merge(Toml::file("App.toml").nested());

    if let Ok(cache_dir) = env::var("CACHE_DIR") {
        figment = figment.merge(("cache_dir", cache_dir));
    }

    if let Ok(proxy) = env::var("UPSTREAM_PROXY") {
        figment = figment.merge(("upstream_proxy", proxy));
    }

    figment = figment.select(Profile::from_env_or("APP_PROFILE", "default"));

    let config = match AppConfig::from_figment(&figment) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded successfully");

    let fetcher = match HttpFetcher::new(config.timeout, &config.user_agent, config.upstream_proxy.as_deref()) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            error!("Failed to create upstream client: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(proxy) = &config.upstream_proxy {
        info!("Upstream requests go through proxy {}", proxy);
    }

    let storage: Box<dyn CacheStorage> = match config.cache_backend {
        CacheBackend::Disk => Box::new(DiskStorage::new(config.cache_dir.clone())),
        CacheBackend::Memory => Box::new(MemoryStorage::new()),
    };
    let policy = EvictionPolicy {
        max_bytes: config.cache_max_bytes,
        fraction: config.eviction_fraction,
    };
    let image_cache = match ImageCache::activate(storage.as_ref(), &config.cache_version, policy).await {
        Ok(cache) => cache,
        Err(e) => {
            error!("Failed to open image cache '{}': {}", config.cache_version, e);
            std::process::exit(1);
        }
    };
    info!(
        "Image cache '{}' ready ({:?} backend, {} byte budget)",
        config.cache_version, config.cache_backend, config.cache_max_bytes
    );

    let image_proxy = ImageCacheProxy::new(
        Arc::new(fetcher),
        image_cache,
        config.size_profiles,
        EncodeSettings {
            format: config.output_format,
            quality: config.quality,
        },
    );
    info!("Image proxy initialized");

    info!(
        "Starting image proxy server on {}:{}",
        config.address, config.port
    );

    build_rocket(figment, image_proxy)
}
