#[macro_use]
extern crate rocket;

pub mod api;
pub mod cache;
pub mod config;
pub mod cors;
pub mod images;

use rocket::figment::Figment;
use rocket::{Build, Rocket};

use cors::CORS;
use images::ImageCacheProxy;

/// Assemble the server around an already configured image proxy.
pub fn build_rocket(figment: Figment, image_proxy: ImageCacheProxy) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(CORS)
        .manage(image_proxy)
        .mount("/", routes![api::image::proxy_image, api::image::health])
}
