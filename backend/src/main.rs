use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use hairscan::artifact::ArtifactDownloader;
use hairscan::config::AppConfig;
use hairscan::inference::{InferenceService, ModelHandle, ModelLoader};
use hairscan::routes::{UploadLimit, configure_routes};
use std::env;
use std::time::Duration;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let loader = ModelLoader::from_config(&config.model);
    let downloader = match config.model.download_url.clone() {
        Some(url) => {
            let timeout = Duration::from_millis(config.model.download_timeout_ms);
            match ArtifactDownloader::new(url, timeout) {
                Ok(downloader) => Some(downloader),
                Err(e) => {
                    log::error!("Model download disabled: {}", e);
                    None
                }
            }
        }
        None => None,
    };
    let handle = ModelHandle::new(loader, downloader);

    if config.model.preload {
        match handle.get().await {
            Some(model) => log::info!(
                "Model ready (strategy {}, {})",
                model.strategy(),
                model.provenance()
            ),
            // The server still starts; every prediction reports the model as unavailable.
            None => log::error!("No model could be loaded"),
        }
    } else {
        log::info!("Model will be loaded on the first request");
    }

    let service = InferenceService::new(
        handle,
        Duration::from_millis(config.model.inference_timeout_ms),
    );
    let upload_limit = config.server.max_upload_bytes;
    let bind_address = config.bind_address();

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .wrap(middleware::Logger::default())
            .app_data(web::Data::new(service.clone()))
            .configure(|cfg| configure_routes(cfg, UploadLimit(upload_limit)))
    })
    .bind(&bind_address)?
    .run()
    .await
}
