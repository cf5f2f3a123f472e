pub mod models;
pub mod transcribe;

pub use models::*;
pub use transcribe::*;

use crate::config::AppConfig;
use crate::health;
use crate::middleware::BearerAuth;
use actix_web::web;

/// Register every route. Endpoints that can load or unload the model sit
/// behind [`BearerAuth`].
pub fn routes(cfg: &mut web::ServiceConfig, config: &AppConfig) {
    let auth = || BearerAuth::new(&config.api.token, config.subtitle.clone());

    cfg.service(
        web::resource("/transcribe")
            .wrap(auth())
            .route(web::post().to(transcribe)),
    )
    .service(
        web::resource("/models/unload")
            .wrap(auth())
            .route(web::post().to(unload_model)),
    )
    .route("/models/status", web::get().to(model_status))
    .route("/health", web::get().to(health::health_check))
    .route("/metrics", web::get().to(health::detailed_metrics));
}
