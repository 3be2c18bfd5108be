use actix_web::web;
use crate::web::handlers;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(handlers::json_error))
        .service(
            web::scope("/api/stories")
                .route("/continue", web::post().to(handlers::continue_story))
                .route("/continue", web::get().to(handlers::continuation_status))
                .route("/generate", web::post().to(handlers::generate_story))
                .route("/generate", web::get().to(handlers::generation_status))
                .route("/adventure", web::post().to(handlers::adventure))
                .route("/adventure", web::get().to(handlers::adventure_status))
                .route("/stream", web::post().to(handlers::stream_story)),
        )
        .route("/health", web::get().to(handlers::health_check));
}
