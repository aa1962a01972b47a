//! HTTP handlers and route configuration.

mod greeting;
mod health;

use actix_web::web;

use crate::middleware::AdmissionMiddleware;

/// Configure all application routes.
///
/// `/health` is never metered; every other path goes through admission.
pub fn configure_routes(cfg: &mut web::ServiceConfig, admission: AdmissionMiddleware) {
    cfg.route("/health", web::get().to(health::health_check))
        .service(
            web::scope("")
                .wrap(admission)
                .route("/", web::get().to(greeting::greet))
                .default_service(web::to(greeting::greet)),
        );
}
