//! Downstream handler reached by admitted requests.

use actix_web::HttpResponse;

/// GET / (and any other metered path)
pub async fn greet() -> HttpResponse {
    HttpResponse::Ok().body("Hello, World!")
}
