//! HTTP surface for the preview store.
//!
//! A catch-all route applies the interception rules; anything the
//! interceptor declines is a plain 404. Every served file carries
//! `Cache-Control: no-store` plus the cross-origin isolation header block.

use actix_web::{
    web, App, HttpRequest, HttpResponse, HttpServer,
};

use crate::{intercept, PreviewHandle, CROSS_ORIGIN_ISOLATION_HEADERS};

async fn preview_route(req: HttpRequest, handle: web::Data<PreviewHandle>) -> HttpResponse {
    let connection_info = req.connection_info().clone();
    let host = connection_info.host();
    let path = req.path();

    log::trace!("Preview request host={host} path={path}");

    match intercept(&handle.context(), host, path).await {
        Some(response) => {
            let mut builder = HttpResponse::build(
                actix_web::http::StatusCode::from_u16(response.status)
                    .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR),
            );
            builder.content_type(response.content_type);
            builder.insert_header(("Cache-Control", "no-store"));
            for (name, value) in CROSS_ORIGIN_ISOLATION_HEADERS {
                builder.insert_header((name, value));
            }
            builder.body(response.body)
        }
        None => HttpResponse::NotFound().body("Not found"),
    }
}

/// Bind the preview server. The returned server future must be awaited (or
/// spawned) by the caller.
///
/// # Errors
///
/// * If the address cannot be bound
pub fn serve(
    handle: PreviewHandle,
    addr: (String, u16),
) -> std::io::Result<actix_web::dev::Server> {
    let data = web::Data::new(handle);

    Ok(HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .default_service(web::route().to(preview_route))
    })
    .bind(addr)?
    .run())
}
