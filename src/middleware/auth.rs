//! Bearer token check for the endpoints that touch the model.

use crate::error::AppError;
use crate::subtitle::SubtitleStyle;
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    rc::Rc,
};
use tracing::warn;

/// Rejects requests whose `Authorization: Bearer <token>` header does not
/// match `api.token`. With an empty token every request passes.
///
/// Rejected requests never reach the handler, so they never load the model.
#[derive(Clone)]
pub struct BearerAuth {
    token: Rc<str>,
    style: Rc<SubtitleStyle>,
}

impl BearerAuth {
    pub fn new(token: &str, style: SubtitleStyle) -> Self {
        Self {
            token: Rc::from(token),
            style: Rc::new(style),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for BearerAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = BearerAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(BearerAuthMiddleware {
            service,
            token: Rc::clone(&self.token),
            style: Rc::clone(&self.style),
        }))
    }
}

pub struct BearerAuthMiddleware<S> {
    service: S,
    token: Rc<str>,
    style: Rc<SubtitleStyle>,
}

impl<S> BearerAuthMiddleware<S> {
    fn authorized(&self, req: &ServiceRequest) -> bool {
        if self.token.is_empty() {
            return true;
        }

        req.headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|presented| presented.trim() == &*self.token)
    }
}

impl<S, B> Service<ServiceRequest> for BearerAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if self.authorized(&req) {
            let fut = self.service.call(req);
            return Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) });
        }

        warn!(
            method = %req.method(),
            path = %req.path(),
            "Rejected request without a valid bearer token"
        );

        let response = AppError::Unauthorized("missing or invalid bearer token".to_string())
            .render(&self.style);
        let rejected = req.into_response(response).map_into_right_body();
        Box::pin(async move { Ok(rejected) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    async fn protected() -> HttpResponse {
        HttpResponse::Ok().body("ok")
    }

    #[actix_web::test]
    async fn test_rejects_missing_and_wrong_token() {
        let app = test::init_service(
            App::new().service(
                web::resource("/transcribe")
                    .wrap(BearerAuth::new("secret", SubtitleStyle::default()))
                    .route(web::post().to(protected)),
            ),
        )
        .await;

        let req = test::TestRequest::post().uri("/transcribe").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["body"], serde_json::json!([]));

        let req = test::TestRequest::post()
            .uri("/transcribe")
            .insert_header((header::AUTHORIZATION, "Bearer nope"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);
    }

    #[actix_web::test]
    async fn test_accepts_matching_token() {
        let app = test::init_service(
            App::new().service(
                web::resource("/transcribe")
                    .wrap(BearerAuth::new("secret", SubtitleStyle::default()))
                    .route(web::post().to(protected)),
            ),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/transcribe")
            .insert_header((header::AUTHORIZATION, "Bearer secret"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 200);
    }

    #[actix_web::test]
    async fn test_empty_token_disables_auth() {
        let app = test::init_service(
            App::new().service(
                web::resource("/transcribe")
                    .wrap(BearerAuth::new("", SubtitleStyle::default()))
                    .route(web::post().to(protected)),
            ),
        )
        .await;

        let req = test::TestRequest::post().uri("/transcribe").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 200);
    }
}
