use super::subscribe::LAST_EVENT_ID;
use super::{publish, subscribe, subscriptions, Hub, HUB_PATH};
use crate::subscriber::SUBSCRIPTIONS_PATH;
use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub(super) fn build(hub: Hub) -> Router {
    let mut router = Router::<Hub>::new()
        .route(HUB_PATH, get(subscribe::subscribe).post(publish::publish))
        .route("/healthz", get(health));

    if hub.config().subscriptions {
        router = router
            .route(SUBSCRIPTIONS_PATH, get(subscriptions::collection))
            .route(&format!("{}/{{topic}}", SUBSCRIPTIONS_PATH), get(subscriptions::collection))
            .route(
                &format!("{}/{{topic}}/{{subscriber}}", SUBSCRIPTIONS_PATH),
                get(subscriptions::subscription),
            );
    }

    let cors = cors_layer(&hub.config().cors_origins);
    let router = router.with_state(hub);

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

async fn health() -> &'static str {
    "ok"
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    // Credentials rule out a literal `*`, so any origin is echoed back instead
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()))
    };

    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::AUTHORIZATION, header::CACHE_CONTROL, LAST_EVENT_ID]),
    )
}
