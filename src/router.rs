use axum::{
    Router,
    http::Method,
    middleware::from_extractor,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::{
    api::{
        api_create_account, api_delete_account, api_get_account, api_get_settings, api_health,
        api_list_accounts, api_messages, api_oauth_exchange, api_put_settings, api_statistics,
        api_update_account, api_version,
    },
    middleware::{RequireAdminAuth, RequireClientAuth},
    state::AppState,
};

/// RouterBuilder for the application
pub struct RouterBuilder {
    state: AppState,
    inner: Router<AppState>,
}

impl RouterBuilder {
    pub fn new(state: AppState) -> Self {
        RouterBuilder {
            state,
            inner: Router::new(),
        }
    }

    pub fn with_default_setup(self) -> Self {
        self.route_messages_endpoints()
            .route_admin_endpoints()
            .route_misc_endpoints()
            .with_cors()
    }

    /// Client-facing Messages API
    fn route_messages_endpoints(mut self) -> Self {
        let router = Router::new()
            .route("/v1/messages", post(api_messages))
            .layer(ServiceBuilder::new().layer(from_extractor::<RequireClientAuth>()));
        self.inner = self.inner.merge(router);
        self
    }

    /// Admin surface: accounts, settings, statistics
    fn route_admin_endpoints(mut self) -> Self {
        let router = Router::new()
            .route(
                "/accounts",
                get(api_list_accounts).post(api_create_account),
            )
            .route(
                "/accounts/{organization_uuid}",
                get(api_get_account)
                    .put(api_update_account)
                    .delete(api_delete_account),
            )
            .route("/accounts/oauth/exchange", post(api_oauth_exchange))
            .route("/settings", get(api_get_settings).put(api_put_settings))
            .route("/statistics", get(api_statistics))
            .route_layer(from_extractor::<RequireAdminAuth>());
        self.inner = self.inner.merge(router);
        self
    }

    fn route_misc_endpoints(mut self) -> Self {
        self.inner = self
            .inner
            .route("/health", get(api_health))
            .route("/version", get(api_version));
        self
    }

    fn with_cors(mut self) -> Self {
        let cors = CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static("x-api-key"),
            ]);
        self.inner = self.inner.layer(cors);
        self
    }

    pub fn build(self) -> Router {
        self.inner.with_state(self.state)
    }
}
