//! Kubetail GraphQL bridge: warp HTTP server exposing the schema over POST
//! and graphql-transport-ws, plus health endpoints and the CSRF/origin glue
//! for browser clients.

#![forbid(unsafe_code)]

pub mod csrf;
pub mod schema;

use std::convert::Infallible;
use std::net::SocketAddr;

use async_graphql::Data;
use async_graphql_warp::{graphql_protocol, GraphQLResponse, GraphQLWebSocket};
use tokio::sync::oneshot;
use tokio::sync::oneshot::{Receiver, Sender};
use tracing::{info, warn};
use warp::filters::BoxedFilter;
use warp::{Filter, Reply};

use csrf::CsrfConfig;
use schema::KubetailSchema;

/// The bridge server. Construct with a built schema, `run()` to bind,
/// `stop()` for graceful shutdown.
pub struct Server {
    address: SocketAddr,
    schema: KubetailSchema,
    csrf: CsrfConfig,
    trigger_cancel: Sender<()>,
    cancel_signal: Option<Receiver<()>>,
}

impl Server {
    pub fn new(address: SocketAddr, schema: KubetailSchema, csrf: CsrfConfig) -> Server {
        let (trigger_cancel, cancel_signal) = oneshot::channel::<()>();
        Server { address, schema, csrf, trigger_cancel, cancel_signal: Some(cancel_signal) }
    }

    pub fn stop(self) {
        let _ = self.trigger_cancel.send(());
    }

    /// Binds and serves in a background task; returns the bound address.
    pub async fn run(mut self) -> (SocketAddr, Server) {
        let rx = self.cancel_signal.take().expect("run can only be called once");
        let routes = make_routes(self.schema.clone(), self.csrf.clone());
        let (addr, server) =
            warp::serve(routes).bind_with_graceful_shutdown(self.address, async move {
                let _ = rx.await;
            });
        info!(address = %addr, "bridge server listening");
        tokio::spawn(server);
        (addr, self)
    }
}

fn make_routes(schema: KubetailSchema, csrf: CsrfConfig) -> BoxedFilter<(impl Reply,)> {
    let livez = warp::path("livez").map(|| "ok");
    let readyz = warp::path("readyz").map(|| "ok");

    let graphql_post = warp::path("graphql")
        .and(warp::post())
        .and(async_graphql_warp::graphql(schema.clone()))
        .and_then(
            |(schema, request): (KubetailSchema, async_graphql::Request)| async move {
                Ok::<_, Infallible>(GraphQLResponse::from(schema.execute(request).await))
            },
        );

    let ws_csrf = csrf.clone();
    let graphql_ws = warp::path("graphql")
        .and(warp::ws())
        .and(graphql_protocol())
        .and(warp::header::optional::<String>("sec-fetch-site"))
        .and(warp::cookie::optional::<String>(csrf::CSRF_COOKIE))
        .map(move |ws: warp::ws::Ws, protocol, fetch_site: Option<String>, cookie: Option<String>| {
            if !csrf::origin_allowed(fetch_site.as_deref()) {
                warn!("websocket rejected: cross-site request");
                return warp::reply::with_status(
                    "cross-site websocket rejected",
                    warp::http::StatusCode::FORBIDDEN,
                )
                .into_response();
            }
            let schema = schema.clone();
            let csrf = ws_csrf.clone();
            let reply = ws.on_upgrade(move |socket| {
                GraphQLWebSocket::new(socket, schema, protocol)
                    .on_connection_init(move |payload| {
                        let csrf = csrf.clone();
                        let cookie = cookie.clone();
                        async move {
                            csrf.validate_init_payload(&payload, cookie.as_deref())?;
                            Ok(Data::default())
                        }
                    })
                    .serve()
            });
            warp::reply::with_header(
                reply,
                "Sec-WebSocket-Protocol",
                protocol.sec_websocket_protocol(),
            )
            .into_response()
        });

    let routes = livez.or(readyz).or(graphql_ws).or(graphql_post).with(
        warp::cors()
            .allow_any_origin()
            .allow_headers(vec![
                "Authorization",
                "Content-Type",
                "Origin",
                "Sec-Fetch-Site",
                "X-CSRF-Token",
            ])
            .allow_methods(vec!["POST", "GET"]),
    );

    routes.boxed()
}

// Re-exported so binaries don't reach into async-graphql directly.
pub use schema::{build_schema, ServerState};
