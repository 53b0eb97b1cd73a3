use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use streamsignal_api::Store;

mod db;
mod error;
mod extractors;
mod feeds;
mod fuzz;
mod handlers;

use db::PostgresStore;
use error::Error;
use extractors::AppState;
use feeds::Feeds;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(structopt::StructOpt)]
struct Opt {
    /// Address to listen on
    #[structopt(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Postgres connection string
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,
}

pub fn app(store: Arc<dyn Store>, feeds: Feeds) -> Router {
    Router::new()
        .route("/api/services", get(handlers::fetch_services))
        .route("/api/services/:service", get(handlers::fetch_service))
        .route("/api/services/:service/reviews", get(handlers::fetch_reviews))
        .route("/api/reviews", post(handlers::submit_review))
        .route("/api/reviews/:review/comments", get(handlers::fetch_comments))
        .route("/api/reviews/:review/reactions", get(handlers::fetch_reactions))
        .route("/api/comments", post(handlers::submit_comment))
        .route("/api/votes", post(handlers::submit_vote))
        .route("/realtime", get(handlers::realtime_feed))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(AppState { store, feeds })
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(db_url)
        .await
        .with_context(|| format!("Error opening database {:?}", db_url))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = <Opt as structopt::StructOpt>::from_args();

    let db = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&db)
        .await
        .context("running pending migrations")?;

    let app = app(Arc::new(PostgresStore::new(db)), Feeds::new());

    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}
