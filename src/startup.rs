use std::net::TcpListener;

use actix_web::dev::Server;
use actix_web::web;
use actix_web::web::Data;
use actix_web::App;
use actix_web::HttpServer;
use actix_web_lab::middleware::from_fn;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing_actix_web::TracingLogger;

use crate::authentication::reject_invalid_tenants;
use crate::configuration::DatabaseSettings;
use crate::configuration::Settings;
use crate::fetch::RemoteFetcher;
use crate::routes::dlq_list;
use crate::routes::dlq_replay;
use crate::routes::health_check;
use crate::routes::ingest_remote;
use crate::routes::list_items;
use crate::routes::metrics_snapshot;
use crate::routes::outbox_status;
use crate::routes::parsed_latest;
use crate::routes::parsed_review;
use crate::routes::tenant_summary;
use crate::routes::tenants_info;
use crate::routes::upload_item;
use crate::storage::ContentStore;
use crate::tenant::TenantValidator;

/// The bound API server plus the port the OS actually handed out (tests bind
/// port 0).
pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(cfg: Settings) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(addr)?;
        let port = listener.local_addr()?.port();

        let pool = get_connection_pool(&cfg.database);
        migrate(&pool).await?;

        let store = ContentStore::from_settings(&cfg.storage)?;
        let tenants =
            TenantValidator::new(cfg.tenants.clone(), cfg.application.env.is_development());
        let fetcher = RemoteFetcher::new(&cfg.ingest)?;

        let server = run(listener, pool, store, tenants, fetcher, cfg).await?;
        Ok(Self { port, server })
    }

    pub fn get_port(&self) -> u16 { self.port }

    /// Consumes `self`; the final call (or the argument to `tokio::spawn`).
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> { self.server.await }
}

pub fn get_connection_pool(db_cfg: &DatabaseSettings) -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(db_cfg.max_connections)
        .connect_lazy_with(db_cfg.connection())
}

/// Apply the embedded migrations. Safe to call from every process sharing
/// the database; the migrator serializes itself.
pub async fn migrate(pool: &SqlitePool) -> Result<(), anyhow::Error> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}

/// Declare the HTTP surface. Thin adapters only: every handler delegates to
/// the ingest service, the read model or the outbox module.
async fn run(
    listener: TcpListener,
    pool: SqlitePool,
    store: ContentStore,
    tenants: TenantValidator,
    fetcher: RemoteFetcher,
    cfg: Settings,
) -> Result<Server, anyhow::Error> {
    let pool = Data::new(pool);
    let store = Data::new(store);
    let tenants = Data::new(tenants);
    let fetcher = Data::new(fetcher);
    // uploads are checked against the cap in-handler so the client gets a
    // stable `size_limit` code; the framework limit just needs to sit above it
    let payload_cap = cfg.ingest.max_upload_bytes() + 1024 * 1024;
    let cfg = Data::new(cfg);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
            .service(
                web::scope("/api/v1")
                    .service(
                        web::scope("/inbox")
                            .wrap(from_fn(reject_invalid_tenants))
                            .route("/items/upload", web::post().to(upload_item))
                            .route("/items", web::post().to(ingest_remote))
                            .route("/items", web::get().to(list_items)),
                    )
                    .service(
                        web::scope("/read")
                            .wrap(from_fn(reject_invalid_tenants))
                            .route("/parsed", web::get().to(parsed_latest))
                            .route("/review", web::get().to(parsed_review))
                            .route("/summary", web::get().to(tenant_summary)),
                    )
                    .service(
                        web::scope("/ops")
                            .route("/outbox", web::get().to(outbox_status))
                            .route("/dlq", web::get().to(dlq_list))
                            .route("/dlq/replay", web::post().to(dlq_replay))
                            .route("/tenants", web::get().to(tenants_info))
                            .route("/metrics", web::get().to(metrics_snapshot)),
                    ),
            )
            .app_data(web::PayloadConfig::new(payload_cap))
            .app_data(pool.clone())
            .app_data(store.clone())
            .app_data(tenants.clone())
            .app_data(fetcher.clone())
            .app_data(cfg.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
