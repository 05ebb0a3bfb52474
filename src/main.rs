// Sun Exposure API v0.1
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod errors;
mod helpers;
mod routes;
mod services;

use config::AppConfig;
use db::pg_store::{PgExposureStore, PgLocationCatalog};
use routes::health::HealthState;
use routes::weather::WeatherState;
use services::engine::ExposureEngine;
use services::open_meteo::OpenMeteoClient;
use services::poller::{RefresherState, SharedRefresherState};
use services::raster::{load_or_empty, ElevationSampler};
use services::regeneration::RegenerationService;
use services::status::QueryFacade;
use services::store::{ExposureStore, LocationCatalog};
use services::sun::NoaaSunPosition;
use services::weather::{ForecastHour, RegionId, WeatherForecastCache};

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 5;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 2;
/// Persisted forecasts younger than this warm the cache at startup (hours).
const FORECAST_WARMUP_HOURS: i64 = 168;

/// Sun Exposure API — OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Sun Exposure API",
        version = "0.1.0",
        description = "Tells whether outdoor locations (park benches) are in the sun. \
            Precomputes clear-sky exposure from terrain and building heights on a \
            rolling time grid and combines it with a cached cloud-cover forecast \
            at query time.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Locations", description = "Location search and sun status"),
        (name = "Regeneration", description = "Exposure precomputation runs"),
        (name = "Weather", description = "Cloud-cover forecast and refresher"),
    ),
    paths(
        routes::health::health_check,
        routes::locations::list_nearby_locations,
        routes::locations::get_location,
        routes::locations::get_location_status,
        routes::locations::get_next_sunny,
        routes::locations::get_batch_status,
        routes::regeneration::get_regeneration_status,
        routes::regeneration::start_regeneration,
        routes::regeneration::cancel_regeneration,
        routes::weather::get_weather_status,
        routes::weather::get_forecast,
        routes::weather::is_sunny_at,
        routes::weather::get_weather_next_sunny,
        routes::weather::trigger_refresh,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::locations::LocationInfo,
            routes::locations::LocationStatusResponse,
            routes::locations::NearbyLocationResponse,
            routes::locations::NearbyLocationsResponse,
            routes::locations::LocationDetailResponse,
            routes::locations::NextSunnyResponse,
            routes::locations::BatchStatusRequest,
            routes::locations::BatchStatusResponse,
            routes::regeneration::RegenerationAccepted,
            routes::weather::WeatherStatusResponse,
            routes::weather::ForecastResponse,
            routes::weather::ForecastHourResponse,
            routes::weather::IsSunnyResponse,
            routes::weather::SkyStatus,
            routes::weather::WeatherNextSunnyResponse,
            routes::weather::SunnyPeriodStatus,
            routes::weather::RefreshAccepted,
            services::exposure::SunStatus,
            services::exposure::LookaheadStatus,
            services::engine::EngineProgress,
            services::engine::RunSummary,
            services::regeneration::RegenerationState,
            services::poller::RefresherState,
            services::poller::RegionRefreshStatus,
            services::weather::RegionId,
            services::weather::RegionSummary,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

/// Import benches from the OSM exports in `data_dir`. Locations whose
/// observer height changed lose their stored horizon profile.
async fn import_locations(pool: &PgPool, data_dir: &Path, terrain: &dyn ElevationSampler, offset_m: f64) {
    let benches = match services::osm::load_benches_from_dir(data_dir) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(
                "Failed to load OSM exports from {}: {}",
                data_dir.display(),
                e
            );
            return;
        }
    };
    if benches.is_empty() {
        tracing::warn!("No OSM benches found in {}", data_dir.display());
        return;
    }

    let mut imported = 0usize;
    for bench in &benches {
        let Some(loc) = services::osm::resolve_location(bench, terrain, offset_m) else {
            continue;
        };
        match db::queries::upsert_location_from_osm(pool, &loc).await {
            Ok((id, height_changed)) => {
                imported += 1;
                if height_changed {
                    tracing::info!(
                        "Observer height of bench {} changed, invalidating its horizon profile",
                        bench.osm_id
                    );
                    if let Err(e) = db::queries::delete_profile(pool, id).await {
                        tracing::error!("Failed to delete horizon profile of {}: {}", id, e);
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to import bench {}: {}", bench.osm_id, e);
            }
        }
    }
    tracing::info!("Imported {} of {} OSM benches", imported, benches.len());
}

/// Seed the forecast cache from persisted rows so queries have weather data
/// before the first refresh completes.
async fn warm_weather_cache(pool: &PgPool, cache: &WeatherForecastCache) {
    let since = chrono::Utc::now() - chrono::Duration::hours(FORECAST_WARMUP_HOURS);
    let rows = match db::queries::load_weather_forecasts(pool, since).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!("Failed to load persisted forecasts: {}", e);
            return;
        }
    };

    let mut by_region: BTreeMap<RegionId, (Vec<ForecastHour>, chrono::DateTime<chrono::Utc>)> =
        BTreeMap::new();
    for row in &rows {
        let entry = by_region
            .entry(RegionId(row.region_id))
            .or_insert_with(|| (Vec::new(), row.fetched_at));
        entry.0.push(row.to_hour());
        entry.1 = entry.1.max(row.fetched_at);
    }
    let regions = by_region.len();
    for (region, (hours, fetched_at)) in by_region {
        cache.seed(region, hours, fetched_at).await;
    }
    tracing::info!(
        "Warmed forecast cache with {} hours across {} regions",
        rows.len(),
        regions
    );
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sun_exposure_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();

    // Set up database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Database migrations completed");

    // Elevation models; missing files degrade to "no data" samples
    let terrain = load_or_empty(Path::new(&config.terrain_raster_path));
    let surface = load_or_empty(Path::new(&config.surface_raster_path));

    // Seed locations from OSM exports
    import_locations(
        &pool,
        Path::new(&config.data_dir),
        terrain.as_ref(),
        config.observer_offset_m,
    )
    .await;

    let store: Arc<dyn ExposureStore> = Arc::new(PgExposureStore::new(pool.clone()));
    let catalog: Arc<dyn LocationCatalog> = Arc::new(PgLocationCatalog::new(pool.clone()));

    // Weather cache, warmed from the database
    let weather = Arc::new(WeatherForecastCache::new(config.weather.clone()));
    warm_weather_cache(&pool, &weather).await;

    let forecast_client = OpenMeteoClient::new(
        &config.weather.api_url,
        config.weather.timeout_secs,
        config.weather.horizon_hours,
    )
    .expect("Failed to build forecast HTTP client");

    // Exposure engine and regeneration scheduler
    let cadence_minutes = config.engine.cadence_minutes;
    let engine = ExposureEngine::new(
        config.engine.clone(),
        store.clone(),
        terrain,
        surface,
        Arc::new(NoaaSunPosition),
    )
    .expect("Invalid engine configuration");
    let regeneration = Arc::new(RegenerationService::new(Arc::new(engine), catalog.clone()));
    tokio::spawn(regeneration.clone().run_scheduler(
        config.regenerate_on_startup,
        chrono::Duration::hours(i64::from(config.regeneration_interval_hours)),
    ));

    // Background weather refresher, also woken by POST /api/v1/weather/refresh
    let refresher_state: SharedRefresherState = Arc::new(RwLock::new(RefresherState::new()));
    let refresh_trigger = Arc::new(Notify::new());
    tokio::spawn(services::poller::run_weather_refresher(
        pool.clone(),
        catalog.clone(),
        weather.clone(),
        Arc::new(forecast_client),
        refresher_state.clone(),
        refresh_trigger.clone(),
    ));

    let facade = Arc::new(QueryFacade::new(catalog, store, weather.clone(), cadence_minutes));

    // CORS: status reads plus regeneration control; expose X-Forecast-Stale
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any)
        .expose_headers(["X-Forecast-Stale"
            .parse::<axum::http::HeaderName>()
            .unwrap()]);

    // Build router; each group carries its own state
    let location_routes = Router::new()
        .route(
            "/api/v1/locations",
            get(routes::locations::list_nearby_locations),
        )
        .route("/api/v1/locations/:id", get(routes::locations::get_location))
        .route(
            "/api/v1/locations/status",
            post(routes::locations::get_batch_status),
        )
        .route(
            "/api/v1/locations/:id/status",
            get(routes::locations::get_location_status),
        )
        .route(
            "/api/v1/locations/:id/next-sunny",
            get(routes::locations::get_next_sunny),
        )
        .with_state(facade);

    let regeneration_routes = Router::new()
        .route(
            "/api/v1/regeneration",
            get(routes::regeneration::get_regeneration_status)
                .post(routes::regeneration::start_regeneration)
                .delete(routes::regeneration::cancel_regeneration),
        )
        .with_state(regeneration.clone());

    let weather_routes = Router::new()
        .route(
            "/api/v1/weather/status",
            get(routes::weather::get_weather_status),
        )
        .route("/api/v1/weather/forecast", get(routes::weather::get_forecast))
        .route("/api/v1/weather/is-sunny", get(routes::weather::is_sunny_at))
        .route(
            "/api/v1/weather/next-sunny",
            get(routes::weather::get_weather_next_sunny),
        )
        .route("/api/v1/weather/refresh", post(routes::weather::trigger_refresh))
        .with_state(WeatherState {
            cache: weather,
            refresher: refresher_state,
            refresh: refresh_trigger,
        });

    let health_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .with_state(HealthState { pool, regeneration });

    let app = Router::new()
        .merge(health_routes)
        .merge(location_routes)
        .merge(regeneration_routes)
        .merge(weather_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
