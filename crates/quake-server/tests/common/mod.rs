//! Shared helpers for quake-server integration tests
//!
//! - [`TestPostgres`]: PostgreSQL container with migrations applied
//! - CSV fixtures in the USGS column layout
//! - [`init_test_tracing`]: test-friendly subscriber
//!
//! Container-backed tests need Docker and are marked
//! `#[ignore = "requires Docker"]`:
//!
//! ```bash
//! cargo test -p quake-server -- --ignored --nocapture
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    /// Start a PostgreSQL container and apply the workspace migrations
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }
}

// ============================================================================
// CSV fixtures
// ============================================================================

pub const USGS_HEADER: &str = "alert,cdi,code,detail,dmin,felt,gap,ids,mag,magType,mmi,net,nst,place,rms,sig,sources,status,time,title,tsunami,type,types,tz,updated,url";

/// Epoch milliseconds of the first fixture row
pub const BASE_TIME_MILLIS: i64 = 1_704_067_200_000;

/// A valid row; `n` varies place, source and time
pub fn usgs_row(n: usize, magnitude: &str) -> String {
    let mut cells = vec![String::new(); 26];
    cells[0] = if n % 2 == 0 { "green".into() } else { String::new() };
    cells[1] = "3.4".into();
    cells[5] = "12".into();
    cells[8] = magnitude.into();
    cells[9] = "ml".into();
    cells[13] = if n % 3 == 0 {
        format!("\"{}km SW of Volcano, Hawaii\"", n)
    } else {
        format!("\"{}km N of Ridgecrest, CA\"", n)
    };
    cells[15] = "250".into();
    cells[16] = format!("ci{}", n);
    cells[18] = (BASE_TIME_MILLIS + n as i64).to_string();
    cells[20] = "0".into();
    cells[21] = "earthquake".into();
    cells.join(",")
}

/// Write a partition file with the header and the given rows
pub fn write_partition_file(dir: &Path, name: &str, rows: &[String]) -> PathBuf {
    let mut body = String::from(USGS_HEADER);
    for row in rows {
        body.push('\n');
        body.push_str(row);
    }
    body.push('\n');

    let path = dir.join(name);
    std::fs::write(&path, body).unwrap_or_else(|e| panic!("cannot write {}: {}", path.display(), e));
    path
}

/// `count` valid rows numbered from `start`
pub fn valid_rows(start: usize, count: usize) -> Vec<String> {
    (start..start + count).map(|n| usgs_row(n, "4.5")).collect()
}

// ============================================================================
// Tracing
// ============================================================================

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,quake_server=debug,sqlx=warn,testcontainers=info")),
        )
        .with_test_writer()
        .try_init();
}
