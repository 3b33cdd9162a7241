//! Database connection and retry policy.

use backoff::{backoff::Backoff, ExponentialBackoff};
use std::{env, fs::read_to_string, process::{Command, Stdio}, time::Duration};

use crate::prelude::*;

/// How should we connect to the database (and to `flowd`)?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectVia {
    /// Assume we're connecting via a `kubectl proxy`, run from an operator's
    /// workstation. Failures are probably our fault (forgot to start the
    /// proxy), so don't retry.
    Proxy,
    /// Assume we're connecting via internal cluster networking and DNS.
    /// Transient failures here are normal (a pod restarting, a rolling
    /// upgrade), so retry with backoff.
    Cluster,
}

impl ConnectVia {
    /// Run `f`, retrying with exponential backoff if we're running
    /// `Cluster`-side and `f` fails. `Proxy`-side, run `f` exactly once.
    pub fn retry_if_appropriate<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        match self {
            ConnectVia::Proxy => f(),
            ConnectVia::Cluster => {
                let mut backoff = ExponentialBackoff {
                    initial_interval: Duration::from_millis(250),
                    max_interval: Duration::from_secs(10),
                    max_elapsed_time: Some(Duration::from_secs(60)),
                    ..ExponentialBackoff::default()
                };
                loop {
                    match f() {
                        Ok(value) => return Ok(value),
                        Err(err) => match backoff.next_backoff() {
                            Some(delay) => {
                                tracing::warn!(
                                    "retrying after error: {} (waiting {:?})",
                                    err,
                                    delay,
                                );
                                std::thread::sleep(delay);
                            }
                            None => return Err(err),
                        },
                    }
                }
            }
        }
    }
}

/// A Kubernetes secret (missing lots of fields).
#[derive(Debug, Deserialize)]
struct ControlPlaneSecret {
    data: ControlPlaneSecretData,
}

/// The data we store in our secret.
#[derive(Debug, Deserialize)]
struct ControlPlaneSecretData {
    #[serde(rename = "POSTGRES_PASSWORD")]
    postgres_password: String,
}

/// Look up our PostgreSQL password in our cluster's secret.
pub fn postgres_password(via: ConnectVia) -> Result<String> {
    match via {
        ConnectVia::Proxy => {
            tracing::trace!("fetching POSTGRES_PASSWORD from secret `flow-control-plane`");
            // Equivalent to:
            //
            // kubectl get secret flow-control-plane -o json |
            //     jq -r .data.POSTGRES_PASSWORD |
            //     base64 --decode
            let output = Command::new("kubectl")
                .args(["get", "secret", "flow-control-plane", "-o", "json"])
                .stderr(Stdio::inherit())
                .output()
                .context("could not fetch POSTGRES_PASSWORD from secret `flow-control-plane`")?;
            let secret: ControlPlaneSecret = serde_json::from_slice(&output.stdout)
                .context("error parsing secret `flow-control-plane`")?;
            let pw_bytes = base64::decode(&secret.data.postgres_password)
                .context("cannot decode POSTGRES_PASSWORD")?;
            String::from_utf8(pw_bytes).context("POSTGRES_PASSWORD must be valid UTF-8")
        }
        ConnectVia::Cluster => {
            // Mounted into our container from the same secret.
            read_to_string("/etc/flow/secrets/POSTGRES_PASSWORD")
                .context("could not read /etc/flow/secrets/POSTGRES_PASSWORD")
        }
    }
}

/// Get an appropriate database URL.
fn database_url(via: ConnectVia) -> Result<String> {
    // Check the environment first, so it can be overridden for testing
    // outside of a full cluster setup.
    if let Ok(database_url) = env::var("DATABASE_URL") {
        return Ok(database_url);
    }

    let password = postgres_password(via)?;
    match via {
        ConnectVia::Proxy => {
            Ok(format!("postgres://postgres:{}@localhost:5432/", password))
        }
        ConnectVia::Cluster => Ok(format!(
            "postgres://postgres:{}@flow-control-plane-postgres:5432/",
            password,
        )),
    }
}

/// Connect to PostgreSQL, our concrete realization of the TX-KV store.
pub fn connect(via: ConnectVia) -> Result<PgConnection> {
    let database_url = database_url(via)?;
    PgConnection::establish(&database_url)
        .with_context(|| format!("error connecting to {}", database_url))
}

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

/// Our embedded schema migrations, baked into the binary so `flowctl db
/// migrate` works without a checkout of this repo nearby.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Run any pending migrations, bringing the schema up to date.
pub fn run_pending_migrations(conn: &mut PgConnection) -> Result<()> {
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow::anyhow!("error running pending migrations: {}", err))?;
    Ok(())
}
