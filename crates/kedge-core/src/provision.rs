//! Per-kind provisioning strategies.
//!
//! Every provisioner has the same shape: ensure the backing dev service is
//! running (readiness marker observed in its logs), then perform a
//! kind-specific idempotent registration step. Duplicate-create errors
//! from the backend ("already exists") are swallowed at debug level; any
//! other failure propagates.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::paths;
use crate::readiness::{ReadinessEnsurer, ServiceSpec};
use crate::requirements::{RequirementKind, RequirementsDispatcher};
use crate::secrets::{next_database_index, SecretStore};

type Args = BTreeMap<String, String>;

const REDIS_SECRET_NAME: &str = "redis-urls";

pub(crate) fn provision(
    d: &RequirementsDispatcher<'_>,
    kind: RequirementKind,
    args: &Args,
) -> Result<()> {
    match kind {
        RequirementKind::Postgres => postgres(d, args),
        RequirementKind::Cockroachdb => cockroachdb(d, args),
        RequirementKind::Redis => redis(d, args),
        RequirementKind::Elastic => ensure_only(d, elastic_service(d)),
        RequirementKind::Pubsub => pubsub(d, args),
        RequirementKind::Cassandra => cassandra(d, args),
        RequirementKind::Rabbitmq => ensure_only(d, rabbitmq_service(d)),
    }
}

// ---------------------------------------------------------------------------
// Service catalog
// ---------------------------------------------------------------------------

/// Dev services are named containers; the name is the identity and the
/// in-cluster hostname. Images are overridable through context keys.
fn dev_service(
    d: &RequirementsDispatcher<'_>,
    name: &str,
    image_key: &str,
    default_image: &str,
    marker: &str,
) -> ServiceSpec {
    let image = d.context.get_str(image_key).unwrap_or(default_image);
    ServiceSpec::new(name, image, marker)
}

fn postgres_service(d: &RequirementsDispatcher<'_>) -> ServiceSpec {
    dev_service(
        d,
        "dev-postgres",
        "DEV_POSTGRES_IMAGE",
        "postgres:14",
        "PostgreSQL init process complete; ready for start up.",
    )
    // Postgres logs startup progress on stderr.
    .on_stderr()
}

fn cockroach_service(d: &RequirementsDispatcher<'_>) -> ServiceSpec {
    dev_service(
        d,
        "dev-cockroachdb",
        "DEV_COCKROACHDB_IMAGE",
        "cockroachdb/cockroach:latest-v23.1",
        "CockroachDB node starting",
    )
    .with_args(&["start-single-node", "--insecure"])
}

fn elastic_service(d: &RequirementsDispatcher<'_>) -> ServiceSpec {
    dev_service(
        d,
        "dev-elasticsearch",
        "DEV_ELASTICSEARCH_IMAGE",
        "elasticsearch:7.17.9",
        "] started",
    )
}

fn pubsub_service(d: &RequirementsDispatcher<'_>) -> ServiceSpec {
    dev_service(
        d,
        "dev-pubsub",
        "DEV_PUBSUB_IMAGE",
        "kedge/pubsub-emulator",
        "[pubsub] INFO: Server started, listening on",
    )
    // The emulator's Java logging goes to stderr.
    .on_stderr()
}

fn redis_service(d: &RequirementsDispatcher<'_>) -> ServiceSpec {
    dev_service(
        d,
        "dev-redis",
        "DEV_REDIS_IMAGE",
        "redis:7",
        "Ready to accept connections",
    )
}

fn cassandra_service(d: &RequirementsDispatcher<'_>) -> ServiceSpec {
    dev_service(
        d,
        "dev-cassandra",
        "DEV_CASSANDRA_IMAGE",
        "cassandra:4",
        "Created default superuser role 'cassandra'",
    )
}

fn rabbitmq_service(d: &RequirementsDispatcher<'_>) -> ServiceSpec {
    dev_service(
        d,
        "dev-rabbitmq",
        "DEV_RABBITMQ_IMAGE",
        "rabbitmq:3",
        "Starting RabbitMQ",
    )
}

// ---------------------------------------------------------------------------
// Provisioners
// ---------------------------------------------------------------------------

fn ensure(d: &RequirementsDispatcher<'_>, spec: &ServiceSpec) -> Result<()> {
    ReadinessEnsurer::with_wait(d.engine, d.wait).ensure(spec)
}

fn ensure_only(d: &RequirementsDispatcher<'_>, spec: ServiceSpec) -> Result<()> {
    ensure(d, &spec)
}

/// Target name for kinds that default to the logical service name.
fn target_name<'a>(d: &'a RequirementsDispatcher<'_>, args: &'a Args, key: &str) -> Result<&'a str> {
    match args.get(key) {
        Some(name) => Ok(name.as_str()),
        None => d.context.require_str("KUBE_SERVICE_NAME"),
    }
}

/// Swallow a duplicate-create rejection, propagate everything else.
fn idempotent_create<T>(
    result: Result<T>,
    needle: &str,
    what: &str,
    name: &str,
) -> Result<()> {
    match result {
        Ok(_) => {
            tracing::debug!("{what} \"{name}\" created");
            Ok(())
        }
        Err(e) if e.stderr_contains(needle) => {
            tracing::debug!("{what} \"{name}\" exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn postgres(d: &RequirementsDispatcher<'_>, args: &Args) -> Result<()> {
    let database = target_name(d, args, "name")?;
    let spec = postgres_service(d);
    ensure(d, &spec)?;
    tracing::debug!("ensuring that database \"{database}\" exists");
    let result = d
        .engine
        .exec(&spec.name, &["createdb", database, "-U", "postgres"]);
    idempotent_create(result, "already exists", "database", database)
}

fn cockroachdb(d: &RequirementsDispatcher<'_>, args: &Args) -> Result<()> {
    let database = target_name(d, args, "name")?;
    let spec = cockroach_service(d);
    ensure(d, &spec)?;
    tracing::debug!("ensuring that database \"{database}\" exists");
    let statement = format!("CREATE DATABASE \"{database}\";");
    let result = d.engine.exec(
        &spec.name,
        &["/cockroach/cockroach", "sql", "--insecure", "-e", &statement],
    );
    idempotent_create(result, "already exists", "database", database)
}

fn pubsub(d: &RequirementsDispatcher<'_>, args: &Args) -> Result<()> {
    let topic = target_name(d, args, "topic")?;
    let spec = pubsub_service(d);
    ensure(d, &spec)?;
    tracing::debug!("ensuring that topic \"{topic}\" exists");
    let result = d.engine.exec(&spec.name, &["pubsub_add_topic", topic]);
    idempotent_create(result, "Topic already exists", "topic", topic)?;
    match args.get("subscription") {
        None => {
            tracing::debug!("subscription not specified, it won't be created");
            Ok(())
        }
        Some(subscription) => {
            tracing::debug!("ensuring that subscription \"{subscription}\" exists");
            let result = d
                .engine
                .exec(&spec.name, &["pubsub_add_subscription", topic, subscription]);
            idempotent_create(
                result,
                "Subscription already exists",
                "subscription",
                subscription,
            )
        }
    }
}

fn cassandra(d: &RequirementsDispatcher<'_>, args: &Args) -> Result<()> {
    let keyspace = target_name(d, args, "keyspace")?;
    let keyspace = sanitize_keyspace_name(keyspace);
    let spec = cassandra_service(d);
    ensure(d, &spec)?;
    tracing::debug!("ensuring that keyspace \"{keyspace}\" exists");
    let query = format!(
        "create keyspace {keyspace} with replication = \
         {{'class': 'SimpleStrategy', 'replication_factor': 1}}"
    );
    let result = d.engine.exec(&spec.name, &["cqlsh", "-e", &query]);
    idempotent_create(result, "already exists", "keyspace", &keyspace)
}

/// Keyspace names cannot contain dashes; rewrite them to underscores and
/// warn so the caller knows the effective name.
pub(crate) fn sanitize_keyspace_name(original: &str) -> String {
    let cleaned = original.replace('-', "_");
    if cleaned != original {
        tracing::warn!(
            "keyspace name can't contain dashes (-), so it's been changed to: {cleaned}"
        );
    }
    cleaned
}

fn redis(d: &RequirementsDispatcher<'_>, args: &Args) -> Result<()> {
    let spec = redis_service(d);
    ensure(d, &spec)?;
    let secret_key = target_name(d, args, "name")?;
    let store = SecretStore::open(paths::secret_file(d.root, REDIS_SECRET_NAME));
    tracing::debug!("ensuring that secret key \"{secret_key}\" is present in file");
    let mapping = store.mapping()?;
    if mapping.contains_key(secret_key) {
        tracing::debug!("secret key is already present in file");
        return Ok(());
    }
    let index = next_database_index(&mapping);
    let url = format!("redis://{}:6379/{index}", spec.name);
    let mapping = store.set(secret_key, &url)?;
    tracing::debug!("secret key added to file, installing secret");
    d.installer.install(REDIS_SECRET_NAME, &mapping)
}
